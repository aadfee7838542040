pub mod mapper;
pub mod ndbc;
