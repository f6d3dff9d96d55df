pub mod datastruct;
pub mod math;
