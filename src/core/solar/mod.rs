pub mod performance;
pub mod regression;
pub mod thermal_loop;
