pub mod battery;
pub mod water_tank;
