pub mod conversion;
pub mod diesel;
pub mod solar;
pub mod storage;
pub mod units;
