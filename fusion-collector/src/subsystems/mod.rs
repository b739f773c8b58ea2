pub mod cloudwatch;
pub mod harvest;
pub mod store;
