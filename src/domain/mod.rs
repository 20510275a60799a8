pub mod balance;
pub mod event;
pub mod scheduled;
pub mod transaction;
