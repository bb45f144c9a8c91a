pub mod cursor;
pub mod events;
pub mod job;
pub mod ledger;
pub mod schedule;
pub mod unit;
