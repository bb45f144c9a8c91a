pub mod error;
pub mod executor;
pub mod partition;
pub mod reader;
pub mod retry;
