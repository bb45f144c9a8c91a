pub mod actor;
pub mod cursor_loop;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod poller;

#[cfg(test)]
mod tests;
