use engine_core::error::StoreError;
use model::{ledger::LedgerChange, unit::WorkUnit};
use tokio::sync::oneshot;

pub type LedgerReply = oneshot::Sender<Result<LedgerChange, StoreError>>;

/// Messages for the ledger writer actor.
///
/// Responsible for every ledger transition of every job run by this process.
#[derive(Debug)]
pub enum LedgerMsg {
    /// Advisory marker shown to observers while the executor call is out.
    InFlight { job_id: String, unit: WorkUnit },

    /// The executor reported success for `unit`. `pass` is the ledger
    /// generation the call was dispatched under.
    Success {
        job_id: String,
        pass: u32,
        unit: WorkUnit,
        items_processed: u64,
        reply: LedgerReply,
    },

    /// The executor call failed or the executor reported failure.
    Failure {
        job_id: String,
        pass: u32,
        unit: WorkUnit,
        error: String,
        reply: LedgerReply,
    },
}
