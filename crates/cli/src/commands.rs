use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Register a job from a JSON definition file
    Create {
        #[arg(long, help = "Path to the JSON job definition")]
        definition: PathBuf,
    },
    /// Start a fresh run and drive it in the foreground
    Start {
        job_id: String,
    },
    /// Retry failed units, dispatch the remainder, or continue a cursor job
    Resume {
        job_id: String,
    },
    /// Flag a job as stopped. Live runs are stopped with Ctrl-C in their own terminal.
    Stop {
        job_id: String,
    },
    /// Discard all progress of a job (used to recover orphaned runs)
    Reset {
        job_id: String,
    },
    Status {
        job_id: String,

        #[arg(
            long,
            help = "If set, prints the job as JSON instead of a table"
        )]
        json: bool,
    },
    List {
        #[arg(long, help = "Only jobs whose schedule says they are due")]
        due: bool,

        #[arg(long, help = "Print as JSON")]
        json: bool,
    },
}
