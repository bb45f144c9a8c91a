use std::sync::{Arc, OnceLock};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Signal::Interrupt => ExitCode::Interrupted,
            Signal::Terminate => ExitCode::Terminated,
        }
    }
}

/// Turns SIGINT / SIGTERM into a cancellation the job driver reacts to by
/// stopping the job cooperatively.
#[derive(Clone, Default)]
pub struct StopSignals {
    token: CancellationToken,
    received: Arc<OnceLock<Signal>>,
}

impl StopSignals {
    /// Installs the handlers on the current runtime.
    pub fn install() -> Self {
        let signals = Self::default();
        let listener = signals.clone();
        tokio::spawn(async move {
            let signal = wait_for_signal().await;
            info!(signal = ?signal, "Stop requested by signal");
            listener.trigger(signal);
        });
        signals
    }

    fn trigger(&self, signal: Signal) {
        let _ = self.received.set(signal);
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The first signal received, if any.
    pub fn received(&self) -> Option<Signal> {
        self.received.get().copied()
    }
}

async fn wait_for_signal() -> Signal {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => Signal::Interrupt,
        _ = terminate => Signal::Terminate,
    }
}

/// Process exit codes of `jobctl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    /// The driven job ended `failed`.
    JobFailed = 2,
    Interrupted = 130,
    Terminated = 143,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}
