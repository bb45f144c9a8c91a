use crate::settings::{error::SettingsError, validator::SettingsValidator};
use serde::Serialize;
use std::{collections::HashMap, path::PathBuf, str::FromStr, time::Duration};

pub mod error;
pub mod validator;

/// How the dispatcher paces executor invocations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchPolicy {
    /// Units started per batch window.
    pub batch_size: usize,
    /// Delay between individual dispatch starts inside a window.
    pub stagger: Duration,
    /// Delay between two batch windows.
    pub batch_delay: Duration,
    /// Upper bound on executor calls in flight at once.
    pub max_concurrent: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 10,
            stagger: Duration::from_millis(500),
            batch_delay: Duration::from_secs(5),
            max_concurrent: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollerSettings {
    pub interval: Duration,
    /// Wall-clock limit after which a non-converged job is left orphaned.
    pub ceiling: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            ceiling: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorLoopSettings {
    pub batch_size: u32,
    /// Throttle between successful iterations.
    pub pacing: Duration,
    /// Calls per iteration, including the first one.
    pub retry_attempts: usize,
    pub retry_delay: Duration,
    /// Consecutive empty batches treated as a stall.
    pub max_empty_batches: u32,
    /// Safety valve on iterations per run.
    pub max_batches: u64,
}

impl Default for CursorLoopSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pacing: Duration::from_secs(2),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            max_empty_batches: 3,
            max_batches: 10_000,
        }
    }
}

/// Terminal status of a converged partitioned job that has failed units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum FailurePolicy {
    /// `completed`, with a note carrying the failed-unit count.
    #[default]
    CompleteWithNote,
    /// `failed`, with the failed-unit count in `last_error`.
    Fail,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "complete" | "complete_with_note" | "completed" => Ok(FailurePolicy::CompleteWithNote),
            "fail" | "failed" => Ok(FailurePolicy::Fail),
            other => Err(format!("expected 'complete' or 'fail', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ExecutorEndpoints {
    pub unit_url: Option<String>,
    pub cursor_url: Option<String>,
    pub auth_token: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct OrchestratorSettings {
    pub dispatch: DispatchPolicy,
    pub poller: PollerSettings,
    pub cursor: CursorLoopSettings,
    pub failure_policy: FailurePolicy,
    pub executors: ExecutorEndpoints,
    pub state_dir: Option<PathBuf>,
}

impl OrchestratorSettings {
    /// Builds settings from `JOBS_*` variables, falling back to defaults for
    /// anything unset, then validates the result.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, SettingsError> {
        let reader = VarReader { vars };
        let defaults = OrchestratorSettings::default();

        let settings = OrchestratorSettings {
            dispatch: DispatchPolicy {
                batch_size: reader.parse("JOBS_DISPATCH_BATCH_SIZE", defaults.dispatch.batch_size)?,
                stagger: reader.millis("JOBS_DISPATCH_STAGGER_MS", defaults.dispatch.stagger)?,
                batch_delay: reader
                    .millis("JOBS_DISPATCH_BATCH_DELAY_MS", defaults.dispatch.batch_delay)?,
                max_concurrent: reader
                    .parse("JOBS_DISPATCH_MAX_CONCURRENT", defaults.dispatch.max_concurrent)?,
            },
            poller: PollerSettings {
                interval: reader.millis("JOBS_POLL_INTERVAL_MS", defaults.poller.interval)?,
                ceiling: reader.secs("JOBS_POLL_CEILING_SECS", defaults.poller.ceiling)?,
            },
            cursor: CursorLoopSettings {
                batch_size: reader.parse("JOBS_CURSOR_BATCH_SIZE", defaults.cursor.batch_size)?,
                pacing: reader.millis("JOBS_CURSOR_PACING_MS", defaults.cursor.pacing)?,
                retry_attempts: reader
                    .parse("JOBS_CURSOR_RETRY_ATTEMPTS", defaults.cursor.retry_attempts)?,
                retry_delay: reader
                    .millis("JOBS_CURSOR_RETRY_DELAY_MS", defaults.cursor.retry_delay)?,
                max_empty_batches: reader
                    .parse("JOBS_CURSOR_MAX_EMPTY_BATCHES", defaults.cursor.max_empty_batches)?,
                max_batches: reader.parse("JOBS_CURSOR_MAX_BATCHES", defaults.cursor.max_batches)?,
            },
            failure_policy: reader.parse("JOBS_FAILURE_POLICY", defaults.failure_policy)?,
            executors: ExecutorEndpoints {
                unit_url: reader.string("JOBS_UNIT_EXECUTOR_URL"),
                cursor_url: reader.string("JOBS_CURSOR_EXECUTOR_URL"),
                auth_token: reader.string("JOBS_EXECUTOR_TOKEN"),
                timeout: match reader.string("JOBS_EXECUTOR_TIMEOUT_SECS") {
                    Some(_) => Some(reader.secs("JOBS_EXECUTOR_TIMEOUT_SECS", Duration::ZERO)?),
                    None => None,
                },
            },
            state_dir: reader.string("JOBS_STATE_DIR").map(PathBuf::from),
        };

        SettingsValidator::new().validate(&settings)?;
        Ok(settings)
    }
}

struct VarReader<'a> {
    vars: &'a HashMap<String, String>,
}

impl VarReader<'_> {
    fn string(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, SettingsError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        match self.string(key) {
            Some(raw) => raw.parse::<T>().map_err(|e| SettingsError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, SettingsError> {
        let ms = self.parse::<u64>(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, SettingsError> {
        let secs = self.parse::<u64>(key, default.as_secs())?;
        Ok(Duration::from_secs(secs))
    }
}
