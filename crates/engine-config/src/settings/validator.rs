use crate::settings::{OrchestratorSettings, error::SettingsError};
use tracing::{info, warn};

/// Checks cross-field constraints that parsing alone cannot express.
#[derive(Debug, Default)]
pub struct SettingsValidator;

impl SettingsValidator {
    pub fn new() -> Self {
        SettingsValidator
    }

    pub fn validate(&self, settings: &OrchestratorSettings) -> Result<(), SettingsError> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_dispatch(settings, &mut errors);
        self.validate_poller(settings, &mut errors);
        self.validate_cursor(settings, &mut errors);
        self.validate_executors(settings, &mut errors);

        if !errors.is_empty() {
            return Err(SettingsError::ValidationFailed(errors));
        }

        info!(
            dispatch_batch = settings.dispatch.batch_size,
            max_concurrent = settings.dispatch.max_concurrent,
            poll_interval_ms = settings.poller.interval.as_millis() as u64,
            poll_ceiling_secs = settings.poller.ceiling.as_secs(),
            "Settings validation completed successfully"
        );
        Ok(())
    }

    fn validate_dispatch(&self, settings: &OrchestratorSettings, errors: &mut Vec<String>) {
        let dispatch = &settings.dispatch;
        if dispatch.batch_size == 0 {
            errors.push("dispatch batch size must be at least 1".to_string());
        }
        if dispatch.max_concurrent == 0 {
            errors.push("dispatch max_concurrent must be at least 1".to_string());
        }
        if dispatch.max_concurrent < dispatch.batch_size {
            warn!(
                batch_size = dispatch.batch_size,
                max_concurrent = dispatch.max_concurrent,
                "Batch windows are larger than the concurrency cap; dispatch starts will queue"
            );
        }
    }

    fn validate_poller(&self, settings: &OrchestratorSettings, errors: &mut Vec<String>) {
        let poller = &settings.poller;
        if poller.interval.is_zero() {
            errors.push("poll interval must be greater than zero".to_string());
        }
        if poller.ceiling < poller.interval {
            errors.push("poll ceiling must not be shorter than the poll interval".to_string());
        }
    }

    fn validate_cursor(&self, settings: &OrchestratorSettings, errors: &mut Vec<String>) {
        let cursor = &settings.cursor;
        if cursor.batch_size == 0 {
            errors.push("cursor batch size must be at least 1".to_string());
        }
        if cursor.retry_attempts == 0 {
            errors.push("cursor retry attempts must be at least 1".to_string());
        }
        if cursor.max_empty_batches == 0 {
            errors.push("cursor max empty batches must be at least 1".to_string());
        }
        if cursor.max_batches == 0 {
            errors.push("cursor max batches must be at least 1".to_string());
        }
        if cursor.batch_size > 10_000 {
            warn!(
                batch_size = cursor.batch_size,
                "Cursor batch size is very large, executor calls may time out"
            );
        }
    }

    fn validate_executors(&self, settings: &OrchestratorSettings, errors: &mut Vec<String>) {
        let endpoints = [
            ("unit executor url", &settings.executors.unit_url),
            ("cursor executor url", &settings.executors.cursor_url),
        ];
        for (label, url) in endpoints {
            if let Some(url) = url
                && !(url.starts_with("http://") || url.starts_with("https://"))
            {
                errors.push(format!("{label} must be an http(s) URL, got '{url}'"));
            }
        }
        if settings.executors.timeout.is_some_and(|t| t.is_zero()) {
            errors.push("executor timeout must be greater than zero".to_string());
        }
    }
}
