use thiserror::Error;

/// Errors raised when loading or validating orchestrator settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A variable was present but could not be parsed.
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// One or more settings violate their constraints.
    #[error("Settings validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),
}
