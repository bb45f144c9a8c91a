use engine_config::settings::error::SettingsError;
use engine_runtime::error::OrchestratorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Failed to read file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse the job definition as JSON: {0}")]
    DefinitionParse(#[from] serde_json::Error),

    #[error("Failed to serialize data to JSON: {0}")]
    JsonSerialize(serde_json::Error),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to open state store: {0}")]
    StateStore(String),

    #[error("Shutdown requested")]
    ShutdownRequested,
}
