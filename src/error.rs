use thiserror::Error;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("`{0}` not found on PATH")]
    ToolMissing(&'static str),

    #[error("`{tool}` exited with an error: {stderr}")]
    ToolFailed { tool: &'static str, stderr: String },

    #[error("unsupported connection policy `{0}`")]
    InvalidPolicy(String),

    #[error("`{0}` is not a valid interface identifier")]
    InvalidIdentifier(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}
