/// Errors shared across every huddle crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("agent error: {0}")]
    Agent(String),

    /// The model gateway failed or cannot serve the request. Fatal for the turn.
    #[error("model gateway error: {0}")]
    Gateway(String),

    #[error("no tools available: supply credentials for at least one platform")]
    NoTools,

    /// Failure raised by a tool adapter. Displayed verbatim so the text can be
    /// folded into a tool result.
    #[error("{0}")]
    Tool(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid conversation history: {0}")]
    InvalidHistory(String),

    #[error("turn cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
