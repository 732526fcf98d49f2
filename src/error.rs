use thiserror::Error;

// Enum for handling engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError), // Errors from the LLM gateway.

    #[error("Game error: {0}")]
    Game(#[from] GameError), // Errors specific to game logic or state.

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String), // Persistence backend failures; the turn still completes.

    #[error("No active session")]
    NoActiveSession, // A dialogue turn was requested with no NPC in play.

    #[error("Thread join error: {0}")]
    ThreadJoin(String),
}

// Enum for game-specific errors.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("Unknown NPC: {0}")]
    UnknownNpc(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

// Errors raised inside the LLM gateway. These never escape `process`: the
// gateway converts them to in-band marker strings, they only travel as
// values in stats records.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("OpenAI API error: {0}")]
    OpenAI(#[from] async_openai::error::OpenAIError),

    #[error("Missing API credentials")]
    ConfigMissing,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Call skipped: {0}")]
    Skipped(String), // Protocol guard refused to contact the provider.
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::ThreadJoin(err.to_string())
    }
}
