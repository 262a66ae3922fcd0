use thiserror::Error;

#[derive(Error, Debug)]
pub enum MentorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LLM client error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("Shared client initialization failed: {0}")]
    ClientInit(String),

    #[error("Other error: {0}")]
    Other(String),
}
