pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;

pub use clients::{shared, SharedClients};
pub use config::MentorConfig;
pub use error::MentorError;
pub use history::{build_window, DialogueMode};
pub use llm::{
    ChatBackend, ChatClientConfig, ChatRequest, CompletionEvent, CompletionStream, LlmError,
    OpenAiChatClient, PromptMessage, PromptRole, RetryPolicy,
};
pub use models::{FeedbackRating, Message, Role, Session};
