pub mod message;
pub mod session;

pub use message::{FeedbackRating, Message, Role};
pub use session::Session;
