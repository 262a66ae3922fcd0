//! Tutoring service: admission-gated streaming chat over owner-scoped
//! transcripts.

pub mod admission;
pub mod auth;
pub mod chat;
pub mod http;
pub mod store;
