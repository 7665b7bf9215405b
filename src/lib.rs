//! tokyo-chat - terminal chat front-end for a local Ollama server

pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod markdown;
pub mod models;
pub mod session;
pub mod timer;
pub mod transcript;
pub mod ui;

pub use client::{ModelBackend, OllamaClient, StreamEvent};
pub use error::ChatError;
pub use session::{Phase, SessionController, SessionEvent};
pub use transcript::{Transcript, TranscriptSink};
