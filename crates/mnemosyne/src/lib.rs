//! Mnemosyne - Long-term conversational memory for chat agents
//!
//! This crate maintains per-session conversation state, retrieves relevant
//! long-term memories into outgoing requests, and condenses finished
//! exchanges into stored memories on count and idle-time triggers.

pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod prompt;
pub mod retrieval;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod summarizer;
pub mod testing;

pub use config::Config;
pub use engine::MemoryEngine;
pub use error::MnemosyneError;
