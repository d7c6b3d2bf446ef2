//! Chat Orchestrator: conversational message routing for chat channels.

pub mod channels;
pub mod config;
pub mod error;
pub mod identity;
pub mod llm;
pub mod pipeline;
pub mod store;
