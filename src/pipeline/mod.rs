//! Inbound message pipeline.
//!
//! Every chat message flows through the [`processor::Orchestrator`]:
//! 1. `DedupGuard`: suppress rapid-fire duplicate greetings
//! 2. `IdentityResolver`: canonical address, alias link, role
//! 3. `IntentClassifier`: priority-ordered rule tiers (no LLM)
//! 4. `FlowEngine` / `CommandHandler` / AI responder behind `HealthMonitor`
//! 5. `DeliveryLayer`: text then attachments, retried and recorded

pub mod commands;
pub mod dedup;
pub mod fields;
pub mod flow;
pub mod health;
pub mod processor;
pub mod rules;
pub mod templates;
pub mod types;

pub use processor::Orchestrator;
pub use types::{InboundMessage, Intent, ProcessingOutcome, ProcessingResult};
