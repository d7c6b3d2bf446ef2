//! Persistence layer: the storage collaborator and its backends.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{
    AliasLink, Conversation, ConversationPatch, ConversationStatus, Direction, LinkSource,
    MessageRecord, MessageStatus, NewConversation, NewMessage, Record, RecordDraft, RecordStats,
    RecordStatus, RecordUpdate, SenderKind, StaffMember, Storage, new_record_id,
};
