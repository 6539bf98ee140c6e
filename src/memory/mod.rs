//! 记忆层：消息类型与长期记忆存储

pub mod message;
pub mod store;

pub use message::{Message, Role};
pub use store::{InMemoryMemoryStore, MemoryKind, MemoryRecord, MemoryStore, NoopMemory};
