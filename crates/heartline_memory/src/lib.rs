pub mod in_memory;
pub mod session_manager;
pub mod sqlite;
pub mod store;
pub mod tracker;

pub use in_memory::InMemoryStore;
pub use session_manager::{ResolvedSession, SessionManager};
pub use sqlite::SqliteStore;
pub use store::{ConversationStore, StoreError, StoreResult, TurnCommit, TurnReceipt};
pub use tracker::{validate_identifier, DeltaOutcome, NicknameUpdate, RelationshipTracker};

#[cfg(test)]
mod tests;
