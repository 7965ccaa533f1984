/// Synchronization orchestrator and the state it owns
pub mod engine;
pub mod handle;
pub mod state;
pub mod typing;

pub use engine::{Command, Completion, Event, Flow, PushChannel, SyncEngine};
pub use handle::SyncHandle;
pub use state::{ChatState, PaginationCursor};
pub use typing::TypingTimers;
