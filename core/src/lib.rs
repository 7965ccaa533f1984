/// chatsync - client-side chat synchronization
///
/// Reconciles a request/response persistence API and a push channel into
/// one consistent view of conversations, messages, presence and typing
/// state, with optimistic sends that are reconciled or rolled back.

pub mod api;
pub mod cli_app;
pub mod config;
pub mod error;
pub mod messenger_types;
pub mod session;
pub mod sync;
pub mod transport;

pub use api::{ChatApi, HttpApi};
pub use config::ClientConfig;
pub use error::{ChatError, Result};
pub use session::Session;
pub use sync::{ChatState, SyncEngine, SyncHandle};
pub use transport::Transport;
