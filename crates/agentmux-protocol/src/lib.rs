//! Shared protocol types for the agentmux session core.
//!
//! Everything that crosses a crate boundary lives here: identifiers, session
//! records, the application event type with its lane classification, the
//! terminal-session backend trait, and the shared error taxonomy.

pub mod backend;
pub mod error;
pub mod event;
pub mod ids;
pub mod session;

pub use backend::{BackendSession, SessionBackend, SessionProbe};
pub use error::{BackendError, BackendResult};
pub use event::{AppEvent, ErrorEvent, MessagePriority, SessionStoppedEvent, TabAction};
pub use ids::{TabId, WorkspaceId};
pub use session::{SessionTab, TabStatus, Workspace};
