//! # scoresync-collab — Real-time collaborative editing for shared scripts
//!
//! Client-side synchronization core for a centrally sequenced, operational
//! transform (OT) collaboration service. Several users edit one script; a
//! central server orders every edit with a per-session state counter and
//! each client transforms concurrent edits so all replicas converge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON over WebSocket  ┌─────────────┐
//! │ SyncClient  │ ◄────────────────────► │   central   │
//! │ (tokio task)│                        │  sequencer  │
//! └──────┬──────┘                        └─────────────┘
//!        │ frames, commands, timers
//!        ▼
//! ┌─────────────┐  transform()  ┌─────────────┐
//! │CollabEngine │ ────────────► │ EditBuffer  │
//! │  (sans-IO)  │               │(1 in flight)│
//! └──────┬──────┘               └─────────────┘
//!        │ apply / set_text
//!        ▼
//! ┌─────────────┐
//! │DocumentSink │
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Insert / Remove / Multi edits and their JSON form
//! - [`transform`] — OT case table
//! - [`protocol`] — Wire envelope and action enums
//! - [`document`] — Text buffer abstraction
//! - [`session`] — Phase, roster, state counter
//! - [`buffer`] — Unacknowledged local edits
//! - [`timers`] — Ack, sync and drift-check deadlines
//! - [`engine`] — Dispatch and the edit paths
//! - [`reconcile`] — Rejoin, resync, drift check, offline fallback
//! - [`presence`] — Cursors and selections
//! - [`client`] — WebSocket driver

pub mod buffer;
pub mod client;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod timers;
pub mod transform;

// Re-exports for convenience
pub use buffer::{EditBuffer, PendingEdit};
pub use client::{Snapshot, SyncClient, SyncEvent};
pub use config::{ClientConfig, SessionConfig};
pub use document::{DocumentSink, TextDocument};
pub use engine::{CollabEngine, JoinAck, NotifyLevel, SessionEvent};
pub use error::{Result, SyncError};
pub use operation::Operation;
pub use presence::{MarkerKind, PresenceRelay, RemoteMarker};
pub use protocol::{
    ClientAction, ClientMessage, Header, ProtocolError, ServerAction, ServerMessage,
};
pub use session::{Member, Phase, Roster, ScriptInfo, Session};
pub use transform::{transform, TransformGap};
