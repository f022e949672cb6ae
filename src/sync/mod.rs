//! Store ↔ bus synchronization
//!
//! - [`topics`]: topic shapes, payload encoding, command decoding
//! - [`permissions`]: readable/writable id sets per principal
//! - [`publisher`]: republishes committed store changes as retained messages
//! - [`seeder`]: full snapshot of a principal's visible state
//! - [`commands`]: inbound command pipeline
//! - [`session`]: per-principal connection state machine
//! - [`history`]: call-scoped ambulance history

pub mod commands;
pub mod history;
pub mod permissions;
pub mod publisher;
pub mod seeder;
pub mod session;
pub mod topics;

pub use commands::{CommandOutcome, CommandProcessor};
pub use history::{active_windows, ActiveWindow, HistoryResolver};
pub use permissions::PermissionResolver;
pub use publisher::{current_publication, publications_for, OutboundPublisher, Publication, PublishGate};
pub use seeder::{SeedReport, Seeder};
pub use session::{Session, SessionConfig, SessionHandle, SessionState, SessionStatus};
pub use topics::{CommandTarget, Topic};
