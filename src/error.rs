//! Error taxonomy for the synchronization engine

use crate::events::EntityKind;

/// Errors surfaced by the store, the bus adapters and the sync components.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Inbound payload is not well-formed for the target kind
    #[error("cannot decode {kind} payload: {reason}")]
    Decode { kind: EntityKind, reason: String },

    /// Record could not be rendered into its payload
    #[error("cannot encode {kind} payload: {reason}")]
    Encode { kind: EntityKind, reason: String },

    /// Principal lacks read or write permission on the target
    #[error("{username} is not allowed to {action} {kind} {id}")]
    AuthorizationDenied {
        username: String,
        action: &'static str,
        kind: EntityKind,
        id: String,
    },

    /// Referenced entity does not exist
    #[error("{kind} '{id}' does not exist")]
    NotFound { kind: EntityKind, id: String },

    /// Topic string does not match any known shape
    #[error("unrecognized topic '{0}'")]
    InvalidTopic(String),

    /// Call timestamps violate started_at <= ended_at
    #[error("invalid call {id}: {reason}")]
    InvalidCall { id: u64, reason: String },

    /// Bus unreachable, connection dropped, publish not acknowledged
    #[error("transport error: {0}")]
    Transport(String),

    /// Store-side failure that is not a missing record
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn decode(kind: EntityKind, reason: impl ToString) -> Self {
        Self::Decode {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn transport(reason: impl ToString) -> Self {
        Self::Transport(reason.to_string())
    }

    /// Whether a retry after reconnecting can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
