//! Change notifications and message bus transports
//!
//! This module provides:
//! - `ChangeEvent` — typed notification fired by the store after every commit
//! - `MessageBus` — topic-based transport with retained messages
//! - `MemoryBus` — in-process broker (local-only mode, tests)
//! - `NatsBus` — NATS transport, retained topics kept in a JetStream bucket

mod bus;
pub mod nats;
mod types;

pub use bus::{MemoryBus, MessageBus, Subscription};
pub use nats::{connect_nats, NatsBus};
pub use types::{BusMessage, ChangeEvent, CrudAction, Entity, EntityKind, QoS};
