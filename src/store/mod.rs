//! Entity store interface and the in-memory store

pub mod memory;
pub mod models;
pub mod traits;

pub use memory::MemoryStore;
pub use models::*;
pub use traits::{ChangeObserver, EntityStore};
