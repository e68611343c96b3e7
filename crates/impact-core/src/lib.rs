//! Shared contracts for the data-protection core: live collection access,
//! the live-data lock, and cooperative cancellation.
//! Kept dependency-light so every other crate can build on it.

pub mod cancel;
pub mod lock;
pub mod storage;

pub use cancel::CancelToken;
pub use lock::{LiveDataGuard, LiveDataLock};
pub use storage::{CollectionStore, Document, InMemoryStore, StoreError};
