//! Remote event store transports.
//!
//! Only the Firebase Realtime Database REST protocol is supported. The
//! in-memory store in `storage` covers tests and offline runs.

pub mod firebase;

pub use firebase::{FirebaseConfig, FirebaseStore};
