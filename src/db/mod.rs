//! Row-level access to the SQLite schema in `migrations/`.

pub mod message;
pub mod queue;
