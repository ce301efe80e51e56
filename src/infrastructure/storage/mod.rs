//! Storage adapters: in-memory and SQLite, plus the caching factory.

pub mod factory;
pub mod memory;
pub mod sqlite;

pub use factory::{PersistorFactory, PersistorKind, PersistorSpec};
pub use memory::{InMemoryPersistor, InMemoryStorage};
pub use sqlite::SqlitePersistor;
