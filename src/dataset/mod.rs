pub mod example_store;
pub mod persistence;

pub use example_store::{ExampleStore, ShuffledProvider};
pub use persistence::{JsonFileStore, MemoryStore, PersistedExample, TrainingPersistence, SCHEMA_VERSION};
