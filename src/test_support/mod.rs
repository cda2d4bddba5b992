//! In-memory collaborators and an ephemeral Postgres for tests.

pub mod database;
pub mod fakes;

pub use database::{TestDatabase, TestDatabaseError};
pub use fakes::{
    CapturingSink, FakeDirectory, FakeSubscriptionApi, MemoryStore, RemoteCall, StoreCall,
};
