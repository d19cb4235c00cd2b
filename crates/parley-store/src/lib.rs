//! # parley-store
//!
//! Persistence for the Parley chat server.
//!
//! The realtime core talks to the [`ChatStore`] trait. Two implementations
//! ship with the crate: [`SqliteStore`], which wraps the synchronous
//! [`Database`] handle and its typed CRUD helpers, and [`MemoryStore`] for
//! tests and throwaway deployments.

pub mod channels;
pub mod database;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod sqlite;
pub mod store;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use models::*;
pub use sqlite::SqliteStore;
pub use store::ChatStore;
