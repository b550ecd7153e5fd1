//! `SQLite` storage for the wabridge daemon.
//!
//! Provides the identity catalog, legacy catalog import, dense id allocation
//! and per-operator app store binding.

mod alloc;
mod app_store;
mod legacy;
mod models;
mod registry;

pub use alloc::smallest_free_id;
pub use app_store::{AppStoreHandle, AppStores};
pub use models::*;
pub use registry::Registry;
