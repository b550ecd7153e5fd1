//! Client pool: one live protocol client per identity.

mod manager;
mod types;

pub(crate) use manager::connect_within;
pub use manager::ClientPool;
pub use types::{DestroyOutcome, PooledClient};
