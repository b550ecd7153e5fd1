//! wabridge Daemon Library
//!
//! Multi-identity session and resource manager for the WhatsApp bridge:
//! - SQLite identity catalog with dense id reuse and legacy import
//! - Client pool with one live protocol client per identity
//! - Per-operator session cache and event dispatch
//! - Phone-code pairing of new identities
//! - Reclamation of orphaned and stale per-identity storage
//! - Bulk jobs that survive reconnects and identity churn

pub mod bridge;
pub mod detached;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod pairing;
pub mod pool;
pub mod reclaim;
pub mod session;
pub mod storage;
pub mod usage;

pub use bridge::Bridge;
pub use error::{BridgeError, BridgeResult};
