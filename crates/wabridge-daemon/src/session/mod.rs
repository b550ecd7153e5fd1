//! Operator sessions.
//!
//! Maps each operator to the identity, client and app store their requests
//! run against.

mod cache;
mod types;

pub use cache::SessionCache;
pub use types::Session;
