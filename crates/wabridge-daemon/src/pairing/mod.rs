//! Phone-code pairing of new identities.

mod coordinator;
mod types;

pub use coordinator::PairingCoordinator;
pub use types::{PairingCode, PairingPhase};
