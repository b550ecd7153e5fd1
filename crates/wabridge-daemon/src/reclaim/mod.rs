//! Reclamation of orphaned and stale per-identity storage.

mod reclaimer;
mod types;

pub use reclaimer::Reclaimer;
pub use types::{
    ActiveIdentities, NoActiveIdentities, OrphanReport, PruneReport, ValidationReport,
};
