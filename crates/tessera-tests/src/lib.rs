//! Tessera Test & Validation Infrastructure
//!
//! Export fixtures, a fault-injecting key/value table and end-to-end
//! scenarios that drive imports through the vault and read them back.

pub mod faults;
pub mod harness;

pub use faults::{FaultType, FaultyKvStore};
pub use harness::{acme_export, acme_spec, gzip, zeta_spec, ExportBuilder, TestVault, ACME_PROVIDER, ZETA_PROVIDER};

#[cfg(test)]
mod import_scenarios;
#[cfg(test)]
mod proptest_ingest;
