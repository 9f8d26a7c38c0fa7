//! Persistent configuration for the RTP audio bridge
//!
//! Every runtime option lives in a single [`Config`] structure backed by a
//! typed key/value table in flash:
//! - typed getters and validated setters for each option
//! - atomic batch updates with exactly one flash commit
//! - field-group delta detection against a prior snapshot
//! - wipe-and-reseed recovery when the backing store is corrupt

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(any(feature = "std", test))]
extern crate std;

mod config;
mod delta;
mod store;
mod update;

pub use config::{Config, DeviceMode, Ipv4Address, NameString, SecretString};
pub use delta::ConfigDelta;
pub use store::{ConfigStore, ConfigStorage, StorageError};
pub use update::ConfigUpdate;

/// Errors returned by configuration operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Value rejected by validation; nothing was changed
    InvalidValue,
    /// String option longer than its field allows
    StringTooLong,
    /// Backing store failed and could not be re-initialized
    StorageUnusable,
    /// Serialized table does not fit the reserved flash record
    RecordTooLarge,
    /// Commit to the backing store failed; in-memory state unchanged
    CommitFailed,
}
