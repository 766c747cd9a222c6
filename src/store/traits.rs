//! Store traits for WhatsApp protocol data persistence.

use thiserror::Error;

use crate::store::Device;
use crate::types::JID;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("corrupt device record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Device container for storing device data.
pub trait DeviceStore: Send + Sync {
    fn get_device(&self, jid: &JID) -> StoreResult<Option<Device>>;

    /// Persist a device. Devices without a JID are not stored.
    fn put_device(&self, device: &Device) -> StoreResult<()>;

    fn delete_device(&self, jid: &JID) -> StoreResult<()>;

    /// Get the first stored device, if any.
    fn get_first_device(&self) -> StoreResult<Option<Device>>;
}
