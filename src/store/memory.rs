//! In-memory store implementation for development and testing.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::store::{Device, DeviceStore, StoreError, StoreResult};
use crate::types::JID;

/// In-memory device store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<BTreeMap<String, Device>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceStore for MemoryStore {
    fn get_device(&self, jid: &JID) -> StoreResult<Option<Device>> {
        let devices = self.devices.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(devices.get(&jid.to_string()).cloned())
    }

    fn put_device(&self, device: &Device) -> StoreResult<()> {
        if let Some(ref jid) = device.id {
            let mut devices = self.devices.write().map_err(|_| StoreError::LockPoisoned)?;
            devices.insert(jid.to_string(), device.clone());
        }
        Ok(())
    }

    fn delete_device(&self, jid: &JID) -> StoreResult<()> {
        let mut devices = self.devices.write().map_err(|_| StoreError::LockPoisoned)?;
        devices.remove(&jid.to_string());
        Ok(())
    }

    fn get_first_device(&self) -> StoreResult<Option<Device>> {
        let devices = self.devices.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(devices.values().next().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaired_devices_are_not_stored() {
        let store = MemoryStore::new();
        store.put_device(&Device::generate()).unwrap();
        assert!(store.get_first_device().unwrap().is_none());
    }

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        let mut device = Device::generate();
        let jid: JID = "1234:2@s.whatsapp.net".parse().unwrap();
        device.id = Some(jid.clone());

        store.put_device(&device).unwrap();
        assert_eq!(store.get_device(&jid).unwrap(), Some(device.clone()));
        assert_eq!(store.get_first_device().unwrap(), Some(device));

        store.delete_device(&jid).unwrap();
        assert!(store.get_device(&jid).unwrap().is_none());
    }
}
