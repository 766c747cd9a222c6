//! SQLite device store.

use std::path::Path;
use std::sync::Mutex;

use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::crypto::{KeyPair, PreKey};
use crate::store::{Device, DeviceStore, StoreError, StoreResult};
use crate::types::JID;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS devices (
    jid                TEXT PRIMARY KEY NOT NULL,
    registration_id    INTEGER NOT NULL,
    noise_key          BLOB NOT NULL CHECK ( length(noise_key) = 32 ),
    identity_key       BLOB NOT NULL CHECK ( length(identity_key) = 32 ),
    signed_pre_key     BLOB NOT NULL CHECK ( length(signed_pre_key) = 32 ),
    signed_pre_key_id  INTEGER NOT NULL,
    signed_pre_key_sig BLOB CHECK ( length(signed_pre_key_sig) = 64 ),
    adv_key            BLOB NOT NULL CHECK ( length(adv_key) = 32 ),
    platform           TEXT NOT NULL DEFAULT '',
    business_name      TEXT NOT NULL DEFAULT '',
    push_name          TEXT
);";

const SELECT_DEVICE: &str = "SELECT jid, registration_id, noise_key, identity_key, signed_pre_key,
    signed_pre_key_id, signed_pre_key_sig, adv_key, platform, business_name, push_name
    FROM devices";

/// Device store backed by a SQLite file.
///
/// Private keys are stored; public keys are derived again on load.
pub struct SqlStore {
    conn: Mutex<Connection>,
}

impl SqlStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened device store at {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_one(&self, sql: &str, params: impl rusqlite::Params) -> StoreResult<Option<Device>> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let row = conn.query_row(sql, params, DeviceRow::from_row).optional()?;
        row.map(DeviceRow::into_device).transpose()
    }
}

/// Raw column values before length checks.
struct DeviceRow {
    jid: String,
    registration_id: u32,
    noise_key: Vec<u8>,
    identity_key: Vec<u8>,
    signed_pre_key: Vec<u8>,
    signed_pre_key_id: u32,
    signed_pre_key_sig: Option<Vec<u8>>,
    adv_key: Vec<u8>,
    platform: String,
    business_name: String,
    push_name: Option<String>,
}

impl DeviceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            jid: row.get(0)?,
            registration_id: row.get(1)?,
            noise_key: row.get(2)?,
            identity_key: row.get(3)?,
            signed_pre_key: row.get(4)?,
            signed_pre_key_id: row.get(5)?,
            signed_pre_key_sig: row.get(6)?,
            adv_key: row.get(7)?,
            platform: row.get(8)?,
            business_name: row.get(9)?,
            push_name: row.get(10)?,
        })
    }

    fn into_device(self) -> StoreResult<Device> {
        let jid: JID = self
            .jid
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        let signature = self
            .signed_pre_key_sig
            .map(|sig| fixed::<64>(&sig, "signed_pre_key_sig"))
            .transpose()?;

        Ok(Device {
            noise_key: KeyPair::from_private_key(fixed(&self.noise_key, "noise_key")?),
            identity_key: KeyPair::from_private_key(fixed(&self.identity_key, "identity_key")?),
            signed_pre_key: PreKey {
                key_pair: KeyPair::from_private_key(fixed(&self.signed_pre_key, "signed_pre_key")?),
                key_id: self.signed_pre_key_id,
                signature,
            },
            registration_id: self.registration_id,
            adv_secret_key: fixed(&self.adv_key, "adv_key")?,
            id: Some(jid),
            platform: self.platform,
            business_name: self.business_name,
            push_name: self.push_name,
        })
    }
}

fn fixed<const N: usize>(bytes: &[u8], column: &str) -> StoreResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("{column} has {} bytes", bytes.len())))
}

impl DeviceStore for SqlStore {
    fn get_device(&self, jid: &JID) -> StoreResult<Option<Device>> {
        self.query_one(&format!("{SELECT_DEVICE} WHERE jid = ?1"), [jid.to_string()])
    }

    fn put_device(&self, device: &Device) -> StoreResult<()> {
        let Some(jid) = &device.id else {
            return Ok(());
        };
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO devices (jid, registration_id, noise_key, identity_key,
                signed_pre_key, signed_pre_key_id, signed_pre_key_sig, adv_key, platform,
                business_name, push_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                jid.to_string(),
                device.registration_id,
                &device.noise_key.private[..],
                &device.identity_key.private[..],
                &device.signed_pre_key.key_pair.private[..],
                device.signed_pre_key.key_id,
                device.signed_pre_key.signature.as_ref().map(|s| &s[..]),
                &device.adv_secret_key[..],
                device.platform,
                device.business_name,
                device.push_name,
            ],
        )?;
        Ok(())
    }

    fn delete_device(&self, jid: &JID) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute("DELETE FROM devices WHERE jid = ?1", [jid.to_string()])?;
        Ok(())
    }

    fn get_first_device(&self) -> StoreResult<Option<Device>> {
        self.query_one(&format!("{SELECT_DEVICE} ORDER BY rowid LIMIT 1"), params![])
    }
}
