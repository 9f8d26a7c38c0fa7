//! Flash-backed store for the typed key/value configuration table
//!
//! The whole table is serialized with postcard behind a magic/version/CRC32
//! header into one reserved flash record. A load tolerates missing keys
//! (defaults apply) and erases-and-reseeds on any corruption.

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::config::{Config, DeviceMode};
use crate::{ConfigError, ConfigUpdate};

/// Size of the serialized record the backing store must accommodate
pub const RECORD_CAPACITY: usize = 1024;

/// Record magic, "RBCF"
const MAGIC: [u8; 4] = *b"RBCF";

/// Record layout version
const VERSION: u8 = 1;

/// Header: magic + version + payload length + CRC32 of the payload
const HEADER_LEN: usize = 4 + 1 + 2 + 4;

const MAX_ENTRIES: usize = 36;
const MAX_KEY_LEN: usize = 12;

/// Errors surfaced by a [`ConfigStorage`] backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// Read from the backing medium failed
    Read,
    /// Write to the backing medium failed
    Write,
    /// Erase of the backing medium failed
    Erase,
}

/// Backing medium for the configuration record
///
/// Implemented over the reserved flash sector on hardware and over a RAM
/// buffer in tests.
pub trait ConfigStorage {
    /// Read the stored record into `buf`, returning the stored length
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;
    /// Replace the stored record
    fn write(&mut self, record: &[u8]) -> Result<(), StorageError>;
    /// Erase the record entirely
    fn erase(&mut self) -> Result<(), StorageError>;
}

/// Option keys as persisted
mod keys {
    pub const PORT: &str = "port";
    pub const HOSTNAME: &str = "host";
    pub const DEVICE_MODE: &str = "mode";
    pub const SAMPLE_RATE: &str = "srate";
    pub const BIT_DEPTH: &str = "bits";
    pub const VOLUME: &str = "vol";
    pub const BUF_INITIAL: &str = "buf_init";
    pub const BUF_GROW_STEP: &str = "buf_step";
    pub const BUF_MAX: &str = "buf_max";
    pub const BUF_MAX_GROW: &str = "buf_grow";
    pub const SPDIF_PIN: &str = "spdif_pin";
    pub const SILENCE_MS: &str = "silence_ms";
    pub const NET_CHECK_MS: &str = "net_chk_ms";
    pub const NET_IDLE_MS: &str = "net_idle_ms";
    pub const ACTIVITY_PKTS: &str = "act_pkts";
    pub const SILENCE_AMP: &str = "sil_amp";
    pub const DEST_IP: &str = "dst_ip";
    pub const DEST_PORT: &str = "dst_port";
    pub const AP_SSID: &str = "ap_ssid";
    pub const AP_PASSWORD: &str = "ap_pass";
    pub const HIDE_AP: &str = "hide_ap";
    pub const DIRECT_WRITE: &str = "direct_wr";
    pub const MDNS: &str = "mdns";
    pub const AUTO_SELECT: &str = "auto_sel";
    pub const WIZARD_DONE: &str = "wizard";
    pub const DISCOVERY_MS: &str = "disc_ms";
    pub const SAP_NAME: &str = "sap_name";
    pub const USB_SENDER: &str = "usb_tx";
    pub const SPDIF_SENDER: &str = "spdif_tx";
}

/// One typed value in the persisted table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    Bool(bool),
    Str(String<63>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    key: String<MAX_KEY_LEN>,
    value: Value,
}

type Table = Vec<Entry, MAX_ENTRIES>;

fn push_entry(table: &mut Table, key: &str, value: Value) -> Result<(), ConfigError> {
    let key = String::try_from(key).map_err(|_| ConfigError::RecordTooLarge)?;
    table
        .push(Entry { key, value })
        .map_err(|_| ConfigError::RecordTooLarge)
}

fn str_value(s: &str) -> Value {
    let mut out = String::new();
    // All persisted strings are field-validated to 63 bytes or less.
    let _ = out.push_str(s);
    Value::Str(out)
}

fn table_from_config(cfg: &Config) -> Result<Table, ConfigError> {
    let mut dotted: String<63> = String::new();
    let _ = core::fmt::write(
        &mut dotted,
        format_args!("{}", cfg.sender_destination_ip),
    );

    let mut t = Table::new();
    push_entry(&mut t, keys::PORT, Value::U16(cfg.port))?;
    push_entry(&mut t, keys::HOSTNAME, str_value(&cfg.hostname))?;
    push_entry(&mut t, keys::DEVICE_MODE, Value::U8(cfg.device_mode.as_u8()))?;
    push_entry(&mut t, keys::SAMPLE_RATE, Value::U32(cfg.sample_rate))?;
    push_entry(&mut t, keys::BIT_DEPTH, Value::U8(cfg.bit_depth))?;
    push_entry(&mut t, keys::VOLUME, Value::U8(cfg.volume_percent))?;
    push_entry(&mut t, keys::BUF_INITIAL, Value::U8(cfg.initial_buffer_size))?;
    push_entry(&mut t, keys::BUF_GROW_STEP, Value::U8(cfg.buffer_grow_step_size))?;
    push_entry(&mut t, keys::BUF_MAX, Value::U8(cfg.max_buffer_size))?;
    push_entry(&mut t, keys::BUF_MAX_GROW, Value::U8(cfg.max_grow_size))?;
    push_entry(&mut t, keys::SPDIF_PIN, Value::U8(cfg.spdif_data_pin))?;
    push_entry(&mut t, keys::SILENCE_MS, Value::U32(cfg.silence_threshold_ms))?;
    push_entry(&mut t, keys::NET_CHECK_MS, Value::U32(cfg.network_check_interval_ms))?;
    push_entry(&mut t, keys::NET_IDLE_MS, Value::U32(cfg.network_inactivity_timeout_ms))?;
    push_entry(&mut t, keys::ACTIVITY_PKTS, Value::U8(cfg.activity_threshold_packets))?;
    push_entry(&mut t, keys::SILENCE_AMP, Value::U16(cfg.silence_amplitude_threshold))?;
    push_entry(&mut t, keys::DEST_IP, str_value(&dotted))?;
    push_entry(&mut t, keys::DEST_PORT, Value::U16(cfg.sender_destination_port))?;
    push_entry(&mut t, keys::AP_SSID, str_value(&cfg.ap_ssid))?;
    push_entry(&mut t, keys::AP_PASSWORD, str_value(&cfg.ap_password))?;
    push_entry(&mut t, keys::HIDE_AP, Value::Bool(cfg.hide_ap_when_connected))?;
    push_entry(&mut t, keys::DIRECT_WRITE, Value::Bool(cfg.use_direct_write))?;
    push_entry(&mut t, keys::MDNS, Value::Bool(cfg.enable_mdns_discovery))?;
    push_entry(&mut t, keys::AUTO_SELECT, Value::Bool(cfg.auto_select_best_device))?;
    push_entry(&mut t, keys::WIZARD_DONE, Value::Bool(cfg.setup_wizard_completed))?;
    push_entry(&mut t, keys::DISCOVERY_MS, Value::U32(cfg.discovery_interval_ms))?;
    push_entry(&mut t, keys::SAP_NAME, str_value(&cfg.sap_stream_name))?;
    push_entry(&mut t, keys::USB_SENDER, Value::Bool(cfg.enable_usb_sender))?;
    push_entry(&mut t, keys::SPDIF_SENDER, Value::Bool(cfg.enable_spdif_sender))?;
    Ok(t)
}

/// Overlay a persisted table on the defaults
///
/// Unknown keys and type mismatches are skipped; out-of-range values are
/// clamped or fall back to the default. A table without a `mode` entry is a
/// pre-mode firmware image: derive the mode from the legacy sender flags.
fn config_from_table(table: &Table) -> Config {
    let mut cfg = Config::default();
    let mut saw_mode = false;
    let mut legacy_usb = false;
    let mut legacy_spdif = false;

    for entry in table.iter() {
        match (entry.key.as_str(), &entry.value) {
            (keys::PORT, Value::U16(v)) => {
                let _ = cfg.set_port(*v);
            }
            (keys::HOSTNAME, Value::Str(v)) => {
                let _ = cfg.set_hostname(v);
            }
            (keys::DEVICE_MODE, Value::U8(v)) => {
                if let Some(mode) = DeviceMode::from_u8(*v) {
                    cfg.set_device_mode(mode);
                    saw_mode = true;
                }
            }
            (keys::SAMPLE_RATE, Value::U32(v)) => {
                let _ = cfg.set_sample_rate(*v);
            }
            (keys::BIT_DEPTH, Value::U8(v)) => {
                let _ = cfg.set_bit_depth(*v);
            }
            (keys::VOLUME, Value::U8(v)) => cfg.volume_percent = (*v).min(100),
            (keys::BUF_INITIAL, Value::U8(v)) => cfg.initial_buffer_size = *v,
            (keys::BUF_GROW_STEP, Value::U8(v)) => cfg.buffer_grow_step_size = *v,
            (keys::BUF_MAX, Value::U8(v)) => cfg.max_buffer_size = *v,
            (keys::BUF_MAX_GROW, Value::U8(v)) => cfg.max_grow_size = *v,
            (keys::SPDIF_PIN, Value::U8(v)) => cfg.set_spdif_pin(*v),
            (keys::SILENCE_MS, Value::U32(v)) => cfg.silence_threshold_ms = *v,
            (keys::NET_CHECK_MS, Value::U32(v)) => cfg.network_check_interval_ms = *v,
            (keys::NET_IDLE_MS, Value::U32(v)) => cfg.network_inactivity_timeout_ms = *v,
            (keys::ACTIVITY_PKTS, Value::U8(v)) => cfg.activity_threshold_packets = *v,
            (keys::SILENCE_AMP, Value::U16(v)) => cfg.silence_amplitude_threshold = *v,
            (keys::DEST_IP, Value::Str(v)) => {
                if let Some(ip) = crate::Ipv4Address::parse(v) {
                    cfg.sender_destination_ip = ip;
                }
            }
            (keys::DEST_PORT, Value::U16(v)) => {
                if *v != 0 {
                    cfg.sender_destination_port = *v;
                }
            }
            (keys::AP_SSID, Value::Str(v)) => {
                let password = cfg.ap_password.clone();
                let _ = cfg.set_ap_credentials(v, &password);
            }
            (keys::AP_PASSWORD, Value::Str(v)) => {
                let ssid = cfg.ap_ssid.clone();
                let _ = cfg.set_ap_credentials(&ssid, v);
            }
            (keys::HIDE_AP, Value::Bool(v)) => cfg.hide_ap_when_connected = *v,
            (keys::DIRECT_WRITE, Value::Bool(v)) => cfg.use_direct_write = *v,
            (keys::MDNS, Value::Bool(v)) => cfg.enable_mdns_discovery = *v,
            (keys::AUTO_SELECT, Value::Bool(v)) => cfg.auto_select_best_device = *v,
            (keys::WIZARD_DONE, Value::Bool(v)) => cfg.setup_wizard_completed = *v,
            (keys::DISCOVERY_MS, Value::U32(v)) => cfg.discovery_interval_ms = *v,
            (keys::SAP_NAME, Value::Str(v)) => {
                let _ = cfg.set_sap_stream_name(v);
            }
            (keys::USB_SENDER, Value::Bool(v)) => legacy_usb = *v,
            (keys::SPDIF_SENDER, Value::Bool(v)) => legacy_spdif = *v,
            _ => {}
        }
    }

    if !saw_mode {
        cfg.set_device_mode(DeviceMode::from_legacy_flags(legacy_usb, legacy_spdif));
    }
    // Re-assert the pair in case the persisted flags disagreed with the mode.
    cfg.set_device_mode(cfg.device_mode);

    // Shape fields were written raw above; reject impossible combinations.
    if cfg
        .clone()
        .set_buffer_shape(
            cfg.initial_buffer_size,
            cfg.buffer_grow_step_size,
            cfg.max_buffer_size,
            cfg.max_grow_size,
        )
        .is_err()
    {
        let d = Config::default();
        cfg.initial_buffer_size = d.initial_buffer_size;
        cfg.buffer_grow_step_size = d.buffer_grow_step_size;
        cfg.max_buffer_size = d.max_buffer_size;
        cfg.max_grow_size = d.max_grow_size;
    } else {
        cfg.max_grow_size = cfg
            .max_grow_size
            .clamp(cfg.initial_buffer_size, cfg.max_buffer_size);
    }

    cfg
}

fn encode_record(cfg: &Config, out: &mut [u8]) -> Result<usize, ConfigError> {
    let table = table_from_config(cfg)?;
    if out.len() < HEADER_LEN {
        return Err(ConfigError::RecordTooLarge);
    }
    let payload_len = postcard::to_slice(&table, &mut out[HEADER_LEN..])
        .map_err(|_| ConfigError::RecordTooLarge)?
        .len();

    let crc = crc32fast::hash(&out[HEADER_LEN..HEADER_LEN + payload_len]);
    out[0..4].copy_from_slice(&MAGIC);
    out[4] = VERSION;
    out[5..7].copy_from_slice(&(payload_len as u16).to_le_bytes());
    out[7..11].copy_from_slice(&crc.to_le_bytes());
    Ok(HEADER_LEN + payload_len)
}

fn decode_record(record: &[u8]) -> Option<Config> {
    if record.len() < HEADER_LEN || record[0..4] != MAGIC || record[4] != VERSION {
        return None;
    }
    let payload_len = u16::from_le_bytes([record[5], record[6]]) as usize;
    let stored_crc = u32::from_le_bytes([record[7], record[8], record[9], record[10]]);
    let payload = record.get(HEADER_LEN..HEADER_LEN + payload_len)?;
    if crc32fast::hash(payload) != stored_crc {
        return None;
    }
    let table: Table = postcard::from_bytes(payload).ok()?;
    Some(config_from_table(&table))
}

/// The process-wide configuration store
///
/// Owns the backing medium and the authoritative in-memory [`Config`].
/// Every mutation validates against a scratch copy first, commits the
/// serialized record once, and only then replaces the in-memory state, so a
/// failed commit never leaves the two diverged.
pub struct ConfigStore<S: ConfigStorage> {
    storage: S,
    config: Config,
}

impl<S: ConfigStorage> ConfigStore<S> {
    /// Load the configuration, wiping and reseeding a corrupt store
    ///
    /// Fails only if the backing store is unusable even after the wipe.
    pub fn load(mut storage: S) -> Result<Self, ConfigError> {
        let mut buf = [0u8; RECORD_CAPACITY];
        let decoded = match storage.read(&mut buf) {
            Ok(n) => decode_record(&buf[..n]),
            Err(_) => None,
        };

        if let Some(config) = decoded {
            return Ok(Self { storage, config });
        }

        // Corrupt or unreadable: erase, reseed defaults, continue.
        storage.erase().map_err(|_| ConfigError::StorageUnusable)?;
        let config = Config::default();
        let len = encode_record(&config, &mut buf)?;
        storage
            .write(&buf[..len])
            .map_err(|_| ConfigError::StorageUnusable)?;
        Ok(Self { storage, config })
    }

    /// The current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Apply a validated mutation and commit it in one write
    ///
    /// The closure runs against a scratch copy; on validation or commit
    /// failure the in-memory configuration is unchanged.
    pub fn commit(
        &mut self,
        apply: impl FnOnce(&mut Config) -> Result<(), ConfigError>,
    ) -> Result<(), ConfigError> {
        let mut next = self.config.clone();
        apply(&mut next)?;
        self.persist(&next)?;
        self.config = next;
        Ok(())
    }

    /// Apply a batch of present/value pairs with exactly one commit
    pub fn apply_update(&mut self, update: &ConfigUpdate) -> Result<(), ConfigError> {
        self.commit(|cfg| update.apply(cfg))
    }

    /// Commit the entire current configuration
    pub fn save_all(&mut self) -> Result<(), ConfigError> {
        let current = self.config.clone();
        self.persist(&current)
    }

    /// Erase the record and re-seed every option with its default
    pub fn reset_to_defaults(&mut self) -> Result<(), ConfigError> {
        self.storage
            .erase()
            .map_err(|_| ConfigError::StorageUnusable)?;
        let defaults = Config::default();
        self.persist(&defaults)?;
        self.config = defaults;
        Ok(())
    }

    fn persist(&mut self, cfg: &Config) -> Result<(), ConfigError> {
        let mut buf = [0u8; RECORD_CAPACITY];
        let len = encode_record(cfg, &mut buf)?;
        self.storage
            .write(&buf[..len])
            .map_err(|_| ConfigError::CommitFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ipv4Address;

    /// RAM-backed storage that counts operations
    struct MemStorage {
        record: std::vec::Vec<u8>,
        writes: usize,
        erases: usize,
        fail_reads: bool,
        fail_writes: bool,
    }

    impl MemStorage {
        fn empty() -> Self {
            Self {
                record: std::vec::Vec::new(),
                writes: 0,
                erases: 0,
                fail_reads: false,
                fail_writes: false,
            }
        }
    }

    impl ConfigStorage for &mut MemStorage {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
            if self.fail_reads {
                return Err(StorageError::Read);
            }
            let n = self.record.len().min(buf.len());
            buf[..n].copy_from_slice(&self.record[..n]);
            Ok(n)
        }

        fn write(&mut self, record: &[u8]) -> Result<(), StorageError> {
            if self.fail_writes {
                return Err(StorageError::Write);
            }
            self.writes += 1;
            self.record.clear();
            self.record.extend_from_slice(record);
            Ok(())
        }

        fn erase(&mut self) -> Result<(), StorageError> {
            self.erases += 1;
            self.record.clear();
            Ok(())
        }
    }

    #[test]
    fn test_empty_store_seeds_defaults() {
        let mut mem = MemStorage::empty();
        let store = ConfigStore::load(&mut mem).unwrap();
        assert_eq!(*store.config(), Config::default());
        assert_eq!(store.storage.erases, 1);
        assert_eq!(store.storage.writes, 1);
    }

    #[test]
    fn test_roundtrip_across_reboot() {
        let mut mem = MemStorage::empty();
        {
            let mut store = ConfigStore::load(&mut mem).unwrap();
            store
                .commit(|cfg| {
                    cfg.set_device_mode(DeviceMode::SenderSpdif);
                    cfg.set_port(4020)?;
                    cfg.set_hostname("listening-room")?;
                    cfg.set_volume(0.35);
                    cfg.set_destination(Ipv4Address::new(239, 1, 2, 3), 5004)
                })
                .unwrap();
        }

        // Simulated reboot: a fresh store over the same medium.
        let store = ConfigStore::load(&mut mem).unwrap();
        let cfg = store.config();
        assert_eq!(cfg.device_mode, DeviceMode::SenderSpdif);
        assert_eq!(cfg.port, 4020);
        assert_eq!(cfg.hostname.as_str(), "listening-room");
        assert_eq!(cfg.volume_percent, 35);
        assert_eq!(cfg.sender_destination_ip, Ipv4Address::new(239, 1, 2, 3));
        assert_eq!(cfg.sender_destination_port, 5004);
    }

    #[test]
    fn test_corrupt_record_wipes_and_reseeds() {
        let mut mem = MemStorage::empty();
        mem.record = std::vec![0xAB; 64];

        let store = ConfigStore::load(&mut mem).unwrap();
        assert_eq!(*store.config(), Config::default());
        assert_eq!(store.storage.erases, 1);
    }

    #[test]
    fn test_bad_crc_wipes_and_reseeds() {
        let mut mem = MemStorage::empty();
        {
            let mut store = ConfigStore::load(&mut mem).unwrap();
            store.commit(|cfg| cfg.set_port(4444)).unwrap();
        }
        // Flip one payload byte.
        let last = mem.record.len() - 1;
        mem.record[last] ^= 0xFF;

        let store = ConfigStore::load(&mut mem).unwrap();
        assert_eq!(store.config().port, Config::default().port);
    }

    #[test]
    fn test_unreadable_store_errors_only_after_wipe_retry() {
        let mut mem = MemStorage::empty();
        mem.fail_reads = true;
        mem.fail_writes = true;
        assert_eq!(
            ConfigStore::load(&mut mem).err(),
            Some(ConfigError::StorageUnusable)
        );

        let mut mem = MemStorage::empty();
        mem.fail_reads = true;
        let store = ConfigStore::load(&mut mem).unwrap();
        assert_eq!(*store.config(), Config::default());
    }

    #[test]
    fn test_failed_commit_leaves_memory_unchanged() {
        let mut mem = MemStorage::empty();
        let mut store = ConfigStore::load(&mut mem).unwrap();
        store.storage.fail_writes = true;

        assert_eq!(
            store.commit(|cfg| cfg.set_port(9000)),
            Err(ConfigError::CommitFailed)
        );
        assert_eq!(store.config().port, Config::default().port);
    }

    #[test]
    fn test_validation_failure_commits_nothing() {
        let mut mem = MemStorage::empty();
        let mut store = ConfigStore::load(&mut mem).unwrap();
        let writes_before = store.storage.writes;

        assert!(store.commit(|cfg| cfg.set_sample_rate(1234)).is_err());
        assert_eq!(store.storage.writes, writes_before);
    }

    #[test]
    fn test_batch_update_is_one_commit() {
        let mut mem = MemStorage::empty();
        let mut store = ConfigStore::load(&mut mem).unwrap();
        let writes_before = store.storage.writes;

        let mut update = ConfigUpdate::default();
        update.device_mode = Some(DeviceMode::SenderUsb);
        update.port = Some(4011);
        update.volume = Some(0.5);
        store.apply_update(&update).unwrap();

        assert_eq!(store.storage.writes, writes_before + 1);
        assert_eq!(store.config().device_mode, DeviceMode::SenderUsb);
        assert!(store.config().enable_usb_sender);
        assert_eq!(store.config().port, 4011);
    }

    #[test]
    fn test_mode_migrates_from_legacy_flags() {
        // Build a record that carries the legacy flags but no mode key.
        let mut table = Table::new();
        push_entry(&mut table, keys::USB_SENDER, Value::Bool(true)).unwrap();
        push_entry(&mut table, keys::SPDIF_SENDER, Value::Bool(false)).unwrap();

        let mut buf = [0u8; RECORD_CAPACITY];
        let payload_len = postcard::to_slice(&table, &mut buf[HEADER_LEN..])
            .unwrap()
            .len();
        let crc = crc32fast::hash(&buf[HEADER_LEN..HEADER_LEN + payload_len]);
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[5..7].copy_from_slice(&(payload_len as u16).to_le_bytes());
        buf[7..11].copy_from_slice(&crc.to_le_bytes());

        let mut mem = MemStorage::empty();
        mem.record = buf[..HEADER_LEN + payload_len].to_vec();

        let store = ConfigStore::load(&mut mem).unwrap();
        assert_eq!(store.config().device_mode, DeviceMode::SenderUsb);
        assert!(store.config().enable_usb_sender);
    }

    #[test]
    fn test_reset_to_defaults() {
        let mut mem = MemStorage::empty();
        let mut store = ConfigStore::load(&mut mem).unwrap();
        store.commit(|cfg| cfg.set_port(5000)).unwrap();

        store.reset_to_defaults().unwrap();
        assert_eq!(*store.config(), Config::default());
        assert!(store.storage.erases >= 2);
    }
}
