//! # Case Configuration
//!
//! Settings that survive a power cycle. The record stored in flash is the
//! postcard encoding of a magic code plus [`CaseConfig`], followed by a
//! CRC-8 over everything before it:
//!
//! ```text
//! ┌──────────────────┬──────────────────────┬───────┐
//! │ code 0xD06FACE2  │  CaseConfig fields   │ CRC-8 │
//! │     (varint)     │      (postcard)      │  1 B  │
//! └──────────────────┴──────────────────────┴───────┘
//! ```
//!
//! Anything that fails to verify is replaced by defaults.

use heapless::Vec;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::crc::{crc8, crc8_verify};
use crate::traits::ConfigStore;

/// Marks a record written by this firmware
pub const CONFIG_CODE: u32 = 0xD06F_ACE2;

/// Upper bound on an encoded record
pub const CONFIG_RECORD_SIZE: usize = 48;

pub type ConfigRecord = Vec<u8, CONFIG_RECORD_SIZE>;

/// Persisted case settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaseConfig {
    pub serial: u64,
    /// Seconds between status exchanges with the lid closed
    pub status_time_closed: u32,
    /// Seconds between status exchanges once the lid has been open a long time
    pub status_time_open: u32,
    pub shipping_mode: bool,
    pub battery_cutoff_mv: u16,
    pub board_id: u8,
}

impl Default for CaseConfig {
    fn default() -> Self {
        Self {
            serial: 0,
            status_time_closed: 60,
            status_time_open: 0,
            shipping_mode: false,
            battery_cutoff_mv: 3200,
            board_id: 0,
        }
    }
}

impl ConfigStore for CaseConfig {
    fn status_time_closed(&self) -> u32 {
        self.status_time_closed
    }

    fn status_time_open(&self) -> u32 {
        self.status_time_open
    }

    fn shipping_mode(&self) -> bool {
        self.shipping_mode
    }

    fn set_shipping_mode(&mut self, enabled: bool) {
        self.shipping_mode = enabled;
    }
}

#[derive(Serialize, Deserialize)]
struct Record {
    code: u32,
    config: CaseConfig,
}

/// Errors while loading or storing the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Nothing stored yet
    Empty,
    BadChecksum,
    BadCode,
    Encode,
    Decode,
    /// The flash driver failed
    Flash,
}

/// Raw storage for the configuration record
pub trait ConfigFlash {
    /// Read the stored record into `buf`, returning its length
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConfigError>;

    /// Replace the stored record
    fn write(&mut self, record: &[u8]) -> Result<(), ConfigError>;
}

/// Serialize `config` into a checksummed record
pub fn encode_record(config: &CaseConfig) -> Result<ConfigRecord, ConfigError> {
    let record = Record {
        code: CONFIG_CODE,
        config: *config,
    };
    let mut buf = [0u8; CONFIG_RECORD_SIZE];
    let used = postcard::to_slice(&record, &mut buf).map_err(|_| ConfigError::Encode)?;

    let mut out = ConfigRecord::from_slice(used).map_err(|_| ConfigError::Encode)?;
    let crc = crc8(&out);
    out.push(crc).map_err(|_| ConfigError::Encode)?;
    Ok(out)
}

/// Verify and deserialize a record
pub fn decode_record(bytes: &[u8]) -> Result<CaseConfig, ConfigError> {
    let Some((_, body)) = bytes.split_last() else {
        return Err(ConfigError::Empty);
    };
    if !crc8_verify(bytes) {
        return Err(ConfigError::BadChecksum);
    }

    let record: Record = postcard::from_bytes(body).map_err(|_| ConfigError::Decode)?;
    if record.code != CONFIG_CODE {
        return Err(ConfigError::BadCode);
    }
    Ok(record.config)
}

/// [`CaseConfig`] backed by flash, written back whenever it changes
pub struct PersistentConfig<F: ConfigFlash> {
    flash: F,
    config: CaseConfig,
}

impl<F: ConfigFlash> PersistentConfig<F> {
    /// Load the stored record, falling back to defaults
    pub fn load(mut flash: F) -> Self {
        let mut buf = [0u8; CONFIG_RECORD_SIZE];
        let config = flash
            .read(&mut buf)
            .and_then(|len| decode_record(&buf[..len.min(CONFIG_RECORD_SIZE)]))
            .unwrap_or_else(|e| {
                warn!("Config: {:?}, using defaults", e);
                CaseConfig::default()
            });

        Self { flash, config }
    }

    pub fn config(&self) -> &CaseConfig {
        &self.config
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn save(&mut self) -> Result<(), ConfigError> {
        let record = encode_record(&self.config)?;
        self.flash.write(&record)
    }
}

impl<F: ConfigFlash> ConfigStore for PersistentConfig<F> {
    fn status_time_closed(&self) -> u32 {
        self.config.status_time_closed
    }

    fn status_time_open(&self) -> u32 {
        self.config.status_time_open
    }

    fn shipping_mode(&self) -> bool {
        self.config.shipping_mode
    }

    fn set_shipping_mode(&mut self, enabled: bool) {
        if self.config.shipping_mode != enabled {
            self.config.shipping_mode = enabled;
            if let Err(e) = self.save() {
                warn!("Config write failed: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RamFlash {
        data: ConfigRecord,
        writes: u8,
    }

    impl ConfigFlash for RamFlash {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConfigError> {
            if self.data.is_empty() {
                return Err(ConfigError::Empty);
            }
            buf[..self.data.len()].copy_from_slice(&self.data);
            Ok(self.data.len())
        }

        fn write(&mut self, record: &[u8]) -> Result<(), ConfigError> {
            self.data = ConfigRecord::from_slice(record).map_err(|_| ConfigError::Flash)?;
            self.writes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_defaults() {
        let config = CaseConfig::default();
        assert_eq!(config.status_time_closed(), 60);
        assert_eq!(config.status_time_open(), 0);
        assert!(!config.shipping_mode());
        assert_eq!(config.battery_cutoff_mv, 3200);
    }

    #[test]
    fn test_record_round_trip() {
        let config = CaseConfig {
            serial: 0x0123_4567_89AB_CDEF,
            status_time_closed: 600,
            status_time_open: 30,
            shipping_mode: true,
            battery_cutoff_mv: 3350,
            board_id: 7,
        };
        let record = encode_record(&config).unwrap();
        assert!(record.len() <= CONFIG_RECORD_SIZE);
        assert_eq!(decode_record(&record), Ok(config));
    }

    #[test]
    fn test_bad_records_rejected() {
        let mut record = encode_record(&CaseConfig::default()).unwrap();
        record[1] ^= 0x10;
        assert_eq!(decode_record(&record), Err(ConfigError::BadChecksum));
        assert_eq!(decode_record(&[]), Err(ConfigError::Empty));

        let foreign = Record {
            code: 0x1234_5678,
            config: CaseConfig::default(),
        };
        let mut buf = [0u8; CONFIG_RECORD_SIZE];
        let used = postcard::to_slice(&foreign, &mut buf).unwrap();
        let mut record = ConfigRecord::from_slice(used).unwrap();
        let crc = crc8(&record);
        record.push(crc).unwrap();
        assert_eq!(decode_record(&record), Err(ConfigError::BadCode));
    }

    #[test]
    fn test_load_falls_back_to_defaults() {
        let store = PersistentConfig::load(RamFlash::default());
        assert_eq!(*store.config(), CaseConfig::default());

        let mut flash = RamFlash::default();
        flash.data = ConfigRecord::from_slice(&[0xAA, 0xBB, 0xCC]).unwrap();
        let store = PersistentConfig::load(flash);
        assert_eq!(*store.config(), CaseConfig::default());
    }

    #[test]
    fn test_shipping_mode_written_back() {
        let mut store = PersistentConfig::load(RamFlash::default());

        store.set_shipping_mode(true);
        store.set_shipping_mode(true);
        assert_eq!(store.flash().writes, 1);

        let reloaded = PersistentConfig::load(RamFlash {
            data: store.flash().data.clone(),
            writes: 0,
        });
        assert!(reloaded.shipping_mode());
    }
}
