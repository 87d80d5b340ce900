//! Database format versioning
//!
//! New databases are stamped with the current format version; databases
//! written by a newer format are refused rather than misread.

use rocksdb::{IteratorMode, DB};

use crate::error::{MemoryError, Result};

/// Database version stored in metadata
pub(crate) const DB_VERSION_KEY: &[u8] = b"_db_version";
pub(crate) const CURRENT_VERSION: u32 = 1;

/// Check the stored format version, stamping databases that have none
pub fn check_version(db: &DB) -> Result<u32> {
    let stored = match db.get(DB_VERSION_KEY)? {
        Some(bytes) => {
            let bytes_slice: &[u8] = bytes.as_ref();
            let version_bytes: [u8; 4] = bytes_slice
                .try_into()
                .map_err(|_| MemoryError::validation("invalid _db_version format"))?;
            Some(u32::from_le_bytes(version_bytes))
        }
        None => None,
    };

    match stored {
        Some(version) if version > CURRENT_VERSION => Err(MemoryError::validation(format!(
            "database format v{} is newer than supported v{}",
            version, CURRENT_VERSION
        ))),
        Some(version) => {
            log::debug!("[migration] database format v{}", version);
            Ok(version)
        }
        None => {
            let has_records = db.iterator(IteratorMode::Start).next().is_some();
            if has_records {
                log::warn!(
                    "[migration] unversioned database with records; stamping v{}",
                    CURRENT_VERSION
                );
            }
            db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
            db.flush()?;
            Ok(CURRENT_VERSION)
        }
    }
}
