//! Flat-file persistence for the budget manager. The dump carries a magic
//! string, the network's message-start bytes, the bincode state, and a
//! trailing double-SHA256 of everything before it.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ferrite_shared_types::double_sha256;
use log::{info, warn};

use crate::error::PersistenceError;
use crate::manager::{BudgetManager, BudgetSnapshot};
use crate::params::Network;

const MAGIC_MESSAGE: &str = "MasternodeBudget";

/// Reader/writer for `budget.dat`.
pub struct BudgetDb {
    path: PathBuf,
    network: Network,
}

impl BudgetDb {
    pub fn new<P: AsRef<Path>>(path: P, network: Network) -> Self {
        BudgetDb {
            path: path.as_ref().to_path_buf(),
            network,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes the manager's persistable state and writes it with the
    /// trailing content hash.
    pub fn write(&self, manager: &BudgetManager) -> Result<(), PersistenceError> {
        let started = Instant::now();
        let snapshot = manager.snapshot();

        let mut buffer = bincode::serialize(MAGIC_MESSAGE)
            .map_err(|e| PersistenceError::IncorrectFormat(e.to_string()))?;
        buffer.extend_from_slice(&self.network.magic());
        let state = bincode::serialize(&snapshot)
            .map_err(|e| PersistenceError::IncorrectFormat(e.to_string()))?;
        buffer.extend_from_slice(&state);

        let hash = double_sha256(&buffer);
        buffer.extend_from_slice(&hash);

        fs::write(&self.path, &buffer).map_err(|e| PersistenceError::File(e.to_string()))?;
        info!(
            "written info to {} in {}ms",
            self.path.display(),
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Reads and verifies the dump without touching any manager.
    pub fn read(&self) -> Result<BudgetSnapshot, PersistenceError> {
        let bytes = fs::read(&self.path).map_err(|e| PersistenceError::File(e.to_string()))?;
        if bytes.len() < 32 {
            return Err(PersistenceError::HashRead("file truncated".to_string()));
        }

        let (data, stored_hash) = bytes.split_at(bytes.len() - 32);
        if double_sha256(data) != *stored_hash {
            return Err(PersistenceError::IncorrectHash);
        }

        let mut cursor = Cursor::new(data);
        let magic: String = bincode::deserialize_from(&mut cursor)
            .map_err(|e| PersistenceError::IncorrectFormat(e.to_string()))?;
        if magic != MAGIC_MESSAGE {
            return Err(PersistenceError::IncorrectMagicMessage);
        }

        let mut network_magic = [0u8; 4];
        let position = cursor.position() as usize;
        let remaining = &data[position..];
        if remaining.len() < 4 {
            return Err(PersistenceError::IncorrectFormat("missing network tag".to_string()));
        }
        network_magic.copy_from_slice(&remaining[..4]);
        if network_magic != self.network.magic() {
            return Err(PersistenceError::IncorrectMagicNumber);
        }

        bincode::deserialize(&remaining[4..])
            .map_err(|e| PersistenceError::IncorrectFormat(e.to_string()))
    }

    /// Loads the dump into `manager`. A decode failure clears the manager's
    /// in-memory state before surfacing the error.
    pub fn load(&self, manager: &BudgetManager) -> Result<(), PersistenceError> {
        let started = Instant::now();
        match self.read() {
            Ok(snapshot) => {
                manager.restore(snapshot);
                info!(
                    "loaded info from {} in {}ms",
                    self.path.display(),
                    started.elapsed().as_millis()
                );
                info!("{}", manager);
                Ok(())
            }
            Err(err) => {
                if let PersistenceError::IncorrectFormat(_) = err {
                    manager.clear();
                }
                Err(err)
            }
        }
    }

    /// Verifies the existing dump, then writes the current state. A missing
    /// or format-broken file is recreated; any other failure aborts.
    pub fn dump(&self, manager: &BudgetManager) -> Result<(), PersistenceError> {
        match self.read() {
            Ok(_) => {}
            Err(PersistenceError::File(_)) => {
                info!("missing budgets file - {}, will try to recreate", self.path.display());
            }
            Err(PersistenceError::IncorrectFormat(reason)) => {
                warn!("magic is ok but data has invalid format ({}), will try to recreate", reason);
            }
            Err(err) => {
                warn!("budget file format is unknown or invalid, please fix it manually");
                return Err(err);
            }
        }
        self.write(manager)
    }
}
