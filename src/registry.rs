//! Device node ownership
//!
//! Sessions lease a capture node for their lifetime. The registry is an
//! ordinary value shared through `Arc`; nothing here is process-global.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::RegistryError;

/// A node handed to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLease {
    pub index: usize,
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct DeviceRegistry {
    nodes: Vec<PathBuf>,
    /// Owning session id per node
    owners: Mutex<Vec<Option<String>>>,
}

impl DeviceRegistry {
    pub fn new(nodes: Vec<PathBuf>) -> Self {
        let owners = Mutex::new(vec![None; nodes.len()]);
        Self { nodes, owners }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<String>>> {
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn nodes(&self) -> &[PathBuf] {
        &self.nodes
    }

    /// Lease the first free node
    pub fn acquire(&self, session: &str) -> Result<DeviceLease, RegistryError> {
        let mut owners = self.lock();
        let index = owners
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::Exhausted)?;
        owners[index] = Some(session.to_string());
        info!(session, node = %self.nodes[index].display(), "Device acquired");
        Ok(DeviceLease {
            index,
            path: self.nodes[index].clone(),
        })
    }

    /// Lease a specific node. Re-acquiring a node the session already holds
    /// returns the same lease.
    pub fn acquire_node(&self, path: &Path, session: &str) -> Result<DeviceLease, RegistryError> {
        let index = self
            .nodes
            .iter()
            .position(|node| node == path)
            .ok_or_else(|| RegistryError::UnknownDevice(path.display().to_string()))?;
        let mut owners = self.lock();
        match &owners[index] {
            Some(owner) if owner != session => {
                return Err(RegistryError::InUse(path.display().to_string()))
            }
            Some(_) => debug!(session, "Node already leased to this session"),
            None => {
                owners[index] = Some(session.to_string());
                info!(session, node = %path.display(), "Device acquired");
            }
        }
        Ok(DeviceLease {
            index,
            path: self.nodes[index].clone(),
        })
    }

    /// Return a node. Only the owning session may release it.
    pub fn release(&self, index: usize, session: &str) -> Result<(), RegistryError> {
        let node = self
            .nodes
            .get(index)
            .ok_or_else(|| RegistryError::UnknownDevice(format!("#{index}")))?;
        let mut owners = self.lock();
        if owners[index].as_deref() != Some(session) {
            return Err(RegistryError::NotOwner(node.display().to_string()));
        }
        owners[index] = None;
        info!(session, node = %node.display(), "Device released");
        Ok(())
    }

    pub fn owner(&self, index: usize) -> Option<String> {
        self.lock().get(index).cloned().flatten()
    }
}
