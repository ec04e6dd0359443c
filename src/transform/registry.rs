//! Transform registry
//!
//! Maps transform ids to factories. Each configured device gets its own
//! instance; the registry only counts how many instances are alive so an
//! implementation in use cannot be unregistered.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{LoopError, Result};

use super::{
    IdentityTransform, Transform, TransformId, XorTransform, MAX_KEY_SIZE, TRANSFORM_NONE,
    TRANSFORM_XOR,
};

/// Builds a transform instance from a key
pub type TransformFactory = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Transform>> + Send + Sync>;

fn identity_factory(_key: &[u8]) -> Result<Box<dyn Transform>> {
    Ok(Box::new(IdentityTransform))
}

fn xor_factory(key: &[u8]) -> Result<Box<dyn Transform>> {
    Ok(Box::new(XorTransform::new(key)?))
}

struct Entry {
    name: String,
    factory: TransformFactory,
    users: Arc<AtomicUsize>,
}

/// Table of available transforms
pub struct TransformRegistry {
    entries: RwLock<BTreeMap<TransformId, Entry>>,
}

impl TransformRegistry {
    /// Registry holding the built-in `none` and `xor` transforms
    pub fn new() -> Self {
        let registry = Self {
            entries: RwLock::new(BTreeMap::new()),
        };
        let mut entries = registry.entries.write();
        entries.insert(
            TRANSFORM_NONE,
            Entry {
                name: "none".to_string(),
                factory: Arc::new(identity_factory),
                users: Arc::new(AtomicUsize::new(0)),
            },
        );
        entries.insert(
            TRANSFORM_XOR,
            Entry {
                name: "xor".to_string(),
                factory: Arc::new(xor_factory),
                users: Arc::new(AtomicUsize::new(0)),
            },
        );
        drop(entries);
        registry
    }

    /// Register an additional transform under `id`
    pub fn register(&self, id: TransformId, name: &str, factory: TransformFactory) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(LoopError::Busy);
        }
        entries.insert(
            id,
            Entry {
                name: name.to_string(),
                factory,
                users: Arc::new(AtomicUsize::new(0)),
            },
        );
        tracing::debug!(id, name, "registered transform");
        Ok(())
    }

    /// Remove a transform. Built-ins and transforms still bound to a
    /// device cannot be removed.
    pub fn unregister(&self, id: TransformId) -> Result<()> {
        if id == TRANSFORM_NONE || id == TRANSFORM_XOR {
            return Err(LoopError::invalid("built-in transforms cannot be unregistered"));
        }
        let mut entries = self.entries.write();
        let entry = entries
            .get(&id)
            .ok_or_else(|| LoopError::invalid(format!("unknown transform id {id}")))?;
        if entry.users.load(Ordering::SeqCst) > 0 {
            return Err(LoopError::Busy);
        }
        entries.remove(&id);
        Ok(())
    }

    /// Name of a registered transform
    pub fn name(&self, id: TransformId) -> Option<String> {
        self.entries.read().get(&id).map(|e| e.name.clone())
    }

    /// Instantiate transform `id` with `key`.
    ///
    /// Returns `None` for the identity transform: an identity device has no
    /// active transform.
    pub fn create(&self, id: TransformId, key: &[u8]) -> Result<Option<ActiveTransform>> {
        if key.len() > MAX_KEY_SIZE {
            return Err(LoopError::invalid(format!(
                "key size {} exceeds {}",
                key.len(),
                MAX_KEY_SIZE
            )));
        }
        let (factory, users, name) = {
            let entries = self.entries.read();
            let entry = entries
                .get(&id)
                .ok_or_else(|| LoopError::invalid(format!("unknown transform id {id}")))?;
            (entry.factory.clone(), entry.users.clone(), entry.name.clone())
        };

        let transform = factory(key)?;
        if transform.is_identity() {
            return Ok(None);
        }
        users.fetch_add(1, Ordering::SeqCst);
        Ok(Some(ActiveTransform {
            transform,
            name,
            users,
        }))
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A transform instance owned by one device.
///
/// Released (and its registry use dropped) when the last reference goes.
pub struct ActiveTransform {
    transform: Box<dyn Transform>,
    name: String,
    users: Arc<AtomicUsize>,
}

impl ActiveTransform {
    pub fn id(&self) -> TransformId {
        self.transform.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encode(&self, src: &[u8], dst: &mut [u8], pos: u64) -> std::io::Result<()> {
        self.transform.encode(src, dst, pos)
    }

    pub fn decode(&self, src: &[u8], dst: &mut [u8], pos: u64) -> std::io::Result<()> {
        self.transform.decode(src, dst, pos)
    }
}

impl fmt::Debug for ActiveTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTransform")
            .field("id", &self.transform.id())
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for ActiveTransform {
    fn drop(&mut self) {
        if let Err(e) = self.transform.release() {
            tracing::warn!(name = %self.name, "transform release failed: {}", e);
        }
        self.users.fetch_sub(1, Ordering::SeqCst);
    }
}
