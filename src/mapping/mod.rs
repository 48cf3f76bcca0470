//! Per-protocol registries translating stable tag ids into protocol-native
//! locators, with conflict-free automatic allocation.

pub mod classify;
pub mod iec104;
pub mod modbus;
pub mod opcua;
pub mod snmp;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::MappingError;
use crate::store::TagId;

pub use iec104::Iec104Mapping;
pub use modbus::ModbusMapping;
pub use opcua::OpcUaMapping;
pub use snmp::SnmpMapping;

/// Access granted to external clients for a mapped tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// Locator placement strategy for bulk auto-generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingStrategy {
    /// Group tags into protocol-specific sub-ranges by their native type.
    DataType,
    /// Pack contiguously from the requested start locator.
    Sequential,
}

/// Attribute sets stored in a [`MappingTable`]. `conflicts_with` defines the
/// protocol's locator uniqueness rule; `locator_label` is only used in error
/// messages.
pub trait ProtocolAttrs {
    const PROTOCOL: &'static str;

    fn conflicts_with(&self, other: &Self) -> bool;
    fn locator_label(&self) -> String;
}

/// One registry entry: the tag's key plus the protocol attribute set.
#[derive(Debug, Clone)]
pub struct Mapping<A> {
    pub key: String,
    pub attrs: A,
}

/// Mutex-guarded id → mapping registry. Insertion order is preserved so the
/// publish loops iterate deterministically.
pub struct MappingTable<A> {
    entries: Mutex<IndexMap<TagId, Mapping<A>>>,
}

impl<A> Default for MappingTable<A> {
    fn default() -> Self {
        MappingTable {
            entries: Mutex::new(IndexMap::new()),
        }
    }
}

impl<A: ProtocolAttrs + Clone> MappingTable<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the mapping for `id`. Fails if the locator collides
    /// with a mapping belonging to a different id; re-setting the same id may
    /// move its own locator (that is an explicit relocation, not a silent
    /// one).
    pub fn set(&self, id: TagId, key: &str, attrs: A) -> Result<(), MappingError> {
        let mut entries = self.entries.lock();
        for (other_id, other) in entries.iter() {
            if *other_id != id && attrs.conflicts_with(&other.attrs) {
                return Err(MappingError::LocatorConflict {
                    protocol: A::PROTOCOL,
                    locator: attrs.locator_label(),
                    existing: other.key.clone(),
                });
            }
        }
        entries.insert(
            id,
            Mapping {
                key: key.to_string(),
                attrs,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &TagId) -> Option<Mapping<A>> {
        self.entries.lock().get(id).cloned()
    }

    /// Removing a mapping never touches the underlying tag.
    pub fn remove(&self, id: &TagId) -> Option<Mapping<A>> {
        self.entries.lock().shift_remove(id)
    }

    /// Defensive copy of the whole registry, safe to iterate outside the lock.
    pub fn all(&self) -> IndexMap<TagId, Mapping<A>> {
        self.entries.lock().clone()
    }

    pub fn find_by_key(&self, key: &str) -> Option<(TagId, Mapping<A>)> {
        self.entries
            .lock()
            .iter()
            .find(|(_, mapping)| mapping.key == key)
            .map(|(id, mapping)| (id.clone(), mapping.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Outcome of one id in a bulk auto-generation run.
#[derive(Debug, Clone)]
pub struct BulkEntry {
    pub id: TagId,
    pub key: Option<String>,
    pub locator: Option<u32>,
    pub error: Option<String>,
}

impl BulkEntry {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of a bulk auto-generation run, including the locator range the
/// run consumed.
#[derive(Debug, Clone, Default)]
pub struct BulkReport {
    pub entries: Vec<BulkEntry>,
    pub first_locator: Option<u32>,
    pub last_locator: Option<u32>,
}

impl BulkReport {
    pub fn mapped(&self) -> usize {
        self.entries.iter().filter(|e| e.ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.mapped()
    }

    pub(crate) fn push_ok(&mut self, id: TagId, key: &str, locator: u32) {
        self.first_locator = Some(self.first_locator.unwrap_or(locator).min(locator));
        self.last_locator = Some(self.last_locator.unwrap_or(locator).max(locator));
        self.entries.push(BulkEntry {
            id,
            key: Some(key.to_string()),
            locator: Some(locator),
            error: None,
        });
    }

    pub(crate) fn push_err(&mut self, id: TagId, key: Option<&str>, error: String) {
        self.entries.push(BulkEntry {
            id,
            key: key.map(str::to_string),
            locator: None,
            error: Some(error),
        });
    }
}
