use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::SystemTime;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::value::{DataType, Quality, TagValue};

pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Opaque 128-bit stable identifier for a tag, minted lazily on first
/// external reference and never reused. The wire form is the 32-hex-digit
/// `uuid` simple representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(String);

impl TagId {
    fn mint() -> TagId {
        TagId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TagId {
    fn from(s: &str) -> TagId {
        TagId(s.to_string())
    }
}

impl From<String> for TagId {
    fn from(s: String) -> TagId {
        TagId(s)
    }
}

/// Registration request for one tag. Doubles as the manifest file entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TagSpec {
    pub key: String,
    pub data_type: DataType,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub address: Option<u16>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

impl TagSpec {
    pub fn new(key: &str, data_type: DataType) -> TagSpec {
        TagSpec {
            key: key.to_string(),
            data_type,
            units: String::new(),
            address: None,
            default: None,
        }
    }

    pub fn units(mut self, units: &str) -> TagSpec {
        self.units = units.to_string();
        self
    }

    pub fn address(mut self, address: u16) -> TagSpec {
        self.address = Some(address);
        self
    }

    pub fn default_value(mut self, v: serde_json::Value) -> TagSpec {
        self.default = Some(v);
        self
    }
}

/// Refers to a tag either by key or by its allocated numeric address.
#[derive(Debug, Clone, Copy)]
pub enum TagRef<'a> {
    Key(&'a str),
    Address(u16),
}

impl<'a> From<&'a str> for TagRef<'a> {
    fn from(key: &'a str) -> TagRef<'a> {
        TagRef::Key(key)
    }
}

impl From<u16> for TagRef<'static> {
    fn from(address: u16) -> TagRef<'static> {
        TagRef::Address(address)
    }
}

#[derive(Debug, Clone)]
struct DataPoint {
    value: TagValue,
    default: TagValue,
    data_type: DataType,
    units: String,
    address: Option<u16>,
    timestamp: SystemTime,
    last_change: SystemTime,
    quality: Quality,
}

/// Full tag metadata as returned by [`DataStore::detailed_snapshot`].
/// Timestamps are epoch seconds so the struct serializes cleanly onto the
/// IPC and MQTT surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct TagDetail {
    pub key: String,
    pub value: TagValue,
    pub default: TagValue,
    pub data_type: DataType,
    pub units: String,
    pub address: Option<u16>,
    pub timestamp: f64,
    pub last_change: f64,
    pub quality: Quality,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistorySample {
    pub timestamp: SystemTime,
    pub value: TagValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatistics {
    pub total_points: usize,
    pub total_addresses: usize,
    pub history_keys: usize,
    pub total_history_entries: usize,
    pub bad_quality_points: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RangeUsage {
    pub range_start: u16,
    pub range_end: u16,
    pub next_available: u16,
    pub points_count: usize,
}

/// The per-type address allocation table. The defaults reserve a thousand
/// addresses per data type.
#[derive(Debug, Clone)]
pub struct AddressRanges {
    ranges: FxHashMap<DataType, (u16, u16)>,
}

impl Default for AddressRanges {
    fn default() -> AddressRanges {
        let mut ranges = FxHashMap::default();
        ranges.insert(DataType::Float, (40001, 41000));
        ranges.insert(DataType::Int, (41001, 42000));
        ranges.insert(DataType::Bool, (42001, 43000));
        ranges.insert(DataType::String, (43001, 44000));
        ranges.insert(DataType::Raw, (44001, 45000));
        AddressRanges { ranges }
    }
}

impl AddressRanges {
    pub fn with_range(mut self, data_type: DataType, start: u16, end: u16) -> AddressRanges {
        self.ranges.insert(data_type, (start, end));
        self
    }

    pub fn get(&self, data_type: DataType) -> (u16, u16) {
        self.ranges[&data_type]
    }
}

type ChangeListener = Box<dyn Fn(&str, &TagValue, &TagValue, SystemTime) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    points: FxHashMap<String, DataPoint>,
    key_to_address: FxHashMap<String, u16>,
    address_to_key: FxHashMap<u16, String>,
    key_to_id: FxHashMap<String, TagId>,
    id_to_key: FxHashMap<TagId, String>,
    history: FxHashMap<String, VecDeque<HistorySample>>,
    next_addresses: FxHashMap<DataType, u16>,
    listeners: Vec<ChangeListener>,
}

/// Thread-safe in-memory tag store: typed values, stable ids, per-type
/// address allocation, bounded history rings, quality tracking and change
/// notification.
///
/// One mutex serializes every operation; all of them are short. Change
/// listeners run while the lock is held, so they must only enqueue — they
/// must not block and must not call back into the store or a mapping
/// registry.
pub struct DataStore {
    inner: Mutex<StoreInner>,
    ranges: AddressRanges,
    max_history: usize,
    auto_allocate: bool,
}

impl Default for DataStore {
    fn default() -> DataStore {
        DataStore::new()
    }
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore::with_ranges(AddressRanges::default())
    }

    pub fn with_ranges(ranges: AddressRanges) -> DataStore {
        let mut next_addresses = FxHashMap::default();
        for data_type in DataType::ALL {
            next_addresses.insert(data_type, ranges.get(data_type).0);
        }
        DataStore {
            inner: Mutex::new(StoreInner {
                next_addresses,
                ..StoreInner::default()
            }),
            ranges,
            max_history: DEFAULT_MAX_HISTORY,
            auto_allocate: true,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> DataStore {
        self.max_history = max_history;
        self
    }

    pub fn without_auto_allocation(mut self) -> DataStore {
        self.auto_allocate = false;
        self
    }

    /// Register a tag. Idempotent in `key`: re-registering updates the
    /// metadata, keeps the current value and returns the address assigned the
    /// first time around. Returns 0 when the tag ends up without an address.
    pub fn register(&self, spec: &TagSpec) -> Result<u16, StoreError> {
        let mut inner = self.inner.lock();

        let existing_address = inner.key_to_address.get(&spec.key).copied();
        let address = match (spec.address, existing_address) {
            (Some(requested), Some(current)) => {
                if requested != current {
                    // Addresses are immutable once assigned.
                    log::debug!(
                        "register '{}': keeping address {current}, ignoring requested {requested}",
                        spec.key
                    );
                }
                Some(current)
            }
            (Some(requested), None) => {
                let (start, end) = self.ranges.get(spec.data_type);
                if requested < start || requested > end {
                    return Err(StoreError::AddressOutOfRange {
                        address: requested,
                        data_type: spec.data_type,
                        start,
                        end,
                    });
                }
                if let Some(owner) = inner.address_to_key.get(&requested) {
                    if owner != &spec.key {
                        return Err(StoreError::AddressConflict {
                            address: requested,
                            existing: owner.clone(),
                        });
                    }
                }
                Some(requested)
            }
            (None, Some(current)) => Some(current),
            (None, None) if self.auto_allocate => {
                Some(self.allocate_address(&mut inner, spec.data_type)?)
            }
            (None, None) => None,
        };

        if let Some(address) = address {
            inner.key_to_address.insert(spec.key.clone(), address);
            inner.address_to_key.insert(address, spec.key.clone());
        }

        let default = self.coerce_default(spec);
        let now = SystemTime::now();
        match inner.points.get_mut(&spec.key) {
            Some(dp) => {
                dp.default = default;
                dp.data_type = spec.data_type;
                dp.units = spec.units.clone();
                if address.is_some() {
                    dp.address = address;
                }
            }
            None => {
                inner.points.insert(
                    spec.key.clone(),
                    DataPoint {
                        value: default.clone(),
                        default,
                        data_type: spec.data_type,
                        units: spec.units.clone(),
                        address,
                        timestamp: now,
                        last_change: now,
                        quality: Quality::Good,
                    },
                );
            }
        }

        Ok(address.unwrap_or(0))
    }

    fn coerce_default(&self, spec: &TagSpec) -> TagValue {
        let type_zero = match spec.data_type {
            DataType::Float => TagValue::Float(0.0),
            DataType::Int => TagValue::Int(0),
            DataType::Bool => TagValue::Bool(false),
            DataType::String => TagValue::Str(String::new()),
            DataType::Raw => TagValue::Raw(serde_json::Value::Null),
        };
        match &spec.default {
            None => type_zero,
            Some(raw) => match spec.data_type.coerce(raw) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("default for tag '{}' is unusable ({e}); using zero", spec.key);
                    type_zero
                }
            },
        }
    }

    fn allocate_address(
        &self,
        inner: &mut StoreInner,
        data_type: DataType,
    ) -> Result<u16, StoreError> {
        let (start, end) = self.ranges.get(data_type);
        let mut candidate = inner.next_addresses[&data_type];
        while candidate <= end {
            if !inner.address_to_key.contains_key(&candidate) {
                inner.next_addresses.insert(data_type, candidate + 1);
                return Ok(candidate);
            }
            candidate += 1;
        }
        // Reset the cursor so that later removals become allocatable again.
        inner.next_addresses.insert(data_type, start);
        Err(StoreError::AddressSpaceExhausted {
            data_type,
            start,
            end,
        })
    }

    /// Returns the stable id for `key`, minting one on first call.
    pub fn ensure_id(&self, key: &str) -> TagId {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.key_to_id.get(key) {
            return id.clone();
        }
        let id = TagId::mint();
        inner.key_to_id.insert(key.to_string(), id.clone());
        inner.id_to_key.insert(id.clone(), key.to_string());
        id
    }

    pub fn key_for_id(&self, id: &TagId) -> Option<String> {
        self.inner.lock().id_to_key.get(id).cloned()
    }

    /// Read the current value, or the neutral zero for unknown targets.
    /// Never fails.
    pub fn read<'a>(&self, target: impl Into<TagRef<'a>>) -> TagValue {
        let inner = self.inner.lock();
        let key = match target.into() {
            TagRef::Key(key) => key.to_string(),
            TagRef::Address(address) => match inner.address_to_key.get(&address) {
                Some(key) => key.clone(),
                None => return TagValue::zero(),
            },
        };
        inner
            .points
            .get(&key)
            .map(|dp| dp.value.clone())
            .unwrap_or_else(TagValue::zero)
    }

    /// Write a raw value to a registered tag.
    ///
    /// Unknown keys and addresses are silently dropped: pollers race with
    /// configuration and must not be broken by ordering. Coercion failures
    /// store the tag's default and flip quality to BAD without notifying
    /// listeners; the next successful coercion restores GOOD.
    pub fn write<'a>(&self, target: impl Into<TagRef<'a>>, raw: serde_json::Value) {
        let mut inner = self.inner.lock();
        let key = match target.into() {
            TagRef::Key(key) => key.to_string(),
            TagRef::Address(address) => match inner.address_to_key.get(&address) {
                Some(key) => key.clone(),
                None => {
                    log::debug!("write to unmapped address {address} dropped");
                    return;
                }
            },
        };
        let Some(dp) = inner.points.get_mut(&key) else {
            log::debug!("write to unregistered key '{key}' dropped");
            return;
        };

        let now = SystemTime::now();
        let old = dp.value.clone();
        let new = match dp.data_type.coerce(&raw) {
            Ok(v) => {
                dp.quality = Quality::Good;
                v
            }
            Err(e) => {
                log::warn!("write to '{key}' rejected: {e}");
                dp.quality = Quality::Bad;
                dp.default.clone()
            }
        };
        let changed = old != new;
        let fire = changed && dp.quality == Quality::Good;
        dp.value = new.clone();
        dp.timestamp = now;
        if changed {
            dp.last_change = now;
        }

        let history = inner.history.entry(key.clone()).or_default();
        history.push_back(HistorySample {
            timestamp: now,
            value: new.clone(),
        });
        if history.len() > self.max_history {
            history.pop_front();
        }

        if fire {
            for listener in &inner.listeners {
                let result =
                    catch_unwind(AssertUnwindSafe(|| listener(&key, &old, &new, now)));
                if result.is_err() {
                    log::error!("change listener panicked for key '{key}'");
                }
            }
        }
    }

    /// Register a change listener, fired under the store lock on every value
    /// transition. Registering the same closure twice makes it fire twice.
    pub fn add_change_listener<F>(&self, listener: F)
    where
        F: Fn(&str, &TagValue, &TagValue, SystemTime) + Send + Sync + 'static,
    {
        self.inner.lock().listeners.push(Box::new(listener));
    }

    /// Point-in-time copy of every key and its current value.
    pub fn snapshot(&self) -> FxHashMap<String, TagValue> {
        let inner = self.inner.lock();
        inner
            .points
            .iter()
            .map(|(key, dp)| (key.clone(), dp.value.clone()))
            .collect()
    }

    /// Like [`DataStore::snapshot`], with full tag metadata.
    pub fn detailed_snapshot(&self) -> FxHashMap<String, TagDetail> {
        let inner = self.inner.lock();
        inner
            .points
            .iter()
            .map(|(key, dp)| {
                (
                    key.clone(),
                    TagDetail {
                        key: key.clone(),
                        value: dp.value.clone(),
                        default: dp.default.clone(),
                        data_type: dp.data_type,
                        units: dp.units.clone(),
                        address: dp.address,
                        timestamp: epoch_seconds(dp.timestamp),
                        last_change: epoch_seconds(dp.last_change),
                        quality: dp.quality,
                    },
                )
            })
            .collect()
    }

    /// The last `limit` samples for `key`, oldest first.
    pub fn get_history(&self, key: &str, limit: usize) -> Vec<HistorySample> {
        let inner = self.inner.lock();
        match inner.history.get(key) {
            Some(history) => {
                let skip = history.len().saturating_sub(limit);
                history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Current address → value view, sorted by address.
    pub fn address_space(&self) -> Vec<(u16, TagValue)> {
        let inner = self.inner.lock();
        let mut space: Vec<(u16, TagValue)> = inner
            .address_to_key
            .iter()
            .map(|(address, key)| {
                let value = inner
                    .points
                    .get(key)
                    .map(|dp| dp.value.clone())
                    .unwrap_or_else(TagValue::zero);
                (*address, value)
            })
            .collect();
        space.sort_by_key(|(address, _)| *address);
        space
    }

    pub fn statistics(&self) -> StoreStatistics {
        let inner = self.inner.lock();
        StoreStatistics {
            total_points: inner.points.len(),
            total_addresses: inner.address_to_key.len(),
            history_keys: inner.history.len(),
            total_history_entries: inner.history.values().map(VecDeque::len).sum(),
            bad_quality_points: inner
                .points
                .values()
                .filter(|dp| dp.quality != Quality::Good)
                .count(),
        }
    }

    pub fn address_space_info(&self) -> Vec<(DataType, RangeUsage)> {
        let inner = self.inner.lock();
        DataType::ALL
            .iter()
            .map(|&data_type| {
                let (range_start, range_end) = self.ranges.get(data_type);
                (
                    data_type,
                    RangeUsage {
                        range_start,
                        range_end,
                        next_available: inner.next_addresses[&data_type],
                        points_count: inner
                            .points
                            .values()
                            .filter(|dp| dp.data_type == data_type)
                            .count(),
                    },
                )
            })
            .collect()
    }
}

fn epoch_seconds(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn registration_is_idempotent_and_keeps_value() {
        let store = DataStore::new();
        let spec = TagSpec::new("temp", DataType::Float).units("°C");
        let a1 = store.register(&spec).unwrap();
        store.write("temp", json!(21.5));
        let a2 = store.register(&spec).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(store.read("temp"), TagValue::Float(21.5));
    }

    #[test]
    fn auto_allocated_addresses_are_unique_and_in_range() {
        let store = DataStore::new();
        let mut seen = Vec::new();
        for i in 0..10 {
            let a = store
                .register(&TagSpec::new(&format!("f{i}"), DataType::Float))
                .unwrap();
            assert!((40001..=41000).contains(&a));
            assert!(!seen.contains(&a));
            seen.push(a);
        }
        let b = store.register(&TagSpec::new("b0", DataType::Bool)).unwrap();
        assert!((42001..=43000).contains(&b));
    }

    #[test]
    fn explicit_address_conflict_is_rejected() {
        let store = DataStore::new();
        store
            .register(&TagSpec::new("one", DataType::Float).address(40010))
            .unwrap();
        let err = store
            .register(&TagSpec::new("two", DataType::Float).address(40010))
            .unwrap_err();
        assert!(matches!(err, StoreError::AddressConflict { address: 40010, .. }));
    }

    #[test]
    fn explicit_address_must_fall_in_the_type_range() {
        let store = DataStore::new();
        let err = store
            .register(&TagSpec::new("b", DataType::Bool).address(40001))
            .unwrap_err();
        assert!(matches!(err, StoreError::AddressOutOfRange { .. }));
    }

    #[test]
    fn allocation_exhaustion_reports_the_range() {
        let ranges = AddressRanges::default().with_range(DataType::Int, 100, 101);
        let store = DataStore::with_ranges(ranges);
        store.register(&TagSpec::new("i0", DataType::Int)).unwrap();
        store.register(&TagSpec::new("i1", DataType::Int)).unwrap();
        let err = store.register(&TagSpec::new("i2", DataType::Int)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::AddressSpaceExhausted {
                start: 100,
                end: 101,
                ..
            }
        ));
    }

    #[test]
    fn stable_ids_form_a_bijection() {
        let store = DataStore::new();
        let id1 = store.ensure_id("pump");
        let id2 = store.ensure_id("pump");
        assert_eq!(id1, id2);
        assert_eq!(id1.as_str().len(), 32);
        assert_eq!(store.key_for_id(&id1).as_deref(), Some("pump"));
        assert_ne!(store.ensure_id("other"), id1);
    }

    #[test]
    fn write_coerces_and_tracks_quality() {
        let store = DataStore::new();
        store
            .register(&TagSpec::new("temp", DataType::Float).default_value(json!(5.0)))
            .unwrap();

        store.write("temp", json!("17"));
        assert_eq!(store.read("temp"), TagValue::Float(17.0));
        assert_eq!(
            store.detailed_snapshot()["temp"].quality,
            Quality::Good
        );

        store.write("temp", json!("abc"));
        assert_eq!(store.read("temp"), TagValue::Float(5.0));
        assert_eq!(store.detailed_snapshot()["temp"].quality, Quality::Bad);

        store.write("temp", json!(10));
        assert_eq!(store.read("temp"), TagValue::Float(10.0));
        assert_eq!(store.detailed_snapshot()["temp"].quality, Quality::Good);
    }

    #[test]
    fn unknown_key_writes_are_dropped() {
        let store = DataStore::new();
        store.write("missing", json!(1));
        assert_eq!(store.read("missing"), TagValue::zero());
        assert_eq!(store.statistics().total_points, 0);
    }

    #[test]
    fn reads_and_writes_by_address() {
        let store = DataStore::new();
        let addr = store
            .register(&TagSpec::new("temp", DataType::Float).address(40001))
            .unwrap();
        store.write(addr, json!(23.5));
        assert_eq!(store.read(addr), TagValue::Float(23.5));
        assert_eq!(store.read(40999u16), TagValue::zero());
    }

    #[test]
    fn history_ring_is_bounded() {
        let store = DataStore::new().with_max_history(10);
        store.register(&TagSpec::new("c", DataType::Int)).unwrap();
        for i in 0..25 {
            store.write("c", json!(i));
        }
        let history = store.get_history("c", 100);
        assert_eq!(history.len(), 10);
        assert_eq!(history.first().unwrap().value, TagValue::Int(15));
        assert_eq!(history.last().unwrap().value, TagValue::Int(24));

        let last_three = store.get_history("c", 3);
        assert_eq!(last_three.len(), 3);
        assert_eq!(last_three[0].value, TagValue::Int(22));
    }

    #[test]
    fn listeners_fire_only_on_transitions() {
        let store = DataStore::new();
        store.register(&TagSpec::new("t", DataType::Int)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        store.add_change_listener(move |key, old, new, _| {
            assert_eq!(key, "t");
            assert_ne!(old, new);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.write("t", json!(1));
        store.write("t", json!(1));
        store.write("t", json!(2));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_listeners_fire_twice() {
        let store = DataStore::new();
        store.register(&TagSpec::new("t", DataType::Int)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let fired = fired.clone();
            store.add_change_listener(move |_, _, _, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        store.write("t", json!(7));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_panics_are_contained() {
        let store = DataStore::new();
        store.register(&TagSpec::new("t", DataType::Int)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        store.add_change_listener(|_, _, _, _| panic!("listener bug"));
        let fired_clone = fired.clone();
        store.add_change_listener(move |_, _, _, _| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        store.write("t", json!(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.read("t"), TagValue::Int(1));
    }

    #[test]
    fn failed_coercion_does_not_notify() {
        let store = DataStore::new();
        store.register(&TagSpec::new("t", DataType::Int)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        store.add_change_listener(move |_, _, _, _| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        store.write("t", json!(3));
        store.write("t", json!("bogus"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.detailed_snapshot()["t"].quality, Quality::Bad);
    }
}
