use super::classify::{classify, TagClass};
use super::{BulkReport, MappingTable, PaddingStrategy, ProtocolAttrs};
use crate::error::MappingError;
use crate::store::{DataStore, TagId};

pub type OpcUaMapping = MappingTable<OpcUaAttrs>;

/// UA scalar types the gateway materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaType {
    Double,
    Float,
    Int32,
    Int16,
    Boolean,
    String,
    Byte,
    SByte,
}

impl UaType {
    pub fn as_str(self) -> &'static str {
        match self {
            UaType::Double => "Double",
            UaType::Float => "Float",
            UaType::Int32 => "Int32",
            UaType::Int16 => "Int16",
            UaType::Boolean => "Boolean",
            UaType::String => "String",
            UaType::Byte => "Byte",
            UaType::SByte => "SByte",
        }
    }

    /// Numeric-identifier sub-range used when allocating NodeIds.
    pub fn sub_range(self) -> (u32, u32) {
        match self {
            UaType::Double => (100, 199),
            UaType::Int32 => (200, 299),
            UaType::Int16 => (300, 399),
            UaType::Boolean => (400, 499),
            UaType::String => (500, 599),
            UaType::Float => (600, 699),
            UaType::Byte => (700, 799),
            UaType::SByte => (800, 899),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaAccess {
    CurrentRead,
    CurrentWrite,
    CurrentReadOrWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaTimestamps {
    Neither,
    Server,
    Source,
    Both,
}

#[derive(Debug, Clone)]
pub struct OpcUaAttrs {
    /// Full NodeId in its string form, e.g. `ns=2;i=105`.
    pub node_id: String,
    pub namespace: u16,
    pub browse_name: String,
    pub display_name: String,
    pub data_type: UaType,
    pub value_rank: i32,
    pub access_level: UaAccess,
    pub timestamps: UaTimestamps,
    pub description: String,
}

impl OpcUaAttrs {
    pub fn new(namespace: u16, numeric_id: u32, key: &str, data_type: UaType) -> OpcUaAttrs {
        OpcUaAttrs {
            node_id: format!("ns={namespace};i={numeric_id}"),
            namespace,
            browse_name: key.to_string(),
            display_name: key.to_string(),
            data_type,
            value_rank: -1,
            access_level: UaAccess::CurrentReadOrWrite,
            timestamps: UaTimestamps::Both,
            description: String::new(),
        }
    }

    /// The numeric identifier, if the NodeId has the `ns=<ns>;i=<n>` form.
    pub fn numeric_id(&self) -> Option<u32> {
        self.node_id
            .split_once(";i=")
            .and_then(|(_, n)| n.parse().ok())
    }
}

impl ProtocolAttrs for OpcUaAttrs {
    const PROTOCOL: &'static str = "opcua";

    /// Uniqueness is on the full NodeId.
    fn conflicts_with(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }

    fn locator_label(&self) -> String {
        self.node_id.clone()
    }
}

pub fn class_to_ua(class: TagClass) -> UaType {
    match class {
        TagClass::FloatMeasurement => UaType::Double,
        TagClass::SinglePoint => UaType::Boolean,
        TagClass::SmallInt => UaType::Int16,
        TagClass::WideInt => UaType::Int32,
        TagClass::Text => UaType::String,
        TagClass::Other => UaType::Double,
    }
}

fn auto_access(key: &str) -> UaAccess {
    let key = key.to_lowercase();
    const WRITABLE: &[&str] = &["status", "enabled", "motor", "position", "valve"];
    const MEASUREMENTS: &[&str] = &["temp", "pressure", "flow", "vibrat", "power"];
    if WRITABLE.iter().any(|k| key.contains(k)) {
        UaAccess::CurrentReadOrWrite
    } else if MEASUREMENTS.iter().any(|k| key.contains(k)) {
        UaAccess::CurrentRead
    } else {
        UaAccess::CurrentReadOrWrite
    }
}

fn auto_timestamps(key: &str) -> UaTimestamps {
    let key = key.to_lowercase();
    const MEASUREMENTS: &[&str] = &["temp", "pressure", "flow", "vibrat", "power"];
    const STATUS: &[&str] = &["status", "enabled", "motor"];
    if MEASUREMENTS.iter().any(|k| key.contains(k)) {
        UaTimestamps::Both
    } else if STATUS.iter().any(|k| key.contains(k)) {
        UaTimestamps::Server
    } else {
        UaTimestamps::Both
    }
}

/// Find the lowest free numeric identifier for `data_type` in `namespace`,
/// at or above `from`, inspecting every existing mapping in that namespace.
pub fn allocate_numeric_id(
    table: &OpcUaMapping,
    namespace: u16,
    data_type: UaType,
    from: u32,
) -> Result<u32, MappingError> {
    let (start, end) = data_type.sub_range();
    let used: Vec<u32> = table
        .all()
        .values()
        .filter(|mapping| mapping.attrs.namespace == namespace)
        .filter_map(|mapping| mapping.attrs.numeric_id())
        .collect();

    let mut candidate = from.max(start);
    while candidate <= end {
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
        candidate += 1;
    }
    Err(MappingError::LocatorSpaceExhausted {
        protocol: "opcua",
        start,
        end,
    })
}

/// Bulk auto-generation of OPC-UA mappings with numeric-id sub-ranges per UA
/// type and access/timestamps picked from the key.
pub fn auto_generate(
    store: &DataStore,
    table: &OpcUaMapping,
    ids: &[TagId],
    namespace: u16,
    start_id: u32,
    strategy: PaddingStrategy,
) -> BulkReport {
    let mut report = BulkReport::default();
    let mut cursor = start_id;
    let details = store.detailed_snapshot();

    for id in ids {
        let Some(key) = store.key_for_id(id) else {
            report.push_err(id.clone(), None, "id not found in data store".to_string());
            continue;
        };
        let Some(detail) = details.get(&key) else {
            report.push_err(id.clone(), Some(&key), "tag not registered".to_string());
            continue;
        };

        let data_type = class_to_ua(classify(detail.data_type, &detail.units, &key));
        let numeric_id = match strategy {
            PaddingStrategy::DataType => {
                match allocate_numeric_id(table, namespace, data_type, data_type.sub_range().0) {
                    Ok(n) => n,
                    Err(e) => {
                        report.push_err(id.clone(), Some(&key), e.to_string());
                        continue;
                    }
                }
            }
            PaddingStrategy::Sequential => {
                let n = cursor;
                cursor += 1;
                n
            }
        };

        let mut attrs = OpcUaAttrs::new(namespace, numeric_id, &key, data_type);
        attrs.access_level = auto_access(&key);
        attrs.timestamps = auto_timestamps(&key);
        attrs.description = format!("Auto-generated for {key} ({})", detail.data_type);
        match table.set(id.clone(), &key, attrs) {
            Ok(()) => report.push_ok(id.clone(), &key, numeric_id),
            Err(e) => report.push_err(id.clone(), Some(&key), e.to_string()),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TagSpec;
    use crate::value::DataType;

    #[test]
    fn node_id_string_form_and_parse() {
        let attrs = OpcUaAttrs::new(2, 105, "temp", UaType::Double);
        assert_eq!(attrs.node_id, "ns=2;i=105");
        assert_eq!(attrs.numeric_id(), Some(105));
    }

    #[test]
    fn allocation_skips_used_ids_in_the_namespace() {
        let table = OpcUaMapping::new();
        table
            .set(
                TagId::from("a"),
                "a",
                OpcUaAttrs::new(2, 100, "a", UaType::Double),
            )
            .unwrap();
        table
            .set(
                TagId::from("b"),
                "b",
                OpcUaAttrs::new(2, 101, "b", UaType::Double),
            )
            .unwrap();
        // Same ids in another namespace do not count.
        table
            .set(
                TagId::from("c"),
                "c",
                OpcUaAttrs::new(3, 102, "c", UaType::Double),
            )
            .unwrap();

        let n = allocate_numeric_id(&table, 2, UaType::Double, 100).unwrap();
        assert_eq!(n, 102);
        let n3 = allocate_numeric_id(&table, 3, UaType::Double, 100).unwrap();
        assert_eq!(n3, 100);
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let table = OpcUaMapping::new();
        table
            .set(
                TagId::from("a"),
                "a",
                OpcUaAttrs::new(2, 100, "a", UaType::Double),
            )
            .unwrap();
        assert!(table
            .set(
                TagId::from("b"),
                "b",
                OpcUaAttrs::new(2, 100, "b", UaType::Boolean),
            )
            .is_err());
    }

    #[test]
    fn auto_map_assigns_types_and_access() {
        let store = DataStore::new();
        let table = OpcUaMapping::new();
        store
            .register(&TagSpec::new("tempA", DataType::Float).units("°C"))
            .unwrap();
        store.register(&TagSpec::new("motorOn", DataType::Bool)).unwrap();
        let ids = vec![store.ensure_id("tempA"), store.ensure_id("motorOn")];

        let report = auto_generate(&store, &table, &ids, 2, 100, PaddingStrategy::DataType);
        assert_eq!(report.mapped(), 2);

        let temp = table.find_by_key("tempA").unwrap().1.attrs;
        assert_eq!(temp.data_type, UaType::Double);
        assert_eq!(temp.node_id, "ns=2;i=100");
        assert_eq!(temp.access_level, UaAccess::CurrentRead);

        let motor = table.find_by_key("motorOn").unwrap().1.attrs;
        assert_eq!(motor.data_type, UaType::Boolean);
        assert_eq!(motor.node_id, "ns=2;i=400");
        assert_eq!(motor.access_level, UaAccess::CurrentReadOrWrite);
        assert_eq!(motor.timestamps, UaTimestamps::Server);
    }
}
