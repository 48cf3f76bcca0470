use super::classify::{classify, TagClass};
use super::{Access, BulkReport, MappingTable, PaddingStrategy, ProtocolAttrs};
use crate::store::{DataStore, TagId};

pub type SnmpMapping = MappingTable<SnmpAttrs>;

/// Enterprise OID every mapped scalar lives under.
pub const ENTERPRISE_OID: &[u32] = &[1, 3, 6, 1, 4, 1, 52446];

/// SNMP syntaxes the agent can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpSyntax {
    Integer,
    Gauge32,
    Counter32,
    Counter64,
    OctetString,
}

impl SnmpSyntax {
    pub fn as_str(self) -> &'static str {
        match self {
            SnmpSyntax::Integer => "Integer",
            SnmpSyntax::Gauge32 => "Gauge32",
            SnmpSyntax::Counter32 => "Counter32",
            SnmpSyntax::Counter64 => "Counter64",
            SnmpSyntax::OctetString => "OctetString",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnmpAttrs {
    /// Positive suffix under [`ENTERPRISE_OID`].
    pub oid_suffix: u32,
    pub syntax: SnmpSyntax,
    pub access: Access,
    /// Table-entry index, unused for plain scalars.
    pub index: Option<u32>,
    pub description: String,
}

impl SnmpAttrs {
    pub fn new(oid_suffix: u32, syntax: SnmpSyntax) -> SnmpAttrs {
        SnmpAttrs {
            oid_suffix,
            syntax,
            access: Access::Read,
            index: None,
            description: String::new(),
        }
    }
}

impl ProtocolAttrs for SnmpAttrs {
    const PROTOCOL: &'static str = "snmp";

    fn conflicts_with(&self, other: &Self) -> bool {
        self.oid_suffix == other.oid_suffix
    }

    fn locator_label(&self) -> String {
        format!("OID suffix {}", self.oid_suffix)
    }
}

fn class_to_syntax(class: TagClass) -> SnmpSyntax {
    match class {
        TagClass::FloatMeasurement => SnmpSyntax::Gauge32,
        TagClass::SinglePoint | TagClass::SmallInt | TagClass::WideInt => SnmpSyntax::Integer,
        TagClass::Text | TagClass::Other => SnmpSyntax::OctetString,
    }
}

fn next_free_suffix(table: &SnmpMapping, from: u32) -> u32 {
    let used: Vec<u32> = table
        .all()
        .values()
        .map(|mapping| mapping.attrs.oid_suffix)
        .collect();
    let mut candidate = from.max(1);
    while used.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

/// Bulk auto-generation of SNMP scalar mappings: each id gets the next free
/// positive suffix under the enterprise OID. Both padding strategies behave
/// the same here since SNMP has a single flat suffix space.
pub fn auto_generate(
    store: &DataStore,
    table: &SnmpMapping,
    ids: &[TagId],
    start_suffix: u32,
    _strategy: PaddingStrategy,
) -> BulkReport {
    let mut report = BulkReport::default();
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

        let syntax = class_to_syntax(classify(detail.data_type, &detail.units, &key));
        let suffix = next_free_suffix(table, start_suffix);
        let mut attrs = SnmpAttrs::new(suffix, syntax);
        attrs.description = format!("Auto-generated for {key} ({})", detail.data_type);
        match table.set(id.clone(), &key, attrs) {
            Ok(()) => report.push_ok(id.clone(), &key, suffix),
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
    fn suffixes_are_unique_and_positive() {
        let store = DataStore::new();
        let table = SnmpMapping::new();
        for key in ["a", "b", "c"] {
            store.register(&TagSpec::new(key, DataType::Int)).unwrap();
        }
        let ids: Vec<TagId> = ["a", "b", "c"].iter().map(|k| store.ensure_id(k)).collect();
        let report = auto_generate(&store, &table, &ids, 1, PaddingStrategy::DataType);
        assert_eq!(report.mapped(), 3);

        let mut suffixes: Vec<u32> = table
            .all()
            .values()
            .map(|m| m.attrs.oid_suffix)
            .collect();
        suffixes.sort_unstable();
        assert_eq!(suffixes, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_suffixes_are_rejected() {
        let table = SnmpMapping::new();
        table
            .set(TagId::from("a"), "a", SnmpAttrs::new(7, SnmpSyntax::Integer))
            .unwrap();
        assert!(table
            .set(TagId::from("b"), "b", SnmpAttrs::new(7, SnmpSyntax::Gauge32))
            .is_err());
    }

    #[test]
    fn syntax_follows_the_classifier() {
        let store = DataStore::new();
        let table = SnmpMapping::new();
        store
            .register(&TagSpec::new("tempA", DataType::Float).units("°C"))
            .unwrap();
        store.register(&TagSpec::new("label", DataType::String)).unwrap();
        let ids = vec![store.ensure_id("tempA"), store.ensure_id("label")];
        auto_generate(&store, &table, &ids, 1, PaddingStrategy::DataType);

        assert_eq!(
            table.find_by_key("tempA").unwrap().1.attrs.syntax,
            SnmpSyntax::Gauge32
        );
        assert_eq!(
            table.find_by_key("label").unwrap().1.attrs.syntax,
            SnmpSyntax::OctetString
        );
    }
}
