use serde_derive::{Deserialize, Serialize};

use super::classify::{classify, TagClass};
use super::{Access, BulkReport, MappingTable, PaddingStrategy, ProtocolAttrs};
use crate::error::MappingError;
use crate::store::{DataStore, TagId};

pub type ModbusMapping = MappingTable<ModbusAttrs>;

/// Register-level representation of a mapped tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModbusType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    String8,
    String16,
    Bool,
}

impl ModbusType {
    /// Number of 16-bit registers one value of this type occupies.
    pub fn register_count(self) -> u16 {
        match self {
            ModbusType::Int16 | ModbusType::Uint16 | ModbusType::Bool => 1,
            ModbusType::Int32 | ModbusType::Uint32 | ModbusType::Float32 => 2,
            ModbusType::String8 => 4,
            ModbusType::String16 => 8,
        }
    }

    /// Register sub-range used by `data_type`-padded auto-generation.
    pub fn sub_range(self) -> (u16, u16) {
        match self {
            ModbusType::Float32 => (40001, 41000),
            ModbusType::Int32 | ModbusType::Uint32 => (41001, 42000),
            ModbusType::Int16 | ModbusType::Uint16 => (42001, 43000),
            ModbusType::String8 => (43001, 44000),
            ModbusType::String16 => (44001, 45000),
            ModbusType::Bool => (45001, 46000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone)]
pub struct ModbusAttrs {
    pub register_address: u16,
    pub function_code: u8,
    pub data_type: ModbusType,
    pub access: Access,
    pub scaling_factor: f64,
    pub endianness: Endianness,
    pub description: String,
}

impl ModbusAttrs {
    pub fn new(register_address: u16, data_type: ModbusType) -> ModbusAttrs {
        ModbusAttrs {
            register_address,
            function_code: 3,
            data_type,
            access: Access::ReadWrite,
            scaling_factor: 1.0,
            endianness: Endianness::Big,
            description: String::new(),
        }
    }

    fn span(&self) -> (u16, u16) {
        let count = self.data_type.register_count();
        (
            self.register_address,
            self.register_address.saturating_add(count - 1),
        )
    }
}

impl ProtocolAttrs for ModbusAttrs {
    const PROTOCOL: &'static str = "modbus";

    /// Uniqueness is at register-span level: two mappings conflict when
    /// their occupied register ranges overlap.
    fn conflicts_with(&self, other: &Self) -> bool {
        let (a_start, a_end) = self.span();
        let (b_start, b_end) = other.span();
        a_start <= b_end && b_start <= a_end
    }

    fn locator_label(&self) -> String {
        let (start, end) = self.span();
        format!("registers {start}-{end}")
    }
}

fn class_to_modbus(class: TagClass) -> ModbusType {
    match class {
        TagClass::FloatMeasurement => ModbusType::Float32,
        TagClass::SinglePoint => ModbusType::Bool,
        TagClass::SmallInt => ModbusType::Int16,
        TagClass::WideInt => ModbusType::Int32,
        TagClass::Text => ModbusType::String8,
        TagClass::Other => ModbusType::Int16,
    }
}

/// Find the lowest free register span of `count` registers at or above
/// `from` within `data_type`'s sub-range, skipping spans already claimed in
/// the table.
fn allocate_span(
    table: &ModbusMapping,
    data_type: ModbusType,
    from: u16,
    count: u16,
) -> Result<u16, MappingError> {
    let (start, end) = data_type.sub_range();
    let taken: Vec<(u16, u16)> = table
        .all()
        .values()
        .map(|mapping| mapping.attrs.span())
        .collect();

    let count = u32::from(count);
    let mut candidate = u32::from(from.max(start));
    'candidates: while candidate + count - 1 <= u32::from(end) {
        for &(t_start, t_end) in &taken {
            if candidate <= u32::from(t_end) && u32::from(t_start) <= candidate + count - 1 {
                candidate = u32::from(t_end) + 1;
                continue 'candidates;
            }
        }
        return Ok(candidate as u16);
    }
    Err(MappingError::LocatorSpaceExhausted {
        protocol: "modbus",
        start: start as u32,
        end: end as u32,
    })
}

/// Bulk auto-generation of Modbus mappings for a list of tag ids.
///
/// Register data types come from the deterministic classifier; the padding
/// strategy either groups spans into per-type sub-ranges or packs them
/// contiguously from `start_address`.
pub fn auto_generate(
    store: &DataStore,
    table: &ModbusMapping,
    ids: &[TagId],
    start_address: u16,
    strategy: PaddingStrategy,
) -> BulkReport {
    let mut report = BulkReport::default();
    let mut cursor = start_address;
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

        let data_type = class_to_modbus(classify(detail.data_type, &detail.units, &key));
        let count = data_type.register_count();

        let address = match strategy {
            PaddingStrategy::DataType => {
                match allocate_span(table, data_type, data_type.sub_range().0, count) {
                    Ok(address) => address,
                    Err(e) => {
                        report.push_err(id.clone(), Some(&key), e.to_string());
                        continue;
                    }
                }
            }
            PaddingStrategy::Sequential => {
                let address = cursor;
                cursor += count;
                address
            }
        };

        let mut attrs = ModbusAttrs::new(address, data_type);
        attrs.description = format!("Auto-generated for {key} ({})", detail.data_type);
        match table.set(id.clone(), &key, attrs) {
            Ok(()) => report.push_ok(id.clone(), &key, address as u32),
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
    fn span_overlap_is_rejected() {
        let table = ModbusMapping::new();
        table
            .set(
                TagId::from("a"),
                "a",
                ModbusAttrs::new(40001, ModbusType::Float32),
            )
            .unwrap();
        // 40002 is still inside a's two-register span.
        let err = table
            .set(
                TagId::from("b"),
                "b",
                ModbusAttrs::new(40002, ModbusType::Int16),
            )
            .unwrap_err();
        assert!(err.to_string().contains("40002"));
        // 40003 is free.
        table
            .set(
                TagId::from("b"),
                "b",
                ModbusAttrs::new(40003, ModbusType::Int16),
            )
            .unwrap();
    }

    #[test]
    fn resetting_the_same_id_may_move_its_locator() {
        let table = ModbusMapping::new();
        let id = TagId::from("a");
        table
            .set(id.clone(), "a", ModbusAttrs::new(40001, ModbusType::Int16))
            .unwrap();
        table
            .set(id.clone(), "a", ModbusAttrs::new(40005, ModbusType::Int16))
            .unwrap();
        assert_eq!(table.get(&id).unwrap().attrs.register_address, 40005);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn data_type_padding_groups_by_sub_range() {
        let store = DataStore::new();
        let table = ModbusMapping::new();
        store
            .register(&TagSpec::new("tempA", DataType::Float).units("°C"))
            .unwrap();
        store.register(&TagSpec::new("motorOn", DataType::Bool)).unwrap();
        store.register(&TagSpec::new("counter", DataType::Int)).unwrap();
        let ids = vec![
            store.ensure_id("tempA"),
            store.ensure_id("motorOn"),
            store.ensure_id("counter"),
        ];

        let report = auto_generate(&store, &table, &ids, 40001, PaddingStrategy::DataType);
        assert_eq!(report.mapped(), 3);

        let temp = table.find_by_key("tempA").unwrap().1.attrs;
        assert_eq!(temp.register_address, 40001);
        assert_eq!(temp.data_type, ModbusType::Float32);
        let motor = table.find_by_key("motorOn").unwrap().1.attrs;
        assert_eq!(motor.register_address, 45001);
        assert_eq!(motor.data_type, ModbusType::Bool);
        let counter = table.find_by_key("counter").unwrap().1.attrs;
        assert_eq!(counter.register_address, 41001);
        assert_eq!(counter.data_type, ModbusType::Int32);
    }

    #[test]
    fn data_type_padding_skips_taken_spans() {
        let store = DataStore::new();
        let table = ModbusMapping::new();
        table
            .set(
                TagId::from("pre"),
                "pre",
                ModbusAttrs::new(40001, ModbusType::Float32),
            )
            .unwrap();
        store
            .register(&TagSpec::new("flowA", DataType::Float).units("l/min"))
            .unwrap();
        let ids = vec![store.ensure_id("flowA")];

        let report = auto_generate(&store, &table, &ids, 40001, PaddingStrategy::DataType);
        assert_eq!(report.mapped(), 1);
        assert_eq!(
            table.find_by_key("flowA").unwrap().1.attrs.register_address,
            40003
        );
    }

    #[test]
    fn sequential_padding_packs_contiguously() {
        let store = DataStore::new();
        let table = ModbusMapping::new();
        store
            .register(&TagSpec::new("t1", DataType::Float).units("°C"))
            .unwrap();
        store
            .register(&TagSpec::new("t2", DataType::Float).units("°C"))
            .unwrap();
        let ids = vec![store.ensure_id("t1"), store.ensure_id("t2")];

        let report = auto_generate(&store, &table, &ids, 40101, PaddingStrategy::Sequential);
        assert_eq!(report.mapped(), 2);
        assert_eq!(table.find_by_key("t1").unwrap().1.attrs.register_address, 40101);
        assert_eq!(table.find_by_key("t2").unwrap().1.attrs.register_address, 40103);
        assert_eq!(report.first_locator, Some(40101));
        assert_eq!(report.last_locator, Some(40103));
    }

    #[test]
    fn unknown_ids_report_individual_errors() {
        let store = DataStore::new();
        let table = ModbusMapping::new();
        let report = auto_generate(
            &store,
            &table,
            &[TagId::from("nope")],
            40001,
            PaddingStrategy::DataType,
        );
        assert_eq!(report.mapped(), 0);
        assert_eq!(report.failed(), 1);
        assert!(report.entries[0].error.as_deref().unwrap().contains("not found"));
    }
}
