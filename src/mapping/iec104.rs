use super::classify::{classify, TagClass};
use super::{Access, BulkReport, MappingTable, PaddingStrategy, ProtocolAttrs};
use crate::error::MappingError;
use crate::store::{DataStore, TagId};

pub type Iec104Mapping = MappingTable<Iec104Attrs>;

/// ASDU types the gateway knows how to map. Only the periodic-monitoring
/// subset of the standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsduType {
    /// Single-point information.
    MSpNa1,
    /// Measured value, normalized.
    MMeNa1,
    /// Measured value, scaled.
    MMeNb1,
    /// Measured value, short floating point.
    MMeNc1,
    /// Measured value, floating point.
    MMeNf1,
}

impl AsduType {
    pub fn as_str(self) -> &'static str {
        match self {
            AsduType::MSpNa1 => "M_SP_NA_1",
            AsduType::MMeNa1 => "M_ME_NA_1",
            AsduType::MMeNb1 => "M_ME_NB_1",
            AsduType::MMeNc1 => "M_ME_NC_1",
            AsduType::MMeNf1 => "M_ME_NF_1",
        }
    }

    /// IOA sub-range used by `data_type`-padded auto-generation.
    pub fn sub_range(self) -> (u32, u32) {
        match self {
            AsduType::MMeNc1 => (1000, 1999),
            AsduType::MMeNb1 => (2000, 2999),
            AsduType::MSpNa1 => (3000, 3999),
            AsduType::MMeNa1 => (4000, 4999),
            AsduType::MMeNf1 => (5000, 5999),
        }
    }
}

/// Cause of transmission carried in emitted ASDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Periodic,
    Spontaneous,
    Request,
}

impl Cause {
    pub fn wire_code(self) -> u8 {
        match self {
            Cause::Periodic => 1,
            Cause::Spontaneous => 3,
            Cause::Request => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Iec104Attrs {
    /// Information object address, 24 bits.
    pub ioa: u32,
    pub common_address: u16,
    pub type_id: AsduType,
    pub cause: Cause,
    pub with_quality: bool,
    pub with_timestamp: bool,
    pub access: Access,
    pub description: String,
}

impl Iec104Attrs {
    pub fn new(ioa: u32, type_id: AsduType) -> Iec104Attrs {
        Iec104Attrs {
            ioa,
            common_address: 1,
            type_id,
            cause: Cause::Spontaneous,
            with_quality: true,
            with_timestamp: true,
            access: Access::Read,
            description: String::new(),
        }
    }
}

impl ProtocolAttrs for Iec104Attrs {
    const PROTOCOL: &'static str = "iec104";

    /// Uniqueness is per (common address, IOA) pair.
    fn conflicts_with(&self, other: &Self) -> bool {
        self.common_address == other.common_address && self.ioa == other.ioa
    }

    fn locator_label(&self) -> String {
        format!("CA {} IOA {}", self.common_address, self.ioa)
    }
}

fn class_to_asdu(class: TagClass) -> AsduType {
    match class {
        TagClass::FloatMeasurement => AsduType::MMeNc1,
        TagClass::SinglePoint => AsduType::MSpNa1,
        TagClass::SmallInt | TagClass::WideInt => AsduType::MMeNb1,
        TagClass::Text | TagClass::Other => AsduType::MMeNc1,
    }
}

/// Single-point information is event-like and goes out spontaneously;
/// measured values are continuous and go out periodically.
fn auto_cause(type_id: AsduType) -> Cause {
    match type_id {
        AsduType::MSpNa1 => Cause::Spontaneous,
        _ => Cause::Periodic,
    }
}

fn allocate_ioa(table: &Iec104Mapping, type_id: AsduType, from: u32) -> Result<u32, MappingError> {
    let (start, end) = type_id.sub_range();
    let taken: Vec<u32> = table
        .all()
        .values()
        .filter(|mapping| mapping.attrs.common_address == 1)
        .map(|mapping| mapping.attrs.ioa)
        .collect();

    let mut candidate = from.max(start);
    while candidate <= end {
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        candidate += 1;
    }
    Err(MappingError::LocatorSpaceExhausted {
        protocol: "iec104",
        start,
        end,
    })
}

/// Bulk auto-generation of IEC-104 mappings with per-type IOA sub-ranges and
/// automatic cause-of-transmission selection.
pub fn auto_generate(
    store: &DataStore,
    table: &Iec104Mapping,
    ids: &[TagId],
    start_ioa: u32,
    strategy: PaddingStrategy,
) -> BulkReport {
    let mut report = BulkReport::default();
    let mut cursor = start_ioa;
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

        let type_id = class_to_asdu(classify(detail.data_type, &detail.units, &key));
        let ioa = match strategy {
            PaddingStrategy::DataType => {
                match allocate_ioa(table, type_id, type_id.sub_range().0) {
                    Ok(ioa) => ioa,
                    Err(e) => {
                        report.push_err(id.clone(), Some(&key), e.to_string());
                        continue;
                    }
                }
            }
            PaddingStrategy::Sequential => {
                let ioa = cursor;
                cursor += 1;
                ioa
            }
        };

        let mut attrs = Iec104Attrs::new(ioa, type_id);
        attrs.cause = auto_cause(type_id);
        attrs.description = format!("Auto-generated for {key} ({})", detail.data_type);
        match table.set(id.clone(), &key, attrs) {
            Ok(()) => report.push_ok(id.clone(), &key, ioa),
            Err(e) => report.push_err(id.clone(), Some(&key), e.to_string()),
        }
    }

    report
}
