//! Tag manifest loading and startup auto-mapping.
//!
//! The manifest is a JSON array of tag specs:
//!
//! ```json
//! [
//!   {"key": "temperature", "data_type": "float", "units": "°C", "address": 40001},
//!   {"key": "motorOn", "data_type": "bool", "default": false}
//! ]
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::GatewayError;
use crate::mapping::{self, PaddingStrategy};
use crate::store::{DataStore, TagId, TagSpec};

pub fn load_manifest(path: &Path) -> Result<Vec<TagSpec>, GatewayError> {
    let file = File::open(path).map_err(|e| GatewayError::ManifestIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| GatewayError::ManifestParse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Register every manifest tag; conflicts are logged and skipped so one bad
/// entry does not take the gateway down. Returns the number registered.
pub fn register_all(store: &DataStore, specs: &[TagSpec]) -> usize {
    let mut registered = 0;
    for spec in specs {
        match store.register(spec) {
            Ok(address) => {
                log::debug!("registered tag '{}' at address {address}", spec.key);
                registered += 1;
            }
            Err(e) => log::error!("could not register tag '{}': {e}", spec.key),
        }
    }
    registered
}

/// Handles to the four mapping registries, as passed around the binary.
pub struct MappingSet {
    pub modbus: std::sync::Arc<mapping::ModbusMapping>,
    pub iec104: std::sync::Arc<mapping::Iec104Mapping>,
    pub opcua: std::sync::Arc<mapping::OpcUaMapping>,
    pub snmp: std::sync::Arc<mapping::SnmpMapping>,
}

/// Bulk-map every registered tag onto all four protocols with `data_type`
/// padding, the startup behavior behind `run --auto-map`.
pub fn auto_map_all(store: &DataStore, maps: &MappingSet) {
    let mut keys: Vec<String> = store.snapshot().into_keys().collect();
    keys.sort();
    let ids: Vec<TagId> = keys.iter().map(|key| store.ensure_id(key)).collect();
    if ids.is_empty() {
        return;
    }

    let report = mapping::modbus::auto_generate(
        store,
        &maps.modbus,
        &ids,
        40001,
        PaddingStrategy::DataType,
    );
    log::info!(
        "auto-mapped {} of {} tags onto modbus (registers {:?}-{:?})",
        report.mapped(),
        ids.len(),
        report.first_locator,
        report.last_locator
    );

    let report = mapping::iec104::auto_generate(
        store,
        &maps.iec104,
        &ids,
        1000,
        PaddingStrategy::DataType,
    );
    log::info!("auto-mapped {} of {} tags onto iec104", report.mapped(), ids.len());

    let report = mapping::opcua::auto_generate(
        store,
        &maps.opcua,
        &ids,
        2,
        100,
        PaddingStrategy::DataType,
    );
    log::info!("auto-mapped {} of {} tags onto opcua", report.mapped(), ids.len());

    let report =
        mapping::snmp::auto_generate(store, &maps.snmp, &ids, 1, PaddingStrategy::DataType);
    log::info!("auto-mapped {} of {} tags onto snmp", report.mapped(), ids.len());

    for entry in report.entries.iter().filter(|entry| !entry.ok()) {
        log::warn!(
            "auto-map failure for id {}: {}",
            entry.id,
            entry.error.as_deref().unwrap_or("unknown")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.json");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            r#"[
                {{"key": "temperature", "data_type": "float", "units": "°C", "address": 40001}},
                {{"key": "motorOn", "data_type": "bool", "default": false}}
            ]"#
        )
        .unwrap();

        let specs = load_manifest(&path).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].key, "temperature");
        assert_eq!(specs[0].data_type, DataType::Float);
        assert_eq!(specs[0].address, Some(40001));
        assert_eq!(specs[1].data_type, DataType::Bool);

        let store = DataStore::new();
        assert_eq!(register_all(&store, &specs), 2);
        assert_eq!(store.statistics().total_points, 2);
    }

    #[test]
    fn bad_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_manifest(&path).is_err());
        assert!(load_manifest(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn auto_map_all_fills_every_registry() {
        let store = DataStore::new();
        store
            .register(&TagSpec::new("tempA", DataType::Float).units("°C"))
            .unwrap();
        store
            .register(&TagSpec::new("motorOn", DataType::Bool))
            .unwrap();
        let maps = MappingSet {
            modbus: Arc::new(mapping::ModbusMapping::new()),
            iec104: Arc::new(mapping::Iec104Mapping::new()),
            opcua: Arc::new(mapping::OpcUaMapping::new()),
            snmp: Arc::new(mapping::SnmpMapping::new()),
        };
        auto_map_all(&store, &maps);
        assert_eq!(maps.modbus.len(), 2);
        assert_eq!(maps.iec104.len(), 2);
        assert_eq!(maps.opcua.len(), 2);
        assert_eq!(maps.snmp.len(), 2);
    }
}
