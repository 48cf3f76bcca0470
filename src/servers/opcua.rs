//! OPC-UA server: exposes the store under `Objects/SensorData` with one
//! writable variable per tag.
//!
//! Variables are created lazily the first time a tag shows up in a snapshot.
//! The UA scalar type is inferred from that first value and pinned for the
//! server's lifetime; later values are coerced to it (an int variable stays
//! Int32 and truncates incoming floats). The NodeId the variable gets is
//! written back into the OPC-UA mapping, replacing any pre-seeded locator.
//! Client writes are detected one tick later and routed through the store's
//! normal write path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opcua::server::prelude::*;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::mapping::opcua::{allocate_numeric_id, OpcUaAttrs, UaType};
use crate::mapping::OpcUaMapping;
use crate::store::DataStore;
use crate::value::TagValue;

pub const NAMESPACE_URI: &str = "http://dataservice.gateway.io";
const FOLDER_NAME: &str = "SensorData";

#[derive(Debug, Clone)]
pub struct OpcUaProps {
    pub host: String,
    pub port: u16,
}

/// UA scalar kind pinned to a variable at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaKind {
    Double,
    Int32,
    Boolean,
    Text,
}

impl UaKind {
    /// Inferred from the first value a tag shows up with.
    pub fn from_value(value: &TagValue) -> UaKind {
        match value {
            TagValue::Float(_) => UaKind::Double,
            TagValue::Int(_) => UaKind::Int32,
            TagValue::Bool(_) => UaKind::Boolean,
            TagValue::Str(_) | TagValue::Raw(_) => UaKind::Text,
        }
    }

    pub fn mapping_type(self) -> UaType {
        match self {
            UaKind::Double => UaType::Double,
            UaKind::Int32 => UaType::Int32,
            UaKind::Boolean => UaType::Boolean,
            UaKind::Text => UaType::String,
        }
    }

    fn data_type_id(self) -> DataTypeId {
        match self {
            UaKind::Double => DataTypeId::Double,
            UaKind::Int32 => DataTypeId::Int32,
            UaKind::Boolean => DataTypeId::Boolean,
            UaKind::Text => DataTypeId::String,
        }
    }

    /// Coerce a store value to the pinned kind. Lossy by design; the kind
    /// never changes once the variable exists.
    pub fn coerce(self, value: &TagValue) -> Variant {
        match self {
            UaKind::Double => Variant::Double(value.as_f64().unwrap_or(0.0)),
            UaKind::Int32 => Variant::Int32(value.as_i64().unwrap_or(0) as i32),
            UaKind::Boolean => Variant::Boolean(value.is_truthy()),
            UaKind::Text => Variant::String(UAString::from(value.to_string())),
        }
    }
}

/// Lower a UA variant written by a client into the store's JSON intake.
pub fn variant_to_json(variant: &Variant) -> serde_json::Value {
    match variant {
        Variant::Double(v) => serde_json::json!(v),
        Variant::Float(v) => serde_json::json!(v),
        Variant::Int16(v) => serde_json::json!(v),
        Variant::Int32(v) => serde_json::json!(v),
        Variant::Int64(v) => serde_json::json!(v),
        Variant::Byte(v) => serde_json::json!(v),
        Variant::SByte(v) => serde_json::json!(v),
        Variant::UInt16(v) => serde_json::json!(v),
        Variant::UInt32(v) => serde_json::json!(v),
        Variant::UInt64(v) => serde_json::json!(v),
        Variant::Boolean(v) => serde_json::json!(v),
        Variant::String(s) => serde_json::json!(s.to_string()),
        other => serde_json::json!(format!("{other:?}")),
    }
}

#[derive(Default)]
struct UaRuntime {
    vars: FxHashMap<String, (NodeId, UaKind)>,
    last_pushed: FxHashMap<String, Variant>,
}

/// Server entry point; blocks until the stop flag aborts the server.
pub fn run(
    store: Arc<DataStore>,
    mapping: Arc<OpcUaMapping>,
    props: OpcUaProps,
    stop: Arc<AtomicBool>,
    tick: Duration,
) {
    let server = ServerBuilder::new_anonymous("DataService OPC-UA Server")
        .application_uri("urn:dataservice-gateway")
        .product_uri("urn:dataservice-gateway")
        .create_sample_keypair(true)
        .host_and_port(&props.host, props.port)
        .discovery_urls(vec!["/".into()])
        .server();
    let mut server = match server {
        Some(server) => server,
        None => {
            log::error!("opcua: invalid server configuration, endpoint disabled");
            return;
        }
    };

    let address_space = server.address_space();
    let (namespace, folder_id) = {
        let mut space = address_space.write();
        let namespace = match space.register_namespace(NAMESPACE_URI) {
            Ok(namespace) => namespace,
            Err(()) => {
                log::error!("opcua: could not register namespace {NAMESPACE_URI}");
                return;
            }
        };
        let folder_id = match space.add_folder(FOLDER_NAME, FOLDER_NAME, &NodeId::objects_folder_id())
        {
            Ok(folder_id) => folder_id,
            Err(()) => {
                log::error!("opcua: could not create the {FOLDER_NAME} folder");
                return;
            }
        };
        (namespace, folder_id)
    };

    let server_state = server.server_state();
    let runtime = Mutex::new(UaRuntime::default());

    let tick_ms = tick.as_millis().max(1) as u64;
    server.add_polling_action(tick_ms, move || {
        if stop.load(Ordering::SeqCst) {
            server_state.write().abort();
            return;
        }

        let mut runtime = runtime.lock();
        let runtime = &mut *runtime;

        // Client writes first, so a fresh external value is not clobbered by
        // the push below.
        for (key, (node_id, _)) in runtime.vars.iter() {
            let current = {
                let space = address_space.read();
                space
                    .get_variable_value(node_id.clone())
                    .ok()
                    .and_then(|dv| dv.value)
            };
            let Some(current) = current else { continue };
            if runtime.last_pushed.get(key) != Some(&current) {
                log::debug!("opcua: client wrote {key} = {current:?}");
                store.write(key.as_str(), variant_to_json(&current));
            }
        }

        let snapshot = store.snapshot();

        // Materialize variables for tags we have not seen yet.
        for (key, value) in &snapshot {
            if runtime.vars.contains_key(key) {
                continue;
            }
            let kind = UaKind::from_value(value);
            let ua_type = kind.mapping_type();
            let numeric =
                match allocate_numeric_id(&mapping, namespace, ua_type, ua_type.sub_range().0) {
                    Ok(numeric) => numeric,
                    Err(e) => {
                        log::warn!("opcua: no NodeId left for {key}: {e}");
                        continue;
                    }
                };
            let node_id = NodeId::new(namespace, numeric);
            {
                let mut space = address_space.write();
                VariableBuilder::new(&node_id, key.as_str(), key.as_str())
                    .data_type(kind.data_type_id())
                    .value(kind.coerce(value))
                    .writable()
                    .organized_by(&folder_id)
                    .insert(&mut space);
            }

            let id = store.ensure_id(key);
            let result = match mapping.get(&id) {
                Some(existing) => {
                    // Lazy creation wins: keep the attributes, replace the
                    // locator with the NodeId that actually exists.
                    let mut attrs = existing.attrs;
                    attrs.node_id = node_id.to_string();
                    attrs.namespace = namespace;
                    mapping.set(id, key, attrs)
                }
                None => mapping.set(id, key, OpcUaAttrs::new(namespace, numeric, key, ua_type)),
            };
            if let Err(e) = result {
                log::warn!("opcua: could not record mapping for {key}: {e}");
            }
            log::info!("opcua: created variable {key} -> {node_id}");
            runtime.vars.insert(key.clone(), (node_id, kind));
        }

        // Push current values, coerced to each variable's pinned kind.
        let now = DateTime::now();
        let mut space = address_space.write();
        for (key, (node_id, kind)) in runtime.vars.iter() {
            let Some(value) = snapshot.get(key) else { continue };
            let variant = kind.coerce(value);
            space.set_variable_value(node_id.clone(), variant.clone(), &now, &now);
            runtime.last_pushed.insert(key.clone(), variant);
        }
    });

    log::info!(
        "OPC-UA server listening on opc.tcp://{}:{} (namespace {namespace}: {NAMESPACE_URI})",
        props.host,
        props.port
    );
    server.run();
    log::info!("OPC-UA server stopped");
}
