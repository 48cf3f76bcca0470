mod cli;

use std::net::{TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use clap::Parser;

use dataservice_gateway::config::GatewayProps;
use dataservice_gateway::ipc::{IpcClient, IpcServer};
use dataservice_gateway::mapping::{Iec104Mapping, ModbusMapping, OpcUaMapping, SnmpMapping};
use dataservice_gateway::store::DataStore;
use dataservice_gateway::tags::{self, MappingSet};
use dataservice_gateway::{forwarder, servers};

fn main() {
    env_logger::init();

    let opt = cli::Opt::parse();
    match opt.action {
        cli::Action::Run(run_args) => do_run_action(run_args),
        cli::Action::Write(write_args) => do_write_action(write_args),
    }
}

fn do_run_action(args: cli::RunArgs) {
    let props = GatewayProps::from_env();

    let store = Arc::new(DataStore::new());
    // Listeners run under the store lock; logging is all this one does.
    store.add_change_listener(|key, old, new, _| {
        log::debug!("change: {key} {old} -> {new}");
    });
    let maps = MappingSet {
        modbus: Arc::new(ModbusMapping::new()),
        iec104: Arc::new(Iec104Mapping::new()),
        opcua: Arc::new(OpcUaMapping::new()),
        snmp: Arc::new(SnmpMapping::new()),
    };

    if let Some(path) = &args.tags {
        let specs = match tags::load_manifest(path) {
            Ok(specs) => specs,
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1)
            }
        };
        let registered = tags::register_all(&store, &specs);
        log::info!("registered {registered} tags from {}", path.display());
    }
    if args.auto_map {
        tags::auto_map_all(&store, &maps);
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        // First Ctrl+C asks for a graceful shutdown; the second one, or any
        // signal after that, terminates immediately.
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            if stop.swap(true, Ordering::SeqCst) {
                std::process::exit(1);
            }
            log::info!("shutdown requested");
        })
        .expect("couldn't install Ctrl+C handler");
    }

    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    // IPC endpoint.
    match IpcServer::bind(&props.socket_path) {
        Ok(server) => {
            let store = store.clone();
            let stop = stop.clone();
            workers.push(spawn_worker("ipc-server", move || {
                server.run(store, stop)
            }));
        }
        Err(e) => log::error!(
            "could not bind IPC socket {}: {e}",
            props.socket_path.display()
        ),
    }

    // Modbus TCP.
    if !args.no_modbus {
        match TcpListener::bind((props.host.as_str(), props.modbus_port)) {
            Ok(listener) => {
                log::info!(
                    "Modbus TCP server listening on {}:{}",
                    props.host,
                    props.modbus_port
                );
                let store = store.clone();
                let mapping = maps.modbus.clone();
                let stop = stop.clone();
                let tick = args.publish_interval;
                workers.push(spawn_worker("modbus-server", move || {
                    servers::modbus::run(listener, store, mapping, stop, tick)
                }));
            }
            Err(e) => log::error!(
                "could not bind Modbus listener on port {}: {e}",
                props.modbus_port
            ),
        }
    }

    // IEC 60870-5-104. No conforming external library is available, so the
    // built-in wire implementation is the only mode; a failure to bind the
    // port and its fallback is the one fatal startup error.
    if !args.no_iec104 {
        log::info!("iec104: falling back to built-in wire framing (no external IEC-104 library)");
        let listener = TcpListener::bind((props.host.as_str(), props.iec104_port))
            .map(|listener| (listener, props.iec104_port))
            .or_else(|e| {
                log::warn!(
                    "IEC104 port {} not available ({e}), trying {}",
                    props.iec104_port,
                    props.iec104_fallback_port
                );
                TcpListener::bind((props.host.as_str(), props.iec104_fallback_port))
                    .map(|listener| (listener, props.iec104_fallback_port))
            });
        match listener {
            Ok((listener, port)) => {
                log::info!("IEC 60870-5-104 server listening on {}:{port}", props.host);
                let store = store.clone();
                let mapping = maps.iec104.clone();
                let stop = stop.clone();
                workers.push(spawn_worker("iec104-server", move || {
                    servers::iec104::run(listener, store, mapping, stop)
                }));
            }
            Err(e) => {
                eprintln!(
                    "could not bind IEC104 listener on ports {} or {}: {e}",
                    props.iec104_port, props.iec104_fallback_port
                );
                std::process::exit(1)
            }
        }
    }

    // OPC-UA.
    if !args.no_opcua {
        let store = store.clone();
        let mapping = maps.opcua.clone();
        let stop = stop.clone();
        let ua_props = servers::opcua::OpcUaProps {
            host: props.host.clone(),
            port: props.opcua_port,
        };
        let tick = args.publish_interval;
        workers.push(spawn_worker("opcua-server", move || {
            servers::opcua::run(store, mapping, ua_props, stop, tick)
        }));
    }

    // SNMP agent.
    if !args.no_snmp {
        match UdpSocket::bind((props.host.as_str(), props.snmp_port)) {
            Ok(socket) => {
                log::info!("SNMP agent listening on {}:{}", props.host, props.snmp_port);
                let store = store.clone();
                let mapping = maps.snmp.clone();
                let stop = stop.clone();
                let tick = args.publish_interval;
                workers.push(spawn_worker("snmp-agent", move || {
                    servers::snmp::run(socket, store, mapping, stop, tick)
                }));
            }
            Err(e) => log::error!(
                "could not bind SNMP socket on port {}: {e}",
                props.snmp_port
            ),
        }
    }

    // MQTT snapshot forwarder.
    if args.mqtt || props.mqtt.is_some() {
        let mqtt_props = props.mqtt.clone().unwrap_or_default();
        let store = store.clone();
        let stop = stop.clone();
        workers.push(spawn_worker("mqtt-forwarder", move || {
            forwarder::run(store, mqtt_props, stop)
        }));
    }

    log::info!("gateway up; {} workers running", workers.len());
    for worker in workers {
        let _ = worker.join();
    }
    log::info!("gateway stopped");
}

fn spawn_worker(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("couldn't spawn worker thread")
}

fn do_write_action(args: cli::WriteArgs) {
    let socket_path = args
        .socket
        .unwrap_or_else(|| GatewayProps::from_env().socket_path);
    let value = serde_json::from_str(&args.value)
        .unwrap_or_else(|_| serde_json::Value::String(args.value.clone()));

    let client = IpcClient::new(&socket_path);
    match client.write(&args.key, value) {
        Ok(response) => println!("{response}"),
        Err(err) => {
            eprintln!("write failed: {err}");
            std::process::exit(1)
        }
    }
}
