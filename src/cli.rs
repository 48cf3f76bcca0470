use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "dataservice-gateway",
    version,
    about = r#"
dataservice-gateway exposes one in-memory tag store over Modbus TCP,
IEC 60870-5-104, OPC-UA and SNMP, and accepts local writes over a Unix
socket.

EXAMPLES:
    # Run with a tag manifest, auto-mapping every tag onto all protocols:
    dataservice-gateway run --tags tags.json --auto-map

    # Poke a value into a running gateway:
    dataservice-gateway write temperature 23.5
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Run the gateway.
    Run(RunArgs),

    /// Send one write to a running gateway over its IPC socket.
    Write(WriteArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// JSON tag manifest registered at startup.
    #[arg(long)]
    pub tags: Option<PathBuf>,

    /// Bulk-map all registered tags onto every protocol at startup.
    #[arg(long)]
    pub auto_map: bool,

    /// Publish cadence of the protocol servers.
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub publish_interval: Duration,

    /// Force the MQTT forwarder on even without MQTT_HOST set.
    #[arg(long)]
    pub mqtt: bool,

    /// Disable individual servers.
    #[arg(long)]
    pub no_modbus: bool,
    #[arg(long)]
    pub no_iec104: bool,
    #[arg(long)]
    pub no_opcua: bool,
    #[arg(long)]
    pub no_snmp: bool,
}

#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Tag key to write.
    pub key: String,

    /// Value; parsed as JSON when possible, sent as a string otherwise.
    pub value: String,

    /// IPC socket path of the running gateway.
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

fn parse_duration(arg: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(arg)
}
