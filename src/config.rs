//! Environment-driven configuration. CLI flags override these values.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::forwarder::MqttProps;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/dataservice.sock";

#[derive(Debug, Clone)]
pub struct GatewayProps {
    pub host: String,
    pub modbus_port: u16,
    pub iec104_port: u16,
    pub iec104_fallback_port: u16,
    pub opcua_port: u16,
    pub snmp_port: u16,
    pub socket_path: PathBuf,
    pub mqtt: Option<MqttProps>,
}

impl GatewayProps {
    pub fn from_env() -> GatewayProps {
        GatewayProps {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            modbus_port: env_or("MODBUS_PORT", 5020),
            iec104_port: env_or("IEC104_PORT", 2404),
            iec104_fallback_port: 2405,
            opcua_port: env_or("OPCUA_PORT", 4840),
            snmp_port: env_or("SNMP_PORT", 1161),
            socket_path: env::var("IPC_SOCKET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH)),
            mqtt: mqtt_from_env(),
        }
    }
}

/// MQTT settings are read only when `MQTT_HOST` is set; without a broker
/// address there is nothing to forward to.
fn mqtt_from_env() -> Option<MqttProps> {
    let host = env::var("MQTT_HOST").ok()?;
    let defaults = MqttProps::default();
    Some(MqttProps {
        host,
        port: env_or("MQTT_PORT", defaults.port),
        client_id: env::var("MQTT_CLIENT_ID").unwrap_or(defaults.client_id),
        username: env::var("MQTT_USERNAME").ok(),
        password: env::var("MQTT_PASSWORD").ok(),
        topic_prefix: env::var("MQTT_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
        qos: env_or("MQTT_QOS", defaults.qos),
        retain: env::var("MQTT_RETAIN")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.retain),
        publish_interval: Duration::from_secs_f64(
            env_or("MQTT_PUBLISH_INTERVAL_SEC", 1.0f64).max(0.05),
        ),
        max_queue: env_or("MQTT_MAX_QUEUE", defaults.max_queue),
    })
}

fn env_or<T: FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("ignoring unparseable {name}={raw:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-variable tests poke process-global state, so everything
    // lives in one test to avoid races with parallel test threads.
    #[test]
    fn env_parsing_with_defaults_and_overrides() {
        env::remove_var("SERVER_HOST");
        env::remove_var("MODBUS_PORT");
        env::remove_var("MQTT_HOST");
        let props = GatewayProps::from_env();
        assert_eq!(props.host, "0.0.0.0");
        assert_eq!(props.modbus_port, 5020);
        assert_eq!(props.iec104_port, 2404);
        assert_eq!(props.iec104_fallback_port, 2405);
        assert_eq!(props.opcua_port, 4840);
        assert_eq!(props.snmp_port, 1161);
        assert_eq!(props.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert!(props.mqtt.is_none());

        env::set_var("MODBUS_PORT", "1502");
        env::set_var("SERVER_HOST", "127.0.0.1");
        env::set_var("MQTT_HOST", "broker.local");
        env::set_var("MQTT_QOS", "2");
        let props = GatewayProps::from_env();
        assert_eq!(props.modbus_port, 1502);
        assert_eq!(props.host, "127.0.0.1");
        let mqtt = props.mqtt.unwrap();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.qos, 2);

        env::set_var("MODBUS_PORT", "not-a-port");
        let props = GatewayProps::from_env();
        assert_eq!(props.modbus_port, 5020);

        env::remove_var("SERVER_HOST");
        env::remove_var("MODBUS_PORT");
        env::remove_var("MQTT_HOST");
        env::remove_var("MQTT_QOS");
    }
}
