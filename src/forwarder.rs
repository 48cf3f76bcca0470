//! MQTT snapshot forwarder.
//!
//! A sampler puts one JSON snapshot of the whole store per interval into a
//! bounded queue; a publisher drains the queue to the broker. When the
//! broker is away the queue absorbs snapshots and drops the oldest, so the
//! most recent data always survives a reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use rumqttc::{Client, MqttOptions, QoS};

use crate::servers::wait_with_stop;
use crate::store::DataStore;

#[derive(Debug, Clone)]
pub struct MqttProps {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub qos: u8,
    pub retain: bool,
    pub publish_interval: Duration,
    pub max_queue: usize,
}

impl Default for MqttProps {
    fn default() -> MqttProps {
        MqttProps {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "dataservice-gateway".to_string(),
            username: None,
            password: None,
            topic_prefix: "dataservice".to_string(),
            qos: 1,
            retain: false,
            publish_interval: Duration::from_secs(1),
            max_queue: 1000,
        }
    }
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Push into the bounded queue, evicting the oldest frame when full.
fn enqueue_drop_oldest(
    sender: &Sender<(String, String)>,
    receiver: &Receiver<(String, String)>,
    frame: (String, String),
) {
    let mut frame = frame;
    loop {
        match sender.try_send(frame) {
            Ok(()) => return,
            Err(TrySendError::Full(rejected)) => {
                let _ = receiver.try_recv();
                frame = rejected;
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

/// Forwarder entry point; runs until the stop flag is raised.
pub fn run(store: Arc<DataStore>, props: MqttProps, stop: Arc<AtomicBool>) {
    let (sender, receiver) = bounded::<(String, String)>(props.max_queue.max(1));

    let mut options = MqttOptions::new(props.client_id.clone(), props.host.clone(), props.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (&props.username, &props.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    let (client, mut connection) = Client::new(options, 16);

    // The connection iterator drives reconnects; it runs on its own thread
    // and stops once the client disconnects below.
    let event_stop = stop.clone();
    let event_thread = thread::Builder::new()
        .name("mqtt-events".to_string())
        .spawn(move || {
            for event in connection.iter() {
                if event_stop.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = event {
                    log::debug!("mqtt connection error: {e:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        });
    let event_thread = match event_thread {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("mqtt: could not spawn event thread: {e}");
            return;
        }
    };

    let publisher = {
        let sender = sender.clone();
        let receiver = receiver.clone();
        let client = client.clone();
        let stop = stop.clone();
        let qos = qos_level(props.qos);
        let retain = props.retain;
        thread::Builder::new()
            .name("mqtt-publisher".to_string())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let (topic, payload) =
                        match receiver.recv_timeout(Duration::from_millis(500)) {
                            Ok(frame) => frame,
                            Err(_) => continue,
                        };
                    if let Err(e) = client.publish(topic.clone(), qos, retain, payload.clone()) {
                        log::debug!("mqtt publish failed, requeueing: {e:?}");
                        enqueue_drop_oldest(&sender, &receiver, (topic, payload));
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            })
    };
    let publisher = match publisher {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("mqtt: could not spawn publisher: {e}");
            return;
        }
    };

    log::info!(
        "MQTT forwarder publishing to {}:{} under '{}/snapshot'",
        props.host,
        props.port,
        props.topic_prefix
    );

    let topic = format!("{}/snapshot", props.topic_prefix);
    loop {
        let snapshot = store.snapshot();
        let payload: serde_json::Map<String, serde_json::Value> = snapshot
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        match serde_json::to_string(&payload) {
            Ok(payload) => {
                enqueue_drop_oldest(&sender, &receiver, (topic.clone(), payload))
            }
            Err(e) => log::warn!("mqtt: could not serialize snapshot: {e}"),
        }

        if wait_with_stop(&stop, props.publish_interval) {
            break;
        }
    }

    let _ = client.disconnect();
    let _ = publisher.join();
    let _ = event_thread.join();
    log::info!("MQTT forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_when_full() {
        let (sender, receiver) = bounded::<(String, String)>(2);
        for i in 0..5 {
            enqueue_drop_oldest(
                &sender,
                &receiver,
                ("t".to_string(), format!("payload-{i}")),
            );
        }
        let first = receiver.try_recv().unwrap();
        let second = receiver.try_recv().unwrap();
        assert_eq!(first.1, "payload-3");
        assert_eq!(second.1, "payload-4");
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn qos_levels_map_onto_rumqttc() {
        assert_eq!(qos_level(0), QoS::AtMostOnce);
        assert_eq!(qos_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_level(9), QoS::AtLeastOnce);
    }
}
