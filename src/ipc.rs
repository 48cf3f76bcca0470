//! Local write endpoint: newline-delimited JSON over a Unix stream socket.
//!
//! One request line per connection, one response line back, then the server
//! closes. This is the push-write contract consumed by the external polling
//! adapter; [`IpcClient`] is the caller side of it.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::IpcError;
use crate::store::{DataStore, TagId};

const ACCEPT_POLL: Duration = Duration::from_millis(200);
const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the socket, replacing any stale file, and restrict it to the
    /// owning user (0o600).
    pub fn bind(socket_path: &Path) -> io::Result<IpcServer> {
        if socket_path.exists() {
            fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;
        Ok(IpcServer {
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept loop. Polls the stop flag between accepts so shutdown is
    /// bounded; one short-lived handler thread per connection.
    pub fn run(self, store: Arc<DataStore>, stop: Arc<AtomicBool>) {
        log::info!("IPC endpoint listening on {}", self.socket_path.display());
        while !stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let store = store.clone();
                    let result = thread::Builder::new()
                        .name("ipc-handler".to_string())
                        .spawn(move || handle_client(stream, &store));
                    if let Err(e) = result {
                        log::error!("could not spawn IPC handler: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::error!("IPC accept error: {e}");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
        log::info!("IPC endpoint stopped");
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn handle_client(stream: UnixStream, store: &DataStore) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(HANDLER_TIMEOUT));

    let mut reader = BufReader::new(&stream);
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => return,
        Ok(_) => {}
        Err(e) => {
            log::debug!("IPC read error: {e}");
            return;
        }
    }

    let response = dispatch(store, &line);
    if let Err(e) = send_response(&stream, &response) {
        log::debug!("IPC send error: {e}");
    }
}

fn send_response(mut stream: &UnixStream, response: &Value) -> io::Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    stream.write_all(&payload)?;
    stream.flush()
}

/// Parse and execute one request line. Split out of the socket plumbing so
/// the protocol is testable without a socket.
fn dispatch(store: &DataStore, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line.trim()) {
        Ok(v) => v,
        Err(e) => return json!({"ok": false, "error": format!("invalid json: {e}")}),
    };

    match request.get("action").and_then(Value::as_str) {
        Some("write") => {
            let Some(key) = request
                .get("key")
                .and_then(Value::as_str)
                .filter(|k| !k.is_empty())
            else {
                return json!({"ok": false, "error": "key required"});
            };
            // The response only reflects dispatch; writes to unknown keys
            // are dropped by the store.
            store.write(key, request.get("value").cloned().unwrap_or(Value::Null));
            json!({"ok": true})
        }
        Some("write_by_id") => {
            let Some(id) = request
                .get("id")
                .and_then(Value::as_str)
                .filter(|i| !i.is_empty())
            else {
                return json!({"ok": false, "error": "id required"});
            };
            match store.key_for_id(&TagId::from(id)) {
                Some(key) => {
                    store.write(
                        key.as_str(),
                        request.get("value").cloned().unwrap_or(Value::Null),
                    );
                    json!({"ok": true, "key": key})
                }
                None => json!({"ok": false, "error": "id not found"}),
            }
        }
        Some("bulk_write_by_id") => {
            let Some(updates) = request.get("updates").and_then(Value::as_array) else {
                return json!({"ok": false, "error": "updates must be a list"});
            };
            let results: Vec<Value> = updates
                .iter()
                .map(|update| apply_bulk_entry(store, update))
                .collect();
            json!({"ok": true, "results": results})
        }
        _ => json!({"ok": false, "error": "unknown action"}),
    }
}

fn apply_bulk_entry(store: &DataStore, update: &Value) -> Value {
    let id = update.get("id").and_then(Value::as_str).unwrap_or("");
    if id.is_empty() {
        return json!({"id": update.get("id"), "ok": false, "error": "id required"});
    }
    match store.key_for_id(&TagId::from(id)) {
        Some(key) => {
            store.write(
                key.as_str(),
                update.get("value").cloned().unwrap_or(Value::Null),
            );
            json!({"id": id, "ok": true, "key": key})
        }
        None => json!({"id": id, "ok": false, "error": "id not found"}),
    }
}

/// One-connection-per-call client for the push-write contract.
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: &Path) -> IpcClient {
        IpcClient {
            socket_path: socket_path.to_path_buf(),
        }
    }

    fn rpc(&self, request: Value) -> Result<Value, IpcError> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| IpcError::Connect {
            path: self.socket_path.clone(),
            source: e,
        })?;
        stream.set_read_timeout(Some(HANDLER_TIMEOUT))?;

        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');
        (&stream).write_all(&payload)?;

        let mut reader = BufReader::new(&stream);
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(IpcError::EmptyResponse);
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn write(&self, key: &str, value: Value) -> Result<Value, IpcError> {
        self.rpc(json!({"action": "write", "key": key, "value": value}))
    }

    pub fn write_by_id(&self, id: &TagId, value: Value) -> Result<Value, IpcError> {
        self.rpc(json!({"action": "write_by_id", "id": id, "value": value}))
    }

    pub fn bulk_write_by_id(&self, updates: &[(TagId, Value)]) -> Result<Value, IpcError> {
        let updates: Vec<Value> = updates
            .iter()
            .map(|(id, value)| json!({"id": id, "value": value}))
            .collect();
        self.rpc(json!({"action": "bulk_write_by_id", "updates": updates}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TagSpec;
    use crate::value::{DataType, TagValue};

    fn store_with_temp() -> Arc<DataStore> {
        let store = Arc::new(DataStore::new());
        store
            .register(&TagSpec::new("temp", DataType::Float))
            .unwrap();
        store
    }

    #[test]
    fn write_action_accepts_and_stores() {
        let store = store_with_temp();
        let response = dispatch(&store, r#"{"action":"write","key":"temp","value":23.5}"#);
        assert_eq!(response, json!({"ok": true}));
        assert_eq!(store.read("temp"), TagValue::Float(23.5));
    }

    #[test]
    fn write_to_unknown_key_still_acks() {
        let store = store_with_temp();
        let response = dispatch(&store, r#"{"action":"write","key":"ghost","value":1}"#);
        assert_eq!(response, json!({"ok": true}));
        assert_eq!(store.read("ghost"), TagValue::zero());
        assert_eq!(store.statistics().total_points, 1);
    }

    #[test]
    fn missing_key_is_reported() {
        let store = store_with_temp();
        let response = dispatch(&store, r#"{"action":"write","value":1}"#);
        assert_eq!(response, json!({"ok": false, "error": "key required"}));
    }

    #[test]
    fn malformed_json_is_reported() {
        let store = store_with_temp();
        let response = dispatch(&store, "{nope");
        assert_eq!(response["ok"], json!(false));
        assert!(response["error"].as_str().unwrap().starts_with("invalid json"));
    }

    #[test]
    fn unknown_action_is_reported() {
        let store = store_with_temp();
        let response = dispatch(&store, r#"{"action":"reboot"}"#);
        assert_eq!(response, json!({"ok": false, "error": "unknown action"}));
    }

    #[test]
    fn write_by_id_resolves_the_key() {
        let store = store_with_temp();
        let id = store.ensure_id("temp");
        let response = dispatch(
            &store,
            &format!(r#"{{"action":"write_by_id","id":"{id}","value":9}}"#),
        );
        assert_eq!(response, json!({"ok": true, "key": "temp"}));
        assert_eq!(store.read("temp"), TagValue::Float(9.0));

        let response = dispatch(
            &store,
            r#"{"action":"write_by_id","id":"ffffffffffffffffffffffffffffffff","value":9}"#,
        );
        assert_eq!(response, json!({"ok": false, "error": "id not found"}));
    }

    #[test]
    fn bulk_write_reports_per_entry_results() {
        let store = store_with_temp();
        let id = store.ensure_id("temp");
        let line = format!(
            r#"{{"action":"bulk_write_by_id","updates":[
                {{"id":"{id}","value":42}},
                {{"id":"eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee","value":1}}
            ]}}"#
        );
        let response = dispatch(&store, &line);
        assert_eq!(response["ok"], json!(true));
        let results = response["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["ok"], json!(true));
        assert_eq!(results[0]["key"], json!("temp"));
        assert_eq!(results[1]["ok"], json!(false));
        assert_eq!(results[1]["error"], json!("id not found"));
        assert_eq!(store.read("temp"), TagValue::Float(42.0));
    }

    #[test]
    fn bulk_write_requires_a_list() {
        let store = store_with_temp();
        let response = dispatch(&store, r#"{"action":"bulk_write_by_id","updates":3}"#);
        assert_eq!(
            response,
            json!({"ok": false, "error": "updates must be a list"})
        );
    }

    #[test]
    fn end_to_end_over_a_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.sock");
        let store = store_with_temp();
        let stop = Arc::new(AtomicBool::new(false));

        let server = IpcServer::bind(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let server_store = store.clone();
        let server_stop = stop.clone();
        let handle = thread::spawn(move || server.run(server_store, server_stop));

        let client = IpcClient::new(&path);
        let response = client.write("temp", json!(23.5)).unwrap();
        assert_eq!(response, json!({"ok": true}));
        assert_eq!(store.read("temp"), TagValue::Float(23.5));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(!path.exists());
    }
}
