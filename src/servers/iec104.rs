//! Built-in IEC 60870-5-104 wire implementation.
//!
//! This is the minimal monitoring subset: STARTDT-act on connect, then a
//! periodic broadcast of one ASDU frame per mapping. Single-point mappings
//! go out as type 1 with a one-byte value; every measured type goes out as
//! the minimal measured frame (type 9) carrying an IEEE-754 short float.
//! Select/execute, general interrogation and k/w flow control are not
//! implemented and not advertised.

use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::mapping::iec104::{AsduType, Iec104Attrs};
use crate::mapping::Iec104Mapping;
use crate::store::DataStore;
use crate::value::TagValue;

/// "Start data transfer, activate" control frame, sent once per connection.
pub const STARTDT_ACT: [u8; 6] = [0x68, 0x04, 0x07, 0x00, 0x00, 0x00];

const FRAME_START: u8 = 0x68;
const TYPE_SINGLE_POINT: u8 = 0x01;
const TYPE_MEASURED_FLOAT: u8 = 0x09;
const BROADCAST_PERIOD: Duration = Duration::from_secs(2);

/// Build one ASDU frame for a mapping and its current value.
pub fn build_frame(attrs: &Iec104Attrs, value: &TagValue) -> Vec<u8> {
    let (type_id, payload): (u8, Vec<u8>) = match attrs.type_id {
        AsduType::MSpNa1 => (TYPE_SINGLE_POINT, vec![u8::from(value.is_truthy())]),
        _ => {
            let mut payload = Vec::with_capacity(4);
            payload
                .write_f32::<LittleEndian>(value.as_f64().unwrap_or(0.0) as f32)
                .unwrap();
            (TYPE_MEASURED_FLOAT, payload)
        }
    };

    let mut asdu = Vec::with_capacity(12 + payload.len());
    asdu.push(type_id);
    asdu.push(0x01); // variable structure qualifier: one object
    asdu.push(attrs.cause.wire_code());
    asdu.push(0x00); // originator address
    asdu.write_u16::<LittleEndian>(attrs.common_address).unwrap();
    asdu.write_u24::<LittleEndian>(attrs.ioa & 0x00FF_FFFF).unwrap();
    asdu.extend_from_slice(&payload);
    asdu.extend_from_slice(&[0, 0, 0]); // timestamp placeholder

    let mut frame = Vec::with_capacity(2 + asdu.len());
    frame.push(FRAME_START);
    frame.push(asdu.len() as u8);
    frame.extend_from_slice(&asdu);
    frame
}

fn broadcast(
    clients: &mut Vec<TcpStream>,
    store: &DataStore,
    mapping: &Iec104Mapping,
) {
    let entries = mapping.all();
    if entries.is_empty() || clients.is_empty() {
        return;
    }

    let mut frames = Vec::with_capacity(entries.len());
    for entry in entries.values() {
        let value = store.read(entry.key.as_str());
        frames.push(build_frame(&entry.attrs, &value));
    }

    clients.retain_mut(|client| {
        for frame in &frames {
            if let Err(e) = client.write_all(frame) {
                log::debug!("iec104 send error, dropping client: {e}");
                return false;
            }
        }
        true
    });
}

/// Server entry point; runs until the stop flag is raised.
pub fn run(
    listener: TcpListener,
    store: Arc<DataStore>,
    mapping: Arc<Iec104Mapping>,
    stop: Arc<AtomicBool>,
) {
    if let Err(e) = listener.set_nonblocking(true) {
        log::error!("iec104: could not configure listener: {e}");
    }

    let mut clients: Vec<TcpStream> = Vec::new();
    let mut last_broadcast = Instant::now() - BROADCAST_PERIOD;

    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                log::info!("iec104 client connected from {addr}");
                let _ = stream.set_nodelay(true);
                match stream.write_all(&STARTDT_ACT) {
                    Ok(()) => clients.push(stream),
                    Err(e) => log::debug!("iec104 could not greet {addr}: {e}"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::debug!("iec104 accept error: {e}");
            }
        }

        if last_broadcast.elapsed() >= BROADCAST_PERIOD {
            broadcast(&mut clients, &store, &mapping);
            last_broadcast = Instant::now();
        }

        thread::sleep(Duration::from_millis(100));
    }

    // Close everything on the way out.
    drop(clients);
    drop(listener);
    log::info!("IEC 60870-5-104 server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::iec104::Cause;

    #[test]
    fn measured_frame_matches_the_wire_vector() {
        // Mapping at IOA 5000 with value 1.0.
        let attrs = Iec104Attrs::new(5000, AsduType::MMeNf1);
        let frame = build_frame(&attrs, &TagValue::Float(1.0));

        assert_eq!(frame[0], 0x68);
        assert_eq!(frame[1] as usize, frame.len() - 2);
        // type 09, one object, cause 03 (spontaneous), originator 0
        assert_eq!(&frame[2..6], &[0x09, 0x01, 0x03, 0x00]);
        // ASDU address 1, little-endian
        assert_eq!(&frame[6..8], &[0x01, 0x00]);
        // IOA 5000 as 24-bit little-endian
        assert_eq!(&frame[8..11], &[0x88, 0x13, 0x00]);
        // IEEE-754 short float 1.0
        assert_eq!(&frame[11..15], &[0x00, 0x00, 0x80, 0x3F]);
        // timestamp placeholder
        assert_eq!(&frame[15..18], &[0, 0, 0]);
        assert_eq!(frame.len(), 18);
    }

    #[test]
    fn single_point_frame_is_one_byte_of_state() {
        let mut attrs = Iec104Attrs::new(3000, AsduType::MSpNa1);
        attrs.cause = Cause::Spontaneous;
        let frame = build_frame(&attrs, &TagValue::Bool(true));
        assert_eq!(frame[2], 0x01);
        assert_eq!(frame[11], 1);

        let frame = build_frame(&attrs, &TagValue::Bool(false));
        assert_eq!(frame[11], 0);
    }

    #[test]
    fn periodic_cause_is_encoded() {
        let mut attrs = Iec104Attrs::new(1000, AsduType::MMeNc1);
        attrs.cause = Cause::Periodic;
        let frame = build_frame(&attrs, &TagValue::Float(0.0));
        assert_eq!(frame[4], 0x01);
    }

    #[test]
    fn startdt_act_bytes() {
        assert_eq!(STARTDT_ACT, [0x68, 0x04, 0x07, 0x00, 0x00, 0x00]);
    }
}
