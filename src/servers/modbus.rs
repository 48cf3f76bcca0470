//! Modbus TCP server: serves holding/input register reads over MBAP framing
//! and publishes the mapped store state into a shared register bank once per
//! tick.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use parking_lot::Mutex;
use thiserror::Error;

use super::wait_with_stop;
use crate::mapping::modbus::{Endianness, ModbusAttrs, ModbusType};
use crate::mapping::ModbusMapping;
use crate::store::DataStore;
use crate::value::TagValue;

const MBAP_HEADER_LEN: usize = 7;
const MAX_READ_COUNT: u16 = 125;

const EX_ILLEGAL_FUNCTION: u8 = 0x01;
const EX_ILLEGAL_ADDRESS: u8 = 0x02;
const EX_ILLEGAL_VALUE: u8 = 0x03;

/// The full 16-bit register space served to clients. Mapped values are
/// written in by the publisher; everything else reads as zero.
pub struct RegisterBank {
    registers: Vec<u16>,
}

impl Default for RegisterBank {
    fn default() -> RegisterBank {
        RegisterBank {
            registers: vec![0; 65536],
        }
    }
}

impl RegisterBank {
    pub fn read(&self, start: u16, count: u16) -> Option<&[u16]> {
        let start = start as usize;
        let end = start.checked_add(count as usize)?;
        self.registers.get(start..end)
    }

    pub fn write_span(&mut self, start: u16, values: &[u16]) {
        let start = start as usize;
        if let Some(span) = self.registers.get_mut(start..start + values.len()) {
            span.copy_from_slice(values);
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EncodeError {
    #[error("value is not numeric")]
    NotNumeric,
    #[error("string value is not ASCII")]
    NotAscii,
}

/// Encode one tag value into its register span: scaling first, then the
/// type-specific packing from the mapping attributes.
pub fn encode_registers(value: &TagValue, attrs: &ModbusAttrs) -> Result<Vec<u16>, EncodeError> {
    let numeric = || {
        value
            .as_f64()
            .map(|v| v * attrs.scaling_factor)
            .ok_or(EncodeError::NotNumeric)
    };

    let pair = |high: u16, low: u16| match attrs.endianness {
        Endianness::Big => vec![high, low],
        Endianness::Little => vec![low, high],
    };

    match attrs.data_type {
        ModbusType::Float32 => {
            let bits = (numeric()? as f32).to_bits();
            Ok(pair((bits >> 16) as u16, bits as u16))
        }
        ModbusType::Int32 => {
            let v = numeric()? as i64 as i32 as u32;
            Ok(pair((v >> 16) as u16, v as u16))
        }
        ModbusType::Uint32 => {
            let v = numeric()?.abs() as u32;
            Ok(pair((v >> 16) as u16, v as u16))
        }
        ModbusType::Int16 => {
            let v = numeric()? as i64;
            Ok(vec![(v & 0xFFFF) as u16])
        }
        ModbusType::Uint16 => {
            let v = numeric()?.abs() as u64;
            Ok(vec![(v & 0xFFFF) as u16])
        }
        ModbusType::Bool => Ok(vec![u16::from(value.is_truthy())]),
        ModbusType::String8 | ModbusType::String16 => {
            let text = value.to_string();
            if !text.is_ascii() {
                return Err(EncodeError::NotAscii);
            }
            let byte_len = attrs.data_type.register_count() as usize * 2;
            let mut bytes = text.into_bytes();
            bytes.resize(byte_len, 0);
            Ok(bytes
                .chunks_exact(2)
                .map(|pair| u16::from(pair[0]) << 8 | u16::from(pair[1]))
                .collect())
        }
    }
}

/// One publish tick: read every mapped tag, encode, and batch-write the
/// register bank under a single lock. Encoding failures zero the span.
pub fn publish_tick(store: &DataStore, mapping: &ModbusMapping, bank: &Mutex<RegisterBank>) {
    let snapshot = store.snapshot();
    let mut updates: Vec<(u16, Vec<u16>)> = Vec::new();

    for mapping_entry in mapping.all().values() {
        let Some(value) = snapshot.get(&mapping_entry.key) else {
            continue;
        };
        let attrs = &mapping_entry.attrs;
        let registers = match encode_registers(value, attrs) {
            Ok(registers) => registers,
            Err(e) => {
                log::warn!(
                    "modbus: could not encode '{}' at register {}: {e}",
                    mapping_entry.key,
                    attrs.register_address
                );
                vec![0; attrs.data_type.register_count() as usize]
            }
        };
        updates.push((attrs.register_address, registers));
    }

    if !updates.is_empty() {
        let mut bank = bank.lock();
        for (address, registers) in &updates {
            bank.write_span(*address, registers);
        }
    }
}

/// Build the response ADU for one request. `pdu` excludes the MBAP header.
fn respond(transaction_id: u16, unit: u8, pdu: &[u8], bank: &RegisterBank) -> Vec<u8> {
    let function = pdu.first().copied().unwrap_or(0);

    let body: Vec<u8> = match function {
        // Read Holding Registers / Read Input Registers. Both read from the
        // same bank; writes from clients are out of scope.
        3 | 4 if pdu.len() >= 5 => {
            let start = BigEndian::read_u16(&pdu[1..3]);
            let count = BigEndian::read_u16(&pdu[3..5]);
            if count == 0 || count > MAX_READ_COUNT {
                exception(function, EX_ILLEGAL_VALUE)
            } else {
                match bank.read(start, count) {
                    Some(registers) => {
                        let mut body = Vec::with_capacity(2 + registers.len() * 2);
                        body.push(function);
                        body.push((registers.len() * 2) as u8);
                        for register in registers {
                            body.write_u16::<BigEndian>(*register).unwrap();
                        }
                        body
                    }
                    None => exception(function, EX_ILLEGAL_ADDRESS),
                }
            }
        }
        3 | 4 => exception(function, EX_ILLEGAL_VALUE),
        _ => exception(function, EX_ILLEGAL_FUNCTION),
    };

    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + body.len());
    adu.write_u16::<BigEndian>(transaction_id).unwrap();
    adu.write_u16::<BigEndian>(0).unwrap(); // protocol id
    adu.write_u16::<BigEndian>((body.len() + 1) as u16).unwrap();
    adu.push(unit);
    adu.extend_from_slice(&body);
    adu
}

fn exception(function: u8, code: u8) -> Vec<u8> {
    vec![function | 0x80, code]
}

enum ReadOutcome {
    Done,
    Closed,
    Idle,
}

/// Fill `buf`, tolerating read timeouts. `Idle` is only reported when no
/// byte has arrived yet, so partial frames are never dropped.
fn read_frame_part(
    stream: &mut TcpStream,
    buf: &mut [u8],
    stop: &AtomicBool,
) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                if stop.load(Ordering::SeqCst) {
                    return Ok(ReadOutcome::Closed);
                }
                if filled == 0 {
                    return Ok(ReadOutcome::Idle);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Done)
}

fn handle_client(mut stream: TcpStream, bank: Arc<Mutex<RegisterBank>>, stop: Arc<AtomicBool>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
    let _ = stream.set_nodelay(true);
    log::debug!("modbus client connected from {peer}");

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let mut header = [0u8; MBAP_HEADER_LEN];
        match read_frame_part(&mut stream, &mut header, &stop) {
            Ok(ReadOutcome::Done) => {}
            Ok(ReadOutcome::Idle) => continue,
            Ok(ReadOutcome::Closed) => {
                log::debug!("modbus client {peer} disconnected");
                return;
            }
            Err(e) => {
                log::debug!("modbus read error from {peer}: {e}");
                return;
            }
        }

        let transaction_id = BigEndian::read_u16(&header[0..2]);
        let length = BigEndian::read_u16(&header[4..6]) as usize;
        let unit = header[6];
        if length < 2 || length > 254 {
            log::debug!("modbus frame from {peer} has bad length {length}");
            return;
        }

        let mut pdu = vec![0u8; length - 1];
        match read_frame_part(&mut stream, &mut pdu, &stop) {
            Ok(ReadOutcome::Done) => {}
            _ => return,
        }

        let response = {
            let bank = bank.lock();
            respond(transaction_id, unit, &pdu, &bank)
        };
        if let Err(e) = stream.write_all(&response) {
            log::debug!("modbus send error to {peer}: {e}");
            return;
        }
    }
}

/// Server entry point; runs until the stop flag is raised. Owns the accept
/// loop and spawns the publisher and one handler per client.
pub fn run(
    listener: TcpListener,
    store: Arc<DataStore>,
    mapping: Arc<ModbusMapping>,
    stop: Arc<AtomicBool>,
    tick: Duration,
) {
    let bank = Arc::new(Mutex::new(RegisterBank::default()));

    let publisher = {
        let store = store.clone();
        let mapping = mapping.clone();
        let bank = bank.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("modbus-publisher".to_string())
            .spawn(move || loop {
                publish_tick(&store, &mapping, &bank);
                if wait_with_stop(&stop, tick) {
                    return;
                }
            })
    };
    let publisher = match publisher {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("modbus: could not spawn publisher: {e}");
            return;
        }
    };

    if let Err(e) = listener.set_nonblocking(true) {
        log::error!("modbus: could not configure listener: {e}");
    }

    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let bank = bank.clone();
                let stop = stop.clone();
                let result = thread::Builder::new()
                    .name("modbus-client".to_string())
                    .spawn(move || handle_client(stream, bank, stop));
                if let Err(e) = result {
                    log::error!("modbus: could not spawn client handler: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                log::debug!("modbus accept error: {e}");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }

    let _ = publisher.join();
    log::info!("Modbus TCP server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PaddingStrategy;
    use crate::store::{TagId, TagSpec};
    use crate::value::DataType;
    use serde_json::json;

    fn attrs(data_type: ModbusType) -> ModbusAttrs {
        ModbusAttrs::new(40001, data_type)
    }

    #[test]
    fn float32_big_endian_register_pair() {
        let registers = encode_registers(&TagValue::Float(1.0), &attrs(ModbusType::Float32)).unwrap();
        assert_eq!(registers, vec![0x3F80, 0x0000]);

        let registers = encode_registers(&TagValue::Float(23.5), &attrs(ModbusType::Float32)).unwrap();
        assert_eq!(registers, vec![0x41BC, 0x0000]);
    }

    #[test]
    fn float32_little_endianness_swaps_words() {
        let mut a = attrs(ModbusType::Float32);
        a.endianness = Endianness::Little;
        let registers = encode_registers(&TagValue::Float(1.0), &a).unwrap();
        assert_eq!(registers, vec![0x0000, 0x3F80]);
    }

    #[test]
    fn scaling_applies_before_encoding() {
        let mut a = attrs(ModbusType::Int16);
        a.scaling_factor = 10.0;
        let registers = encode_registers(&TagValue::Float(23.5), &a).unwrap();
        assert_eq!(registers, vec![235]);
    }

    #[test]
    fn int_encodings() {
        let registers =
            encode_registers(&TagValue::Int(-2), &attrs(ModbusType::Int16)).unwrap();
        assert_eq!(registers, vec![0xFFFE]);

        let registers =
            encode_registers(&TagValue::Int(0x0102_0304), &attrs(ModbusType::Int32)).unwrap();
        assert_eq!(registers, vec![0x0102, 0x0304]);

        let mut a = attrs(ModbusType::Uint32);
        a.endianness = Endianness::Little;
        let registers = encode_registers(&TagValue::Int(0x0102_0304), &a).unwrap();
        assert_eq!(registers, vec![0x0304, 0x0102]);
    }

    #[test]
    fn strings_pack_two_ascii_bytes_per_register() {
        let registers =
            encode_registers(&TagValue::Str("AB".into()), &attrs(ModbusType::String8)).unwrap();
        assert_eq!(registers, vec![0x4142, 0, 0, 0]);
        assert!(encode_registers(&TagValue::Str("°C".into()), &attrs(ModbusType::String8)).is_err());
    }

    #[test]
    fn bools_become_zero_or_one() {
        assert_eq!(
            encode_registers(&TagValue::Bool(true), &attrs(ModbusType::Bool)).unwrap(),
            vec![1]
        );
        assert_eq!(
            encode_registers(&TagValue::Bool(false), &attrs(ModbusType::Bool)).unwrap(),
            vec![0]
        );
    }

    #[test]
    fn non_numeric_values_error_and_publisher_zeroes_them() {
        let err = encode_registers(&TagValue::Str("abc".into()), &attrs(ModbusType::Float32));
        assert!(err.is_err());

        let store = DataStore::new();
        store
            .register(&TagSpec::new("txt", DataType::String).address(43001))
            .unwrap();
        store.write("txt", json!("abc"));
        let mapping = ModbusMapping::new();
        mapping
            .set(
                TagId::from("x"),
                "txt",
                ModbusAttrs::new(40001, ModbusType::Float32),
            )
            .unwrap();

        let bank = Mutex::new(RegisterBank::default());
        publish_tick(&store, &mapping, &bank);
        assert_eq!(bank.lock().read(40001, 2).unwrap(), &[0, 0]);
    }

    #[test]
    fn publish_then_read_over_mbap() {
        let store = DataStore::new();
        store
            .register(&TagSpec::new("temp", DataType::Float).address(40001))
            .unwrap();
        store.write("temp", json!(23.5));

        let mapping = ModbusMapping::new();
        let ids = vec![store.ensure_id("temp")];
        crate::mapping::modbus::auto_generate(
            &store,
            &mapping,
            &ids,
            40001,
            PaddingStrategy::DataType,
        );

        let bank = Mutex::new(RegisterBank::default());
        publish_tick(&store, &mapping, &bank);

        // FC3 read of two registers at 40001.
        let pdu = [3u8, 0x9C, 0x41, 0x00, 0x02];
        let response = respond(7, 1, &pdu, &bank.lock());
        assert_eq!(&response[..7], &[0x00, 0x07, 0x00, 0x00, 0x00, 0x07, 0x01]);
        assert_eq!(&response[7..], &[0x03, 0x04, 0x41, 0xBC, 0x00, 0x00]);
    }

    #[test]
    fn bad_requests_get_exceptions() {
        let bank = RegisterBank::default();
        // Unsupported function code.
        let response = respond(1, 1, &[0x10, 0, 0], &bank);
        assert_eq!(&response[7..], &[0x90, EX_ILLEGAL_FUNCTION]);
        // Read past the end of the register space.
        let response = respond(1, 1, &[3, 0xFF, 0xFF, 0x00, 0x02], &bank);
        assert_eq!(&response[7..], &[0x83, EX_ILLEGAL_ADDRESS]);
        // Zero-count read.
        let response = respond(1, 1, &[4, 0x00, 0x00, 0x00, 0x00], &bank);
        assert_eq!(&response[7..], &[0x84, EX_ILLEGAL_VALUE]);
    }
}
