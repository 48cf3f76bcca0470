//! SNMPv2c agent: GET and GET-NEXT over UDP for the mapped scalars.
//!
//! The BER codec below covers exactly the message shapes a v2c
//! GET/GETNEXT/SET exchange uses. The agent keeps an ordered OID registry
//! refreshed from the store once per tick; GETNEXT walks that order.

use std::collections::BTreeMap;
use std::fmt;
use std::net::UdpSocket;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::mapping::snmp::{SnmpSyntax, ENTERPRISE_OID};
use crate::mapping::SnmpMapping;
use crate::store::DataStore;
use crate::value::TagValue;

pub const COMMUNITY: &str = "public";

/// The read-only view: OIDs outside this subtree are answered as missing.
const VIEW_ROOT: &[u32] = &[1, 3, 6];

const SNMP_V2C: i64 = 1;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_COUNTER64: u8 = 0x46;

const PDU_GET: u8 = 0xA0;
const PDU_GET_NEXT: u8 = 0xA1;
const PDU_RESPONSE: u8 = 0xA2;
const PDU_SET: u8 = 0xA3;

const ERR_NO_SUCH_NAME: i64 = 2;
const ERR_READ_ONLY: i64 = 4;
const ERR_GEN_ERR: i64 = 5;

/// Dotted object identifier, ordered lexicographically by component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub Vec<u32>);

impl Oid {
    pub fn starts_with(&self, prefix: &[u32]) -> bool {
        self.0.len() >= prefix.len() && self.0[..prefix.len()] == *prefix
    }

    pub fn child(&self, component: u32) -> Oid {
        let mut components = self.0.clone();
        components.push(component);
        Oid(components)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for component in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{component}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Oid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Oid, Self::Err> {
        s.split('.')
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<u32>, _>>()
            .map(Oid)
    }
}

/// The value slot of a varbind.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    Gauge32(u32),
    Counter32(u32),
    Counter64(u64),
    OctetString(Vec<u8>),
    Null,
}

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("truncated message")]
    Truncated,
    #[error("unexpected tag {got:#04x}, wanted {wanted:#04x}")]
    UnexpectedTag { wanted: u8, got: u8 },
    #[error("invalid length encoding")]
    BadLength,
    #[error("invalid OID encoding")]
    BadOid,
    #[error("unsupported SNMP version {0}")]
    BadVersion(i64),
}

/// A decoded v2c message, request or response.
#[derive(Debug, Clone)]
pub struct SnmpMessage {
    pub community: String,
    pub pdu_type: u8,
    pub request_id: i64,
    pub error_status: i64,
    pub error_index: i64,
    pub varbinds: Vec<(Oid, SnmpValue)>,
}

// ---- BER encoding ----

fn push_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    let len = content.len();
    if len < 128 {
        out.push(len as u8);
    } else {
        let bytes = (usize::BITS / 8 - len.leading_zeros() / 8) as usize;
        out.push(0x80 | bytes as u8);
        for i in (0..bytes).rev() {
            out.push((len >> (i * 8)) as u8);
        }
    }
    out.extend_from_slice(content);
}

fn integer_content(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let first = bytes[start];
        let next_msb = bytes[start + 1] & 0x80;
        if (first == 0x00 && next_msb == 0) || (first == 0xFF && next_msb != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

fn unsigned_content(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 7 && bytes[start] == 0 {
        start += 1;
    }
    let mut content = bytes[start..].to_vec();
    if content[0] & 0x80 != 0 {
        content.insert(0, 0);
    }
    content
}

fn oid_content(oid: &Oid) -> Vec<u8> {
    let components = &oid.0;
    let mut content = Vec::new();
    let first = components.first().copied().unwrap_or(1);
    let second = components.get(1).copied().unwrap_or(0);
    content.push((first * 40 + second) as u8);
    for &component in components.iter().skip(2) {
        let mut groups = [0u8; 5];
        let mut n = 0;
        let mut rest = component;
        loop {
            groups[n] = (rest & 0x7F) as u8;
            rest >>= 7;
            n += 1;
            if rest == 0 {
                break;
            }
        }
        for i in (0..n).rev() {
            let continuation = if i == 0 { 0 } else { 0x80 };
            content.push(groups[i] | continuation);
        }
    }
    content
}

fn value_tlv(out: &mut Vec<u8>, value: &SnmpValue) {
    match value {
        SnmpValue::Integer(v) => push_tlv(out, TAG_INTEGER, &integer_content(*v)),
        SnmpValue::Gauge32(v) => push_tlv(out, TAG_GAUGE32, &unsigned_content(u64::from(*v))),
        SnmpValue::Counter32(v) => push_tlv(out, TAG_COUNTER32, &unsigned_content(u64::from(*v))),
        SnmpValue::Counter64(v) => push_tlv(out, TAG_COUNTER64, &unsigned_content(*v)),
        SnmpValue::OctetString(bytes) => push_tlv(out, TAG_OCTET_STRING, bytes),
        SnmpValue::Null => push_tlv(out, TAG_NULL, &[]),
    }
}

pub fn encode_message(message: &SnmpMessage) -> Vec<u8> {
    let mut varbind_list = Vec::new();
    for (oid, value) in &message.varbinds {
        let mut varbind = Vec::new();
        push_tlv(&mut varbind, TAG_OID, &oid_content(oid));
        value_tlv(&mut varbind, value);
        push_tlv(&mut varbind_list, TAG_SEQUENCE, &varbind);
    }

    let mut pdu = Vec::new();
    push_tlv(&mut pdu, TAG_INTEGER, &integer_content(message.request_id));
    push_tlv(&mut pdu, TAG_INTEGER, &integer_content(message.error_status));
    push_tlv(&mut pdu, TAG_INTEGER, &integer_content(message.error_index));
    push_tlv(&mut pdu, TAG_SEQUENCE, &varbind_list);

    let mut body = Vec::new();
    push_tlv(&mut body, TAG_INTEGER, &integer_content(SNMP_V2C));
    push_tlv(&mut body, TAG_OCTET_STRING, message.community.as_bytes());
    push_tlv(&mut body, message.pdu_type, &pdu);

    let mut datagram = Vec::new();
    push_tlv(&mut datagram, TAG_SEQUENCE, &body);
    datagram
}

// ---- BER decoding ----

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        let b = *self.data.get(self.pos).ok_or(CodecError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::BadLength)?;
        let slice = self.data.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn length(&mut self) -> Result<usize, CodecError> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let n = (first & 0x7F) as usize;
        if n == 0 || n > 4 {
            return Err(CodecError::BadLength);
        }
        let mut len = 0usize;
        for _ in 0..n {
            len = len << 8 | self.byte()? as usize;
        }
        Ok(len)
    }

    fn tlv(&mut self) -> Result<(u8, &'a [u8]), CodecError> {
        let tag = self.byte()?;
        let len = self.length()?;
        Ok((tag, self.take(len)?))
    }

    fn expect(&mut self, wanted: u8) -> Result<&'a [u8], CodecError> {
        let (tag, content) = self.tlv()?;
        if tag != wanted {
            return Err(CodecError::UnexpectedTag { wanted, got: tag });
        }
        Ok(content)
    }
}

fn decode_integer(content: &[u8]) -> i64 {
    let mut v: i64 = if content.first().is_some_and(|b| b & 0x80 != 0) {
        -1
    } else {
        0
    };
    for &b in content {
        v = v << 8 | i64::from(b);
    }
    v
}

fn decode_unsigned(content: &[u8]) -> u64 {
    let mut v: u64 = 0;
    for &b in content {
        v = v << 8 | u64::from(b);
    }
    v
}

fn decode_oid(content: &[u8]) -> Result<Oid, CodecError> {
    let mut components = Vec::new();
    let first = *content.first().ok_or(CodecError::BadOid)?;
    components.push(u32::from(first) / 40);
    components.push(u32::from(first) % 40);
    let mut current: u32 = 0;
    for &b in &content[1..] {
        current = current
            .checked_shl(7)
            .ok_or(CodecError::BadOid)?
            | u32::from(b & 0x7F);
        if b & 0x80 == 0 {
            components.push(current);
            current = 0;
        }
    }
    Ok(Oid(components))
}

fn decode_value(tag: u8, content: &[u8]) -> SnmpValue {
    match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_integer(content)),
        TAG_GAUGE32 => SnmpValue::Gauge32(decode_unsigned(content) as u32),
        TAG_COUNTER32 => SnmpValue::Counter32(decode_unsigned(content) as u32),
        TAG_COUNTER64 => SnmpValue::Counter64(decode_unsigned(content)),
        TAG_OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
        _ => SnmpValue::Null,
    }
}

pub fn parse_message(datagram: &[u8]) -> Result<SnmpMessage, CodecError> {
    let mut outer = Reader::new(datagram);
    let mut body = Reader::new(outer.expect(TAG_SEQUENCE)?);

    let version = decode_integer(body.expect(TAG_INTEGER)?);
    if version != SNMP_V2C {
        return Err(CodecError::BadVersion(version));
    }
    let community = String::from_utf8_lossy(body.expect(TAG_OCTET_STRING)?).into_owned();

    let (pdu_type, pdu_content) = body.tlv()?;
    let mut pdu = Reader::new(pdu_content);
    let request_id = decode_integer(pdu.expect(TAG_INTEGER)?);
    let error_status = decode_integer(pdu.expect(TAG_INTEGER)?);
    let error_index = decode_integer(pdu.expect(TAG_INTEGER)?);

    let mut varbinds = Vec::new();
    let mut varbind_list = Reader::new(pdu.expect(TAG_SEQUENCE)?);
    while !varbind_list.is_empty() {
        let mut varbind = Reader::new(varbind_list.expect(TAG_SEQUENCE)?);
        let oid = decode_oid(varbind.expect(TAG_OID)?)?;
        let (value_tag, value_content) = varbind.tlv()?;
        varbinds.push((oid, decode_value(value_tag, value_content)));
    }

    Ok(SnmpMessage {
        community,
        pdu_type,
        request_id,
        error_status,
        error_index,
        varbinds,
    })
}

// ---- Agent ----

type Registry = BTreeMap<Oid, SnmpValue>;

/// Rebuild the scalar registry from the store through the mapping.
pub fn refresh_registry(store: &DataStore, mapping: &SnmpMapping) -> Registry {
    let enterprise = Oid(ENTERPRISE_OID.to_vec());
    let mut registry = Registry::new();
    for entry in mapping.all().values() {
        let value = store.read(entry.key.as_str());
        let mut oid = enterprise.child(entry.attrs.oid_suffix);
        if let Some(index) = entry.attrs.index {
            oid = oid.child(index);
        }
        registry.insert(oid, encode_by_syntax(&value, entry.attrs.syntax));
    }
    registry
}

fn encode_by_syntax(value: &TagValue, syntax: SnmpSyntax) -> SnmpValue {
    match syntax {
        SnmpSyntax::Integer => SnmpValue::Integer(value.as_i64().unwrap_or(0)),
        SnmpSyntax::Gauge32 => SnmpValue::Gauge32(unsigned32(value)),
        SnmpSyntax::Counter32 => SnmpValue::Counter32(unsigned32(value)),
        SnmpSyntax::Counter64 => {
            SnmpValue::Counter64(value.as_f64().map(|v| v.max(0.0) as u64).unwrap_or(0))
        }
        SnmpSyntax::OctetString => SnmpValue::OctetString(value.to_string().into_bytes()),
    }
}

fn unsigned32(value: &TagValue) -> u32 {
    value.as_f64().map(|v| v.clamp(0.0, u32::MAX as f64) as u32).unwrap_or(0)
}

/// Answer one request against the current registry. Returns None for
/// datagrams that should be dropped (bad community, undecodable).
pub fn handle_datagram(datagram: &[u8], registry: &Registry) -> Option<Vec<u8>> {
    let request = match parse_message(datagram) {
        Ok(request) => request,
        Err(e) => {
            log::debug!("snmp: dropping undecodable datagram: {e}");
            return None;
        }
    };
    if request.community != COMMUNITY {
        log::debug!("snmp: dropping request with community '{}'", request.community);
        return None;
    }

    let mut response = SnmpMessage {
        community: request.community.clone(),
        pdu_type: PDU_RESPONSE,
        request_id: request.request_id,
        error_status: 0,
        error_index: 0,
        varbinds: Vec::new(),
    };

    match request.pdu_type {
        PDU_GET => {
            for (i, (oid, _)) in request.varbinds.iter().enumerate() {
                let hit = oid
                    .starts_with(VIEW_ROOT)
                    .then(|| registry.get(oid))
                    .flatten();
                match hit {
                    Some(value) => response.varbinds.push((oid.clone(), value.clone())),
                    None => {
                        response.error_status = ERR_NO_SUCH_NAME;
                        response.error_index = (i + 1) as i64;
                        response.varbinds = request.varbinds.clone();
                        break;
                    }
                }
            }
        }
        PDU_GET_NEXT => {
            for (i, (oid, _)) in request.varbinds.iter().enumerate() {
                let next = registry
                    .range((Bound::Excluded(oid.clone()), Bound::Unbounded))
                    .next();
                match next {
                    Some((next_oid, value)) if next_oid.starts_with(VIEW_ROOT) => {
                        response.varbinds.push((next_oid.clone(), value.clone()));
                    }
                    _ => {
                        response.error_status = ERR_NO_SUCH_NAME;
                        response.error_index = (i + 1) as i64;
                        response.varbinds = request.varbinds.clone();
                        break;
                    }
                }
            }
        }
        PDU_SET => {
            response.error_status = ERR_READ_ONLY;
            response.error_index = 1;
            response.varbinds = request.varbinds.clone();
        }
        _ => {
            response.error_status = ERR_GEN_ERR;
            response.varbinds = request.varbinds.clone();
        }
    }

    Some(encode_message(&response))
}

/// Agent entry point; runs until the stop flag is raised.
pub fn run(
    socket: UdpSocket,
    store: Arc<DataStore>,
    mapping: Arc<SnmpMapping>,
    stop: Arc<AtomicBool>,
    tick: Duration,
) {
    if let Err(e) = socket.set_read_timeout(Some(Duration::from_secs(1))) {
        log::error!("snmp: could not configure socket: {e}");
    }

    let mut registry = refresh_registry(&store, &mapping);
    let mut last_refresh = Instant::now();
    let mut buf = [0u8; 1500];

    while !stop.load(Ordering::SeqCst) {
        if last_refresh.elapsed() >= tick {
            registry = refresh_registry(&store, &mapping);
            last_refresh = Instant::now();
        }

        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                if let Some(response) = handle_datagram(&buf[..len], &registry) {
                    if let Err(e) = socket.send_to(&response, peer) {
                        log::debug!("snmp: send error to {peer}: {e}");
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::debug!("snmp: receive error: {e}");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    log::info!("SNMP agent stopped");
}
