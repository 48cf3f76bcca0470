//! Industrial IoT protocol gateway.
//!
//! One thread-safe, typed tag store ([`store::DataStore`]) is exposed over
//! four industrial protocols at a fixed cadence: Modbus TCP holding
//! registers, IEC 60870-5-104 ASDU frames, OPC-UA variables and SNMPv2c
//! scalars. Per-protocol [`mapping`] registries translate stable tag ids
//! into protocol-native addresses with conflict-free automatic allocation,
//! and a local Unix-socket [`ipc`] endpoint accepts newline-delimited JSON
//! writes from the polling adapter.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod ipc;
pub mod mapping;
pub mod servers;
pub mod store;
pub mod tags;
pub mod value;
