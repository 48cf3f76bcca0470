use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::value::DataType;

/// Errors raised by [`crate::store::DataStore`] registration and address
/// allocation. Read/write paths never fail; see the store docs.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("address {address} already used by key '{existing}'")]
    AddressConflict { address: u16, existing: String },

    #[error("address range exhausted for data type '{data_type}' (range: {start}-{end})")]
    AddressSpaceExhausted {
        data_type: DataType,
        start: u16,
        end: u16,
    },

    #[error("address {address} lies outside the {data_type} range {start}-{end}")]
    AddressOutOfRange {
        address: u16,
        data_type: DataType,
        start: u16,
        end: u16,
    },
}

/// Errors raised by the protocol mapping registries.
#[derive(Debug, Clone, Error)]
pub enum MappingError {
    #[error("{protocol} locator {locator} already mapped to key '{existing}'")]
    LocatorConflict {
        protocol: &'static str,
        locator: String,
        existing: String,
    },

    #[error("no free {protocol} locator left in {start}-{end}")]
    LocatorSpaceExhausted {
        protocol: &'static str,
        start: u32,
        end: u32,
    },
}

/// Errors surfaced by the IPC client. The server side reports failures to the
/// peer on the wire instead of returning them.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("could not reach IPC socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed response from gateway: {0}")]
    BadResponse(#[from] serde_json::Error),

    #[error("gateway closed the connection without responding")]
    EmptyResponse,
}

/// Fatal startup errors. Anything recoverable is logged and retried inside
/// the server loops instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("could not read tag manifest {path}: {source}")]
    ManifestIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse tag manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
