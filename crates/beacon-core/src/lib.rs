pub mod normalize;
pub mod reader;
pub mod record;
pub mod store;
pub mod transport;

use thiserror::Error;

/// Core error type for collector operations
#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("Invalid Payload: {0}")]
    Validation(String),
    #[error("No trace found for id: {0}")]
    NotFound(String),
    #[error("Trace store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Configuration Error: {0}")]
    Configuration(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BeaconError>;

pub use normalize::{ingest, normalize};
pub use reader::LogReader;
pub use record::TraceRecord;
pub use store::TraceStore;
pub use transport::{resolve_transport, Transport, TransportKind};
