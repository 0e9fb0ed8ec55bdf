//! Docflow Infrastructure Library
//!
//! Outbound side of the ingestion core: the processing dispatcher with its
//! HTTP job transport and endpoint checks, plus tracing setup for binaries.

pub mod dispatch;
pub mod telemetry;

pub use dispatch::{
    validate_endpoint, EndpointError, JobTransport, ProcessingDispatcher, ReqwestTransport,
    TransportError, SIGNATURE_HEADER,
};
pub use telemetry::init_telemetry;
