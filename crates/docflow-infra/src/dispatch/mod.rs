//! Processing dispatcher: hands uploaded files to the external processing engine.

mod dispatcher;
pub mod endpoint;
pub mod transport;

pub use dispatcher::{ProcessingDispatcher, JOB_EVENT};
pub use endpoint::{validate_endpoint, EndpointError};
pub use transport::{sign_body, JobTransport, ReqwestTransport, TransportError, SIGNATURE_HEADER};
