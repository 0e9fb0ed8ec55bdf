//! Docflow Processing Library
//!
//! Pre-upload checks for submitted documents.

pub mod validator;

pub use validator::{Accepted, DocumentValidator, ValidationError};
