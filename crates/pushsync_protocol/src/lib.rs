//! # pushsync protocol
//!
//! Mobile API request and response types for pushsync.
//!
//! This crate provides:
//! - `RequestKind`: the closed set of API calls, each with its method,
//!   mutating flag and default retry limit as plain data
//! - `ApiRequest`: a fully built request (path, query, scoped JSON body)
//! - `ResponsePayload`: decoded responses, with forward-compatible
//!   attribute parsing (unknown fields are dropped)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod request;
mod response;

pub use error::{ProtocolError, ProtocolResult};
pub use request::{attributes_body, ApiRequest, HttpMethod, RequestKind};
pub use response::{AttributeFields, ResponsePayload};
