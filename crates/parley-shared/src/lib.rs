//! # parley-shared
//!
//! Types shared by the Parley server and client: identifiers, the wire
//! protocol of the streaming chat exchange, the error taxonomy, and the
//! Server-Sent Events frame decoder used on both ends of a stream.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod sse;
pub mod types;

pub use error::{ChatError, ErrorKind};
