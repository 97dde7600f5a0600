//! # parley-client
//!
//! Client side of the Parley streaming exchange: an HTTP API client, the
//! stream consumer with reconnect backoff, and the [`Reconciler`] that keeps
//! the visible transcript consistent while replies stream in.

pub mod api;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod retry;
pub mod session;

pub use config::ClientConfig;
pub use error::ClientError;
pub use reconciler::Reconciler;
pub use session::{ChatSession, ExchangeOutcome};
