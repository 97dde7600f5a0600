//! # parley-server
//!
//! HTTP side of the Parley chat streaming core.
//!
//! A message posted to `/chat/stream` runs through a [`pipeline::Pipeline`]
//! (containment, validation, timing) into [`chat::ChatService`], which
//! persists the user message, opens a [`fragment::FragmentSource`] on the
//! configured [`backend::GenerationBackend`] and hands the fragments to
//! [`transport`], which frames them as Server-Sent Events.

pub mod api;
pub mod backend;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod fragment;
pub mod identity;
pub mod pipeline;
pub mod transport;

pub use api::{build_router, serve, AppState};
pub use config::ServerConfig;
