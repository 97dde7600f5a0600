//! Domain models persisted by the store.
//!
//! The structs live in `parley-shared` so the server can return them over
//! HTTP and the client can decode them without depending on this crate.

pub use parley_shared::models::{Conversation, ConversationWithMessages, Message, NewMessage};
