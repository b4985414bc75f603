//! Bearer token acquisition and caching
//!
//! The speech endpoint requires a bearer token. [`TokenProvider`] hands out
//! the cached token when one exists and otherwise refreshes it against the
//! auth endpoint with an anonymous credential. Tokens are persisted through
//! the [`TokenStore`] get/set contract so a secure backend can be swapped in.

mod provider;
mod store;

pub use provider::{TOKEN_FIELD, TOKEN_SLOT, TokenProvider};
pub use store::{MemoryTokenStore, SqliteTokenStore, TokenStore};
