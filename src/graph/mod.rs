//! Graph API access: per-tenant authenticated transports and the message
//! fetcher that turns provider messages into canonical envelopes.

pub mod client;
pub mod error;
pub mod fetcher;
pub mod message;

pub use client::{GraphClient, GraphClients};
pub use error::GraphError;
pub use fetcher::{FetchError, MessageFetcher};
