//! Reaching nodes over NNG.

mod client;

pub use client::{NngConnector, NngRemoteNode};
