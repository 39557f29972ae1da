//! # parley-shared
//!
//! Types shared by the Parley server, store and client: identifiers, the call
//! session model, and the JSON event protocol spoken over the WebSocket.

pub mod call;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;
