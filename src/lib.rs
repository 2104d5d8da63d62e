//! Bidirectional gRPC over a single multiplexed connection.
//!
//! A peer that dials a [`server::Server`] gets a [`client::ClientConn`]; both
//! sides can then call each other over sub-streams of the same session. Server
//! handlers find "who just called me, and how do I call back" with
//! [`server::Server::client_from_request`].

pub mod client;
pub mod demo;
pub mod identity;
pub mod listener;
pub mod net;
pub mod registry;
pub mod server;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use client::{ClientConn, ClientIdInterceptor, ClientOptions};
pub use identity::{ClientId, METADATA_CLIENT_ID_KEY};
pub use server::{Server, ServerOptions};
