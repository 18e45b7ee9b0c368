//! Client side of a direct TCP transport to database replicas.
//!
//! Requests are encoded into a length-prefixed, tokenized binary frame format and multiplexed over
//!  a small pool of connections per server. The layers, from the wire up:
//!
//! * [wire] encodes requests and decodes responses. No I/O.
//! * [connection] owns a single TCP (optionally TLS) stream and tracks its liveness.
//! * [dispatcher] correlates responses to the calls in flight on one connection.
//! * [channel] wraps a dispatcher in a lifecycle: open, negotiate, idle, closed.
//! * [load_balancing] keeps a growable, admission-controlled set of channels per server.
//! * [system_usage] samples machine load for backpressure decisions further up.
//!
//! [client::TransportClient] ties these together.

pub mod address;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod load_balancing;
pub mod system_usage;
pub mod util;
pub mod wire;

#[cfg(test)]
pub mod test_util;
