//! Helpers for testing code that talks to a server: encoding response frames, parsing request
//!  frames, and an in-process server speaking the wire protocol.

pub mod frames;
pub mod mock_server;
