pub mod connection;
pub mod connector;
pub mod frame_reader;
pub mod health;
pub mod socket;
pub mod stats;
pub mod tls;

pub use connection::{BoxedStream, Connection};
pub use connector::{Connector, TcpConnector};
