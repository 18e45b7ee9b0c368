pub mod call_table;
pub mod dispatcher;
pub mod negotiation;

pub use dispatcher::Dispatcher;
