pub mod buffer_pool;
pub mod rolling_window;
pub mod safe_converter;
