pub mod config;
pub mod logger;
pub mod stream;
pub mod wiring;
