pub mod config;
pub mod identity;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod terminal;
pub mod transport;
