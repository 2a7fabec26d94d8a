//! Process wiring for swincebot: operator configuration, logging, the
//! secrets vault, the health endpoint and the lifecycle that ties storage
//! bootstrap to an orderly shutdown.

pub mod app;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod secrets;
pub mod server;
