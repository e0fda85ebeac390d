//! Infrastructure adapters and runtime bootstrap.

pub mod db;
pub mod downstream;
pub mod error;
pub mod http;
pub mod management;
pub mod memory;
pub mod telemetry;
pub mod upstream;
