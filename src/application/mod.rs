//! Core services: fingerprinting, dependency bookkeeping and invalidation.

pub mod content;
pub mod downstream;
pub mod error;
pub mod fingerprint;
pub mod invalidation;
pub mod query;
pub mod repos;
