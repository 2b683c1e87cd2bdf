//! Infrastructure layer - configuration, persistence and platform connectors

pub mod adapters;
pub mod config;
pub mod storage;
