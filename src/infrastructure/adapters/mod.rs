//! Platform connectors

pub mod console;

pub use console::{ConsoleConnector, ConsoleConnectorFactory};
