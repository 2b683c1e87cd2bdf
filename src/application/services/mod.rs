//! Application services - Stateful stores owned by a bot unit

pub mod profile;

pub use profile::{DisabledPlugins, Profile};
