//! Plugin system
//!
//! Plugins are declared as immutable descriptors and hosted by plugin units.

pub mod catalog;
pub mod core;
pub mod descriptor;
pub mod dice;

pub use catalog::PluginCatalog;
pub use descriptor::{EventHandler, Job, JobHandler, PluginBuilder, PluginDescriptor, PluginManifest};
