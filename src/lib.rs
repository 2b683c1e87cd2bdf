//! meshbot - a multi-account chat bot host
//!
//! Bots and plugins run as supervised units connected by a full link mesh.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod plugins;
pub mod runtime;
