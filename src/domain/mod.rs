//! Domain layer - chat entities and the seams to the outside world
//!
//! - Entities: users, messages, commands, permission levels, group settings
//! - Traits: the platform connector contract and the document store

pub mod entities;
pub mod traits;
