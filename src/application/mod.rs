//! Application layer - Use cases and business logic
//! 
//! This layer contains:
//! - Errors: The error taxonomy shared by every unit
//! - Messaging: Parsing, routing, gating and dispatching commands
//! - Services: The per-account settings store

pub mod errors;
pub mod messaging;
pub mod services;
