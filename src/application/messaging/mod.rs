//! Message handling - Parsing, matching, gating and dispatching commands

pub mod dispatcher;
pub mod gate;
pub mod parser;
pub mod router;

pub use dispatcher::{Action, MessageDispatcher, Routed};
pub use gate::{ApplyGate, Gate, GateChain, GateContext, PermissionGate, Verdict};
pub use parser::{MessageParser, ParsedCommand};
pub use router::{CommandRouter, RouteOutcome};
