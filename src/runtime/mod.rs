//! Runtime - supervised units and the links between them
//!
//! Every bot and every plugin runs as its own unit with a private mailbox.
//! Units only talk over links handed out by the supervisor.

pub mod bot_unit;
pub mod invocation;
pub mod link;
pub mod plugin_unit;
pub mod protocol;
pub mod supervisor;

pub use invocation::{EventContext, Invocation, JobContext};
pub use link::{BotLink, CorrelationTable, LinkId, PluginLink};
pub use supervisor::{
    ShutdownReason, Supervisor, SupervisorHandle, UnitId, UnitSpec, UnitState, UnitStatus,
};
