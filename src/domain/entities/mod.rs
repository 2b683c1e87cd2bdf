//! Domain entities - Core business objects with no external dependencies

pub mod user;
pub mod message;
pub mod command;
pub mod permission;
pub mod setting;

pub use user::{GroupRole, User};
pub use message::{ChatScope, ConnectorEvent, GroupNotice, LoginEvent, Message};
pub use command::{
    handler, Arg, ArgValue, Args, Command, CommandRegistry, CommandScope, CommandSpec, Handler,
    HandlerFuture, HandlerResult, Signature,
};
pub use permission::{PermissionLevel, PermissionPolicy, PermissionRange};
pub use setting::{GroupSetting, PluginOption, SettingDocument};
