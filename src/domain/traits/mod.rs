//! Domain traits - Abstractions for infrastructure implementations

pub mod connector;
pub mod store;

pub use connector::{
    Connector, ConnectorFactory, ConnectorSession, ConnectorStat, FriendInfo, GroupInfo,
};
pub use store::DocumentStore;
