//! sqlscout: a diagnostic chat agent for SQL Server databases.
//!
//! The binary wires a dev connector; production deployments construct their
//! own [`scout_tools::SqlConnector`] implementation and start the server via
//! [`server::serve`].

pub mod agent;
pub mod config;
pub mod dev_backends;
pub mod prompts;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;
