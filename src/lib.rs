//! governance-agent: autonomous DAO participant
//!
//! Watches node telemetry and the DAO's shared decision value. When a
//! configured telemetry rule fires, the agent proposes setting the value to
//! the rule's action; it votes on every proposal that becomes active, and
//! dispatches the mapped action endpoint whenever the value changes.

pub mod agent;
pub mod api;
pub mod config;
pub mod ledger;
pub mod telemetry;
