//! Undertow: a capability-token acquisition pipeline.
//!
//! A sandboxed process cannot reach the message store directly. It can,
//! however, ask three independent privileged coordinators for
//! narrowly-scoped capability tokens: one unlocks connectivity to the
//! bulk transfer service, another unlocks filesystem visibility of that
//! service's cache. Each token is redeemed through a local authorization
//! primitive. Chained in the right order, those grants let the process
//! siphon protected files into a location it can read.

pub mod broker;
pub mod config;
pub mod descriptor;
pub mod extract;
pub mod pipeline;
pub mod sandbox;
pub mod telemetry;
pub mod token;
