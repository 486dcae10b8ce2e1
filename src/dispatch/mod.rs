//! The dispatch core: mission interpretation and per-robot execution.

pub mod reconciler;
pub mod sequencer;
pub mod server;
pub mod supervisor;
pub mod tree;
pub mod worker;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testutil;

pub use reconciler::StatusWriter;
pub use server::DispatchServer;
pub use worker::{RobotEvent, RobotHandle, RobotWorker};
