//! The Agent interface: an external boundary the core orchestrates around
//! but never reaches into (spec.md §4.9).
//!
//! Agent internals — prompt construction, tool use, whatever turns a prompt
//! into a diagram spec — are out of scope. This crate defines the contract
//! only, plus a `MockAgent` test double.

pub mod agent;
pub mod mock;

pub use agent::{Agent, GenerateGraphOutcome, GenerateGraphRequest};
pub use mock::MockAgent;
