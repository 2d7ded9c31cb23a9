//! Coordinator-Free Distributed Processing Library
//!
//! This library crate defines the modules of a processing peer. It serves as the foundation
//! for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of three loosely coupled subsystems:
//!
//! - **`pubsub`**: The broadcast transport. A UDP gossip layer (SWIM-like membership) carrying
//!   topic messages between peers, plus an in-process bus for simulations.
//! - **`processing`**: The replicated subtask queue. Ownership protocol, lock expiration,
//!   worker loops, result validation and finalization.
//! - **`node`**: The task runtime registry and its HTTP surface.
//!
//! `config` holds the protocol policy values and the command line of the node.

pub mod config;
pub mod node;
pub mod processing;
pub mod pubsub;
