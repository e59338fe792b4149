//! Session engine for a namespace-based real-time network emulator.
//!
//! This crate is the core described by the design: the session state
//! machine, node registry and lifecycle, network fabric, link/impairment
//! engine, service scheduler, mobility engine, event bus, distributed
//! peer, and address allocator. Everything else (GUI, gRPC transport,
//! XML-driving tools, packaging) is an external collaborator that drives
//! this crate through the operations re-exported from [`session`].

pub mod addr;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod ids;
pub mod link;
pub mod mobility;
pub mod network;
pub mod node;
pub mod peer;
pub mod service;
pub mod session;
pub mod xml;

pub use error::{Error, Result};
pub use ids::{HookId, InterfaceId, NetworkId, NodeId, SessionId};
pub use session::{Session, SessionState};
