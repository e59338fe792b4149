//! Session-wide error type.
//!
//! Component modules (host, network, link, service, mobility, peer) define
//! their own `thiserror` enums for the failures specific to them and
//! convert into this one at the boundary, the way the teacher's
//! `TestbenchError` aggregates `NetNsError`/`VethError`/`QdiscError`.

use thiserror::Error;

use crate::addr::AddrError;
use crate::host::{NetNsError, VethError};
use crate::network::QdiscError;
use crate::peer::PeerError;
use crate::service::ServiceError;

/// The five error kinds from the error-handling design: bad input or
/// wrong state, an unknown id, a kernel syscall failure, a peer channel
/// failure, or cancellation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("kernel operation failed: {0}")]
    Kernel(String),

    #[error("remote peer error: {0}")]
    Remote(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("namespace error: {0}")]
    NetNs(#[from] NetNsError),

    #[error("veth error: {0}")]
    Veth(#[from] VethError),

    #[error("qdisc error: {0}")]
    Qdisc(#[from] QdiscError),

    #[error("service scheduler error: {0}")]
    Service(#[from] ServiceError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("address allocator error: {0}")]
    Addr(#[from] AddrError),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("system call error: {0}")]
    Nix(#[from] nix::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("xml error: {0}")]
    Xml(String),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Exit-code class for the CLI wrapper (spec §6: distinguishes invalid
    /// state transition, unknown entity, kernel failure, peer unreachable,
    /// cancelled).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) => 2,
            Error::NotFound(_) => 3,
            Error::Kernel(_) | Error::Qdisc(_) | Error::Veth(_) | Error::NetNs(_) => 4,
            Error::Remote(_) | Error::Peer(_) => 5,
            Error::Cancelled => 6,
            Error::Netlink(_) | Error::Nix(_) | Error::Io(_) => 4,
            Error::Service(_) => 2,
            Error::Addr(_) => 4,
            Error::Xml(_) => 2,
            Error::Config(_) => 2,
        }
    }
}
