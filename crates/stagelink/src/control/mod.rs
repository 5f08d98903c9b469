// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Control connection layer: peer-to-peer control message transport.
//!
//! This is NOT the bulk data path. It carries setup handshakes, per-timestep
//! metadata and small bookkeeping messages between individual ranks of the
//! writer and reader cohorts.
//!
//! # Architecture
//!
//! ```text
//! +------------------------------------------------------------+
//! |  ControlNet (one per process / Context)                    |
//! |                                                            |
//! |  app threads --- conn.send(msg) ---> outbound              |
//! |                                                            |
//! |  inbound --> single dispatcher thread --> endpoint handler |
//! |              (the only thread that ever invokes handlers)  |
//! +------------------------------------------------------------+
//! ```
//!
//! Every inbound message and peer-failure notification is delivered by one
//! dedicated dispatcher thread per net instance. Handlers take the stream
//! lock, mutate state and signal the stream condvar; they must never block
//! on message delivery themselves.

pub mod inproc;
pub mod msg;
pub mod tcp;
pub mod wire;

pub use inproc::InProcNet;
pub use msg::{ControlMsg, FormatBlock, WriterConfig};
pub use tcp::TcpNet;

use std::sync::Arc;

use crate::error::Result;

/// Serialized endpoint address, e.g. `inproc://7` or `tcp://10.0.0.3:26500/2`.
///
/// Opaque to the control plane; only the net that minted it can parse it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContactInfo(pub String);

impl std::fmt::Display for ContactInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event delivered to an endpoint handler by the dispatcher thread.
pub enum NetEvent {
    /// An inbound control message.
    Msg(ControlMsg),
    /// A peer connection dropped outside of an orderly close. Carries the
    /// peer's address; endpoints decide whether that peer matters to them.
    PeerDown(ContactInfo),
}

/// Endpoint message handler, invoked on the dispatcher thread only.
pub type EventHandler = dyn Fn(NetEvent) + Send + Sync;

/// A sendable handle to one remote endpoint.
pub trait ControlConn: Send + Sync {
    /// Send one message. Failure means the peer is unreachable; callers
    /// translate this into a peer-failed status transition.
    fn send(&self, msg: &ControlMsg) -> Result<()>;
    /// The remote endpoint's address.
    fn peer(&self) -> &ContactInfo;
}

/// A local endpoint able to receive messages and open connections.
pub trait ControlEndpoint: Send + Sync {
    /// This endpoint's published address.
    fn contact(&self) -> ContactInfo;
    /// Open a connection to a remote endpoint.
    fn connect(&self, peer: &ContactInfo) -> Result<Arc<dyn ControlConn>>;
    /// Stop receiving. Subsequent sends to this endpoint fail at the peer.
    fn close(&self);
}

/// A control message transport.
pub trait ControlNet: Send + Sync {
    /// Create an endpoint whose inbound events are delivered to `handler`
    /// on the net's dispatcher thread.
    fn open_endpoint(&self, handler: Box<EventHandler>) -> Result<Arc<dyn ControlEndpoint>>;
}
