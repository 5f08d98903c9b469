// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! In-process control net.
//!
//! Reference transport for single-process deployments and tests: endpoints
//! live in one `DashMap`, sends push onto an unbounded channel, and a single
//! dispatcher thread delivers to handlers. Sends never block, so it is safe
//! to send while holding a stream lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use log::{debug, warn};

use crate::control::{
    ContactInfo, ControlConn, ControlEndpoint, ControlMsg, ControlNet, EventHandler, NetEvent,
};
use crate::error::{Error, Result};

const SCHEME: &str = "inproc://";

enum Dispatch {
    Deliver { target: u64, msg: ControlMsg },
    Shutdown,
}

struct NetShared {
    endpoints: DashMap<u64, Arc<EndpointEntry>>,
    tx: Sender<Dispatch>,
}

struct EndpointEntry {
    handler: Box<EventHandler>,
}

/// In-process message transport with a single dispatcher thread.
pub struct InProcNet {
    shared: Arc<NetShared>,
    next_id: AtomicU64,
    dispatcher: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl InProcNet {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = unbounded();
        let shared = Arc::new(NetShared {
            endpoints: DashMap::new(),
            tx,
        });
        let dispatcher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("stagelink-ctl".into())
                .spawn(move || dispatch_loop(&shared, &rx))
                .expect("spawn dispatcher thread")
        };
        Arc::new(Self {
            shared,
            next_id: AtomicU64::new(1),
            dispatcher: parking_lot::Mutex::new(Some(dispatcher)),
        })
    }

    fn parse_contact(contact: &ContactInfo) -> Result<u64> {
        contact
            .0
            .strip_prefix(SCHEME)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| Error::ConnectFailed(format!("not an inproc address: {}", contact)))
    }
}

fn dispatch_loop(shared: &NetShared, rx: &Receiver<Dispatch>) {
    while let Ok(event) = rx.recv() {
        match event {
            Dispatch::Deliver { target, msg } => {
                // Hold the map guard only long enough to clone the entry;
                // the handler may open endpoints on this same net.
                let entry = shared.endpoints.get(&target).map(|e| Arc::clone(&e));
                match entry {
                    Some(entry) => (entry.handler)(NetEvent::Msg(msg)),
                    // Endpoint closed between send and delivery; the sender
                    // already succeeded, so this is a silent drop, exactly
                    // like a datagram to a vanished process.
                    None => debug!("[InProcNet] dropping message for closed endpoint {}", target),
                }
            }
            Dispatch::Shutdown => return,
        }
    }
}

impl ControlNet for InProcNet {
    fn open_endpoint(&self, handler: Box<EventHandler>) -> Result<Arc<dyn ControlEndpoint>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .endpoints
            .insert(id, Arc::new(EndpointEntry { handler }));
        Ok(Arc::new(InProcEndpoint {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

impl Drop for InProcNet {
    fn drop(&mut self) {
        let _ = self.shared.tx.send(Dispatch::Shutdown);
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                warn!("[InProcNet] dispatcher thread panicked");
            }
        }
    }
}

struct InProcEndpoint {
    id: u64,
    shared: Arc<NetShared>,
}

impl ControlEndpoint for InProcEndpoint {
    fn contact(&self) -> ContactInfo {
        ContactInfo(format!("{}{}", SCHEME, self.id))
    }

    fn connect(&self, peer: &ContactInfo) -> Result<Arc<dyn ControlConn>> {
        let target = InProcNet::parse_contact(peer)?;
        if !self.shared.endpoints.contains_key(&target) {
            return Err(Error::ConnectFailed(format!("no endpoint at {}", peer)));
        }
        Ok(Arc::new(InProcConn {
            peer: peer.clone(),
            target,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn close(&self) {
        self.shared.endpoints.remove(&self.id);
    }
}

struct InProcConn {
    peer: ContactInfo,
    target: u64,
    shared: Arc<NetShared>,
}

impl ControlConn for InProcConn {
    fn send(&self, msg: &ControlMsg) -> Result<()> {
        if !self.shared.endpoints.contains_key(&self.target) {
            return Err(Error::SendFailed(format!("endpoint {} is closed", self.peer)));
        }
        self.shared
            .tx
            .send(Dispatch::Deliver {
                target: self.target,
                msg: msg.clone(),
            })
            .map_err(|_| Error::SendFailed("control net is shut down".into()))
    }

    fn peer(&self) -> &ContactInfo {
        &self.peer
    }
}
