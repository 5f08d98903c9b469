// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! TCP control net for multi-node deployments.
//!
//! One listener per net instance; endpoints are multiplexed over it by a
//! 64-bit endpoint id carried in each frame. Per-connection reader threads
//! funnel decoded frames into the same single dispatcher thread the in-proc
//! net uses, so handlers still see exactly one delivery thread.
//!
//! Frame layout (little-endian): `u32 length | u64 endpoint_id | payload`,
//! where `length` counts the id plus payload. Endpoint id 0 is reserved for
//! the connection hello, whose payload is the sender's canonical listener
//! address -- that is what peer-failure notifications report, since the
//! ephemeral source port of a dropped connection identifies nobody.
//!
//! A connection drop is always reported as `PeerDown`; stream handlers that
//! already saw an orderly `WriterClose`/`ReaderClose` simply ignore it.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};

use crate::control::{
    ContactInfo, ControlConn, ControlEndpoint, ControlMsg, ControlNet, EventHandler, NetEvent,
};
use crate::error::{Error, Result};

const SCHEME: &str = "tcp://";
const HELLO_ENDPOINT: u64 = 0;
const MAX_FRAME: u32 = 256 * 1024 * 1024;

enum Dispatch {
    Deliver { target: u64, msg: ControlMsg },
    PeerDown { addr: String },
    Shutdown,
}

struct NetShared {
    endpoints: DashMap<u64, Arc<EndpointEntry>>,
    /// Outbound links keyed by remote listener address.
    links: DashMap<String, Arc<Link>>,
    tx: Sender<Dispatch>,
    local_addr: SocketAddr,
    shutdown: AtomicBool,
}

struct EndpointEntry {
    handler: Box<EventHandler>,
}

struct Link {
    stream: Mutex<TcpStream>,
}

impl Link {
    fn send_frame(&self, endpoint: u64, payload: &[u8]) -> std::io::Result<()> {
        let mut stream = self.stream.lock();
        let len = (8 + payload.len()) as u32;
        stream.write_all(&len.to_le_bytes())?;
        stream.write_all(&endpoint.to_le_bytes())?;
        stream.write_all(payload)?;
        stream.flush()
    }
}

/// Open (or reuse) the outbound link to `addr`, sending the hello frame on
/// first use.
fn link_to(shared: &Arc<NetShared>, addr: &str) -> Result<Arc<Link>> {
    if let Some(link) = shared.links.get(addr) {
        return Ok(Arc::clone(&link));
    }
    let stream =
        TcpStream::connect(addr).map_err(|e| Error::ConnectFailed(format!("{}: {}", addr, e)))?;
    tune_socket(&stream);

    let link = Arc::new(Link {
        stream: Mutex::new(stream.try_clone()?),
    });
    link.send_frame(HELLO_ENDPOINT, shared.local_addr.to_string().as_bytes())
        .map_err(|e| Error::ConnectFailed(format!("{}: hello failed: {}", addr, e)))?;

    {
        let shared = Arc::clone(shared);
        let peer_addr = addr.to_string();
        std::thread::Builder::new()
            .name("stagelink-recv".into())
            .spawn(move || recv_loop(&shared, stream, Some(peer_addr)))
            .expect("spawn receive thread");
    }

    shared.links.insert(addr.to_string(), Arc::clone(&link));
    Ok(link)
}

fn tune_socket(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_nodelay(true) {
        debug!("[TcpNet] set_nodelay: {}", e);
    }
    let keepalive = TcpKeepalive::new().with_time(std::time::Duration::from_secs(30));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!("[TcpNet] set_tcp_keepalive: {}", e);
    }
}

fn dispatch_loop(shared: &NetShared, rx: &Receiver<Dispatch>) {
    while let Ok(event) = rx.recv() {
        match event {
            Dispatch::Deliver { target, msg } => {
                let entry = shared.endpoints.get(&target).map(|e| Arc::clone(&e));
                match entry {
                    Some(entry) => (entry.handler)(NetEvent::Msg(msg)),
                    None => debug!("[TcpNet] dropping message for closed endpoint {}", target),
                }
            }
            Dispatch::PeerDown { addr } => {
                let contact = ContactInfo(format!("{}{}", SCHEME, addr));
                let entries: Vec<Arc<EndpointEntry>> =
                    shared.endpoints.iter().map(|e| Arc::clone(&e)).collect();
                for entry in entries {
                    (entry.handler)(NetEvent::PeerDown(contact.clone()));
                }
            }
            Dispatch::Shutdown => return,
        }
    }
}

fn accept_loop(shared: &Arc<NetShared>, listener: &TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                tune_socket(&stream);
                let shared = Arc::clone(shared);
                std::thread::Builder::new()
                    .name("stagelink-recv".into())
                    .spawn(move || recv_loop(&shared, stream, None))
                    .expect("spawn receive thread");
            }
            Err(e) => {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                warn!("[TcpNet] accept failed: {}", e);
            }
        }
    }
}

/// Read frames until EOF or error. `peer_addr` is known up front for
/// outbound links; inbound connections learn it from the hello frame.
fn recv_loop(shared: &Arc<NetShared>, mut stream: TcpStream, peer_addr: Option<String>) {
    let mut peer_addr = peer_addr;
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if !(8..=MAX_FRAME).contains(&len) {
            warn!("[TcpNet] bad frame length {}", len);
            break;
        }
        let mut frame = vec![0u8; len as usize];
        if stream.read_exact(&mut frame).is_err() {
            break;
        }
        let mut id_buf = [0u8; 8];
        id_buf.copy_from_slice(&frame[..8]);
        let endpoint = u64::from_le_bytes(id_buf);

        if endpoint == HELLO_ENDPOINT {
            match std::str::from_utf8(&frame[8..]) {
                Ok(addr) => peer_addr = Some(addr.to_string()),
                Err(_) => {
                    warn!("[TcpNet] malformed hello frame");
                    break;
                }
            }
            continue;
        }

        match ControlMsg::decode(&frame[8..]) {
            Ok(msg) => {
                let _ = shared.tx.send(Dispatch::Deliver {
                    target: endpoint,
                    msg,
                });
            }
            Err(e) => {
                warn!(
                    "[TcpNet] undecodable frame for endpoint {}: {}",
                    endpoint, e
                );
                break;
            }
        }
    }

    if let Some(addr) = peer_addr {
        shared.links.remove(&addr);
        if !shared.shutdown.load(Ordering::Acquire) {
            let _ = shared.tx.send(Dispatch::PeerDown { addr });
        }
    }
}

/// TCP control message transport.
pub struct TcpNet {
    shared: Arc<NetShared>,
    next_id: AtomicU64,
}

impl TcpNet {
    /// Bind the listener and start the accept and dispatcher threads.
    /// `bind_addr` may use port 0 for an ephemeral port.
    pub fn bind(bind_addr: &str) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = unbounded();
        let shared = Arc::new(NetShared {
            endpoints: DashMap::new(),
            links: DashMap::new(),
            tx,
            local_addr,
            shutdown: AtomicBool::new(false),
        });

        {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("stagelink-ctl".into())
                .spawn(move || dispatch_loop(&shared, &rx))
                .expect("spawn dispatcher thread");
        }
        {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("stagelink-accept".into())
                .spawn(move || accept_loop(&shared, &listener))
                .expect("spawn accept thread");
        }

        Ok(Arc::new(Self {
            shared,
            next_id: AtomicU64::new(1),
        }))
    }

    /// The listener address this net publishes in its contacts.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    fn parse_contact(contact: &ContactInfo) -> Result<(String, u64)> {
        let rest = contact
            .0
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::ConnectFailed(format!("not a tcp address: {}", contact)))?;
        let (addr, id) = rest
            .rsplit_once('/')
            .ok_or_else(|| Error::ConnectFailed(format!("missing endpoint id: {}", contact)))?;
        let id = id
            .parse()
            .map_err(|_| Error::ConnectFailed(format!("bad endpoint id: {}", contact)))?;
        Ok((addr.to_string(), id))
    }
}

impl ControlNet for TcpNet {
    fn open_endpoint(&self, handler: Box<EventHandler>) -> Result<Arc<dyn ControlEndpoint>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .endpoints
            .insert(id, Arc::new(EndpointEntry { handler }));
        Ok(Arc::new(TcpEndpoint {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

impl Drop for TcpNet {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.tx.send(Dispatch::Shutdown);
        // Wake the blocked accept() so the thread observes the flag.
        let _ = TcpStream::connect(self.shared.local_addr);
    }
}

struct TcpEndpoint {
    id: u64,
    shared: Arc<NetShared>,
}

impl ControlEndpoint for TcpEndpoint {
    fn contact(&self) -> ContactInfo {
        ContactInfo(format!("{}{}/{}", SCHEME, self.shared.local_addr, self.id))
    }

    fn connect(&self, peer: &ContactInfo) -> Result<Arc<dyn ControlConn>> {
        let (addr, endpoint) = TcpNet::parse_contact(peer)?;
        // Resolve the link eagerly so connection errors surface here, not at
        // first send.
        let _ = link_to(&self.shared, &addr)?;
        Ok(Arc::new(TcpConn {
            peer: peer.clone(),
            addr,
            endpoint,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn close(&self) {
        self.shared.endpoints.remove(&self.id);
    }
}

struct TcpConn {
    peer: ContactInfo,
    addr: String,
    endpoint: u64,
    shared: Arc<NetShared>,
}

impl ControlConn for TcpConn {
    fn send(&self, msg: &ControlMsg) -> Result<()> {
        let link = link_to(&self.shared, &self.addr)?;
        link.send_frame(self.endpoint, &msg.encode()).map_err(|e| {
            self.shared.links.remove(&self.addr);
            Error::SendFailed(format!("{}: {}", self.peer, e))
        })
    }

    fn peer(&self) -> &ContactInfo {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded as chan;
    use std::time::Duration;

    #[test]
    fn frames_cross_a_loopback_socket() {
        let server = TcpNet::bind("127.0.0.1:0").expect("bind server");
        let client = TcpNet::bind("127.0.0.1:0").expect("bind client");

        let (tx, rx) = chan();
        let server_ep = server
            .open_endpoint(Box::new(move |event| {
                if let NetEvent::Msg(msg) = event {
                    tx.send(msg).unwrap();
                }
            }))
            .unwrap();

        let client_ep = client.open_endpoint(Box::new(|_| {})).unwrap();
        let conn = client_ep.connect(&server_ep.contact()).unwrap();
        conn.send(&ControlMsg::ReleaseTimestep {
            reader_id: 2,
            timestep: 11,
        })
        .unwrap();

        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            got,
            ControlMsg::ReleaseTimestep {
                reader_id: 2,
                timestep: 11
            }
        );
    }

    #[test]
    fn replies_flow_back_over_contact_from_message() {
        // Reader-register style exchange: B's contact travels inside a
        // message, A connects back using it.
        let a = TcpNet::bind("127.0.0.1:0").unwrap();
        let b = TcpNet::bind("127.0.0.1:0").unwrap();

        let (reply_tx, reply_rx) = chan();
        let b_ep = b
            .open_endpoint(Box::new(move |event| {
                if let NetEvent::Msg(msg) = event {
                    reply_tx.send(msg).unwrap();
                }
            }))
            .unwrap();

        let a_ep = a.open_endpoint(Box::new(|_| {})).unwrap();
        let back = a_ep.connect(&b_ep.contact()).unwrap();
        back.send(&ControlMsg::WriterResponse {
            response_cond: 7,
            reader_id: 1,
            writer_cohort: vec![a_ep.contact()],
            start_step: 0,
            config: crate::control::msg::WriterConfig::default(),
            formats: vec![],
        })
        .unwrap();

        let got = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            got,
            ControlMsg::WriterResponse {
                response_cond: 7,
                ..
            }
        ));
    }

    #[test]
    fn contact_parsing() {
        let (addr, id) =
            TcpNet::parse_contact(&ContactInfo("tcp://127.0.0.1:26500/42".into())).unwrap();
        assert_eq!(addr, "127.0.0.1:26500");
        assert_eq!(id, 42);
        assert!(TcpNet::parse_contact(&ContactInfo("inproc://1".into())).is_err());
    }
}
