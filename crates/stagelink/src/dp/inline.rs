// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Reference data plane: bulk reads carried over the control net.
//!
//! Each writer rank keeps its registered timestep blocks in a map and serves
//! `DpReadRequest` messages against them; the reader side correlates
//! `DpReadResponse` messages back to outstanding [`ReadHandle`]s by request
//! id. Not the fast path RDMA planes provide, but it works over any control
//! net and exercises the full asynchronous completion contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};

use crate::control::{ContactInfo, ControlConn, ControlEndpoint, ControlMsg, ControlNet, NetEvent};
use crate::dp::{read_pair, DpFactory, DpReader, DpWriter, ReadCompletion, ReadHandle};
use crate::error::{Error, Result};

/// Factory for the control-net-carried reference plane.
pub struct InlineDpFactory;

impl DpFactory for InlineDpFactory {
    fn name(&self) -> &'static str {
        "inline"
    }

    // Lowest useful priority: any plane with real hardware behind it should
    // outrank the reference implementation.
    fn priority(&self) -> i32 {
        1
    }

    fn make_writer(&self, net: &Arc<dyn ControlNet>) -> Result<Arc<dyn DpWriter>> {
        InlineDpWriter::new(net).map(|w| w as Arc<dyn DpWriter>)
    }

    fn make_reader(&self, net: &Arc<dyn ControlNet>) -> Result<Arc<dyn DpReader>> {
        InlineDpReader::new(net).map(|r| r as Arc<dyn DpReader>)
    }
}

// ============================================================================
// Writer side
// ============================================================================

struct WriterShared {
    blocks: DashMap<u64, Arc<Vec<u8>>>,
    conns: DashMap<ContactInfo, Arc<dyn ControlConn>>,
}

struct InlineDpWriter {
    ep: Arc<dyn ControlEndpoint>,
    shared: Arc<WriterShared>,
}

impl InlineDpWriter {
    fn new(net: &Arc<dyn ControlNet>) -> Result<Arc<Self>> {
        let shared = Arc::new(WriterShared {
            blocks: DashMap::new(),
            conns: DashMap::new(),
        });

        // The endpoint handler runs on the dispatcher thread and must reply
        // through it, so the endpoint is created first and wired to the
        // shared state, then stored.
        let ep_cell: Arc<parking_lot::Mutex<Option<Arc<dyn ControlEndpoint>>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let handler_shared = Arc::clone(&shared);
        let handler_ep = Arc::clone(&ep_cell);
        let ep = net.open_endpoint(Box::new(move |event| {
            if let NetEvent::Msg(ControlMsg::DpReadRequest {
                request_id,
                timestep,
                offset,
                length,
                reply_to,
            }) = event
            {
                let ep = match handler_ep.lock().clone() {
                    Some(ep) => ep,
                    None => return,
                };
                serve_read(
                    &handler_shared,
                    &ep,
                    request_id,
                    timestep,
                    offset,
                    length,
                    &reply_to,
                );
            }
        }))?;
        *ep_cell.lock() = Some(Arc::clone(&ep));

        Ok(Arc::new(Self { ep, shared }))
    }
}

fn serve_read(
    shared: &WriterShared,
    ep: &Arc<dyn ControlEndpoint>,
    request_id: u64,
    timestep: u64,
    offset: u64,
    length: u64,
    reply_to: &ContactInfo,
) {
    let outcome = match shared.blocks.get(&timestep) {
        Some(block) => {
            let start = offset as usize;
            let end = start.saturating_add(length as usize);
            if end <= block.len() {
                Some(block[start..end].to_vec())
            } else {
                warn!(
                    "[InlineDp::serve_read] range {}..{} outside block of {} bytes (timestep {})",
                    start,
                    end,
                    block.len(),
                    timestep
                );
                None
            }
        }
        None => {
            warn!("[InlineDp::serve_read] no block for timestep {}", timestep);
            None
        }
    };

    let conn = match shared.conns.get(reply_to) {
        Some(conn) => Arc::clone(&conn),
        None => match ep.connect(reply_to) {
            Ok(conn) => {
                shared.conns.insert(reply_to.clone(), Arc::clone(&conn));
                conn
            }
            Err(e) => {
                warn!("[InlineDp::serve_read] cannot reach {}: {}", reply_to, e);
                return;
            }
        },
    };

    let response = match outcome {
        Some(data) => ControlMsg::DpReadResponse {
            request_id,
            ok: true,
            data,
        },
        None => ControlMsg::DpReadResponse {
            request_id,
            ok: false,
            data: Vec::new(),
        },
    };
    if let Err(e) = conn.send(&response) {
        warn!("[InlineDp::serve_read] response to {} failed: {}", reply_to, e);
    }
}

impl DpWriter for InlineDpWriter {
    fn provide_timestep(&self, timestep: u64, data: Arc<Vec<u8>>) -> Result<Vec<u8>> {
        self.shared.blocks.insert(timestep, data);
        // Per-timestep contact info: where to send read requests.
        Ok(self.ep.contact().0.into_bytes())
    }

    fn release_timestep(&self, timestep: u64) {
        if self.shared.blocks.remove(&timestep).is_none() {
            debug!("[InlineDp::release_timestep] {} was not registered", timestep);
        }
    }

    fn shutdown(&self) {
        self.ep.close();
        self.shared.blocks.clear();
        self.shared.conns.clear();
    }
}

// ============================================================================
// Reader side
// ============================================================================

struct PendingRead {
    writer_rank: usize,
    completion: ReadCompletion,
}

struct InlineDpReader {
    ep: Arc<dyn ControlEndpoint>,
    pending: Arc<DashMap<u64, PendingRead>>,
    conns: DashMap<Vec<u8>, Arc<dyn ControlConn>>,
    next_request: AtomicU64,
}

impl InlineDpReader {
    fn new(net: &Arc<dyn ControlNet>) -> Result<Arc<Self>> {
        let pending: Arc<DashMap<u64, PendingRead>> = Arc::new(DashMap::new());
        let handler_pending = Arc::clone(&pending);
        let ep = net.open_endpoint(Box::new(move |event| {
            if let NetEvent::Msg(ControlMsg::DpReadResponse {
                request_id,
                ok,
                data,
            }) = event
            {
                match handler_pending.remove(&request_id) {
                    Some((_, read)) => {
                        let outcome = if ok {
                            Ok(data)
                        } else {
                            Err("writer rejected read request".to_string())
                        };
                        read.completion.fulfill(outcome);
                    }
                    None => debug!(
                        "[InlineDp] response for unknown request {} (already failed?)",
                        request_id
                    ),
                }
            }
        }))?;

        Ok(Arc::new(Self {
            ep,
            pending,
            conns: DashMap::new(),
            next_request: AtomicU64::new(1),
        }))
    }
}

impl DpReader for InlineDpReader {
    fn read_remote_memory(
        &self,
        writer_rank: usize,
        timestep: u64,
        offset: u64,
        length: u64,
        per_ts_info: &[u8],
    ) -> Result<ReadHandle> {
        let conn = match self.conns.get(per_ts_info) {
            Some(conn) => Arc::clone(&conn),
            None => {
                let contact = ContactInfo(
                    String::from_utf8(per_ts_info.to_vec())
                        .map_err(|_| Error::Codec("malformed data plane contact".into()))?,
                );
                let conn = self.ep.connect(&contact)?;
                self.conns.insert(per_ts_info.to_vec(), Arc::clone(&conn));
                conn
            }
        };

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (handle, completion) = read_pair();
        self.pending.insert(
            request_id,
            PendingRead {
                writer_rank,
                completion,
            },
        );

        let msg = ControlMsg::DpReadRequest {
            request_id,
            timestep,
            offset,
            length,
            reply_to: self.ep.contact(),
        };
        if let Err(e) = conn.send(&msg) {
            // The request never left; fail the handle instead of leaking it.
            if let Some((_, read)) = self.pending.remove(&request_id) {
                read.completion.fulfill(Err(format!("send failed: {}", e)));
            }
        }
        Ok(handle)
    }

    fn notify_conn_failure(&self, writer_rank: usize) {
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.writer_rank == writer_rank)
            .map(|entry| *entry.key())
            .collect();
        for request_id in stale {
            if let Some((_, read)) = self.pending.remove(&request_id) {
                read.completion
                    .fulfill(Err(format!("writer rank {} connection lost", writer_rank)));
            }
        }
    }

    fn shutdown(&self) {
        self.ep.close();
        self.conns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::InProcNet;
    use std::time::Duration;

    // The net must outlive the planes: dropping it joins the dispatcher
    // thread and all subsequent sends fail.
    fn planes() -> (Arc<dyn ControlNet>, Arc<dyn DpWriter>, Arc<dyn DpReader>) {
        let net: Arc<dyn ControlNet> = InProcNet::new();
        let factory = InlineDpFactory;
        let writer = factory.make_writer(&net).expect("writer plane");
        let reader = factory.make_reader(&net).expect("reader plane");
        (net, writer, reader)
    }

    #[test]
    fn whole_block_read_round_trips() {
        let (_net, writer, reader) = planes();
        let block: Vec<u8> = (0u8..100).collect();
        let info = writer
            .provide_timestep(3, Arc::new(block.clone()))
            .expect("register");

        let handle = reader
            .read_remote_memory(0, 3, 0, block.len() as u64, &info)
            .expect("issue read");
        assert_eq!(handle.wait(Some(Duration::from_secs(5))).unwrap(), block);
    }

    #[test]
    fn partial_range_read() {
        let (_net, writer, reader) = planes();
        let block: Vec<u8> = (0u8..64).collect();
        let info = writer.provide_timestep(0, Arc::new(block)).expect("register");

        let handle = reader
            .read_remote_memory(0, 0, 10, 4, &info)
            .expect("issue read");
        assert_eq!(
            handle.wait(Some(Duration::from_secs(5))).unwrap(),
            vec![10, 11, 12, 13]
        );
    }

    #[test]
    fn read_of_released_timestep_fails() {
        let (_net, writer, reader) = planes();
        let info = writer
            .provide_timestep(1, Arc::new(vec![1, 2, 3]))
            .expect("register");
        writer.release_timestep(1);

        let handle = reader
            .read_remote_memory(0, 1, 0, 3, &info)
            .expect("issue read");
        assert!(matches!(
            handle.wait(Some(Duration::from_secs(5))),
            Err(Error::ReadFailed(_))
        ));
    }

    #[test]
    fn out_of_range_read_fails() {
        let (_net, writer, reader) = planes();
        let info = writer
            .provide_timestep(1, Arc::new(vec![0; 16]))
            .expect("register");
        let handle = reader
            .read_remote_memory(0, 1, 8, 64, &info)
            .expect("issue read");
        assert!(matches!(
            handle.wait(Some(Duration::from_secs(5))),
            Err(Error::ReadFailed(_))
        ));
    }

    #[test]
    fn conn_failure_fails_outstanding_reads() {
        let (_net, writer, reader) = planes();
        let info = writer
            .provide_timestep(2, Arc::new(vec![0; 8]))
            .expect("register");
        // Shut the writer plane down so no response will ever come, then
        // fail the rank.
        writer.shutdown();
        let handle = reader
            .read_remote_memory(5, 2, 0, 8, &info)
            .map(Some)
            .unwrap_or(None);
        reader.notify_conn_failure(5);
        if let Some(handle) = handle {
            assert!(handle.wait(Some(Duration::from_secs(5))).is_err());
        }
    }
}
