// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Writer-side stream: rendezvous publication, reader cohort admission,
//! timestep queueing and announcement, reference-count driven reclamation.
//!
//! Every rank of the writer cohort holds one `WriterStream`. Methods that
//! touch cross-rank state (`open`, `close_timestep`, `close`) are collective
//! and must be called by every rank in the same order; the `put_*` staging
//! calls are local.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::cohort::Cohort;
use crate::config::{QueueFullPolicy, StreamParams};
use crate::control::msg::{ControlMsg, FormatBlock, WriterConfig};
use crate::control::wire::{WireReader, WireWriter};
use crate::control::{ContactInfo, ControlConn, ControlEndpoint, ControlNet, NetEvent};
use crate::cp::peer::peer_slice;
use crate::cp::queue::{ReleaseOutcome, StepAggregate, WriterQueue};
use crate::cp::StreamStatus;
use crate::dp::{DpFactory, DpWriter};
use crate::error::{Error, Result};
use crate::marshal::{MarshalWriter, VarType};
use crate::rendezvous::{ContactLine, Rendezvous};
use crate::stats::StreamStats;

/// Condvar wait quantum inside collective poll loops.
const SYNC_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReaderPhase {
    Opening,
    Established,
    Closed,
    Failed,
}

struct PendingReg {
    response_cond: u64,
    contacts: Vec<ContactInfo>,
}

struct ReaderRecord {
    contacts: Vec<ContactInfo>,
    /// Connections to this rank's slice of the reader cohort.
    conns: Vec<Arc<dyn ControlConn>>,
    phase: ReaderPhase,
    activated: bool,
}

struct WriterState {
    status: StreamStatus,
    token: u64,
    next_step: u64,
    /// One past the highest announced timestep. A discarded-incoming step
    /// advances `next_step` but not this; the close notice must promise only
    /// steps that were actually announced.
    announced: u64,
    marshal: MarshalWriter,
    queue: WriterQueue,
    readers: HashMap<u64, ReaderRecord>,
    /// Registrations received by rank 0, awaiting collective admission.
    pending_regs: Vec<PendingReg>,
    /// Reader failures observed locally, awaiting cohort-wide application.
    observed_failures: Vec<u64>,
    /// Format blocks from discarded steps, carried into the next announced
    /// one.
    format_backlog: Vec<FormatBlock>,
    /// Every format block ever announced, replayed to late joiners.
    all_formats: Vec<FormatBlock>,
    next_reader_id: u64,
    stats: StreamStats,
}

struct Inner {
    state: Mutex<WriterState>,
    cv: Condvar,
}

/// One writer rank's half of a stream.
pub struct WriterStream {
    cohort: Arc<dyn Cohort>,
    params: StreamParams,
    ep: Arc<dyn ControlEndpoint>,
    dp: Arc<dyn DpWriter>,
    /// Rank 0 only.
    rendezvous: Option<Rendezvous>,
    inner: Arc<Inner>,
    writer_contacts: Vec<ContactInfo>,
    config: WriterConfig,
    opened_at: Instant,
}

fn handle_event(inner: &Inner, dp: &Arc<dyn DpWriter>, event: NetEvent) {
    match event {
        NetEvent::Msg(ControlMsg::ReaderRegister {
            writer_token,
            response_cond,
            reader_cohort,
        }) => {
            let mut st = inner.state.lock();
            if writer_token != st.token {
                warn!(
                    "[WriterStream] registration with stale token {:x} ignored",
                    writer_token
                );
                return;
            }
            st.pending_regs.push(PendingReg {
                response_cond,
                contacts: reader_cohort,
            });
            inner.cv.notify_all();
        }
        NetEvent::Msg(ControlMsg::ReaderActivate { reader_id }) => {
            let mut st = inner.state.lock();
            match st.readers.get_mut(&reader_id) {
                Some(rec) => rec.activated = true,
                None => warn!("[WriterStream] activate from unknown reader {}", reader_id),
            }
            inner.cv.notify_all();
        }
        NetEvent::Msg(ControlMsg::ReleaseTimestep { reader_id, timestep }) => {
            let mut st = inner.state.lock();
            if st.readers.get(&reader_id).map(|r| r.phase) != Some(ReaderPhase::Established) {
                debug!(
                    "[WriterStream] release of {} from inactive reader {} ignored",
                    timestep, reader_id
                );
                return;
            }
            if st.queue.release(timestep, reader_id) == ReleaseOutcome::Emptied {
                dp.release_timestep(timestep);
            }
            inner.cv.notify_all();
        }
        NetEvent::Msg(ControlMsg::ReaderClose { reader_id }) => {
            let mut st = inner.state.lock();
            let phase = st.readers.get(&reader_id).map(|r| r.phase);
            if matches!(phase, Some(ReaderPhase::Opening | ReaderPhase::Established)) {
                if let Some(rec) = st.readers.get_mut(&reader_id) {
                    rec.phase = ReaderPhase::Closed;
                    rec.conns.clear();
                }
                for ts in st.queue.drop_reader(reader_id) {
                    dp.release_timestep(ts);
                }
                info!("[WriterStream] reader cohort {} departed", reader_id);
            }
            inner.cv.notify_all();
        }
        NetEvent::Msg(_) => {
            debug!("[WriterStream] ignoring control message not addressed to a writer");
        }
        NetEvent::PeerDown(contact) => {
            let mut st = inner.state.lock();
            let lost: Vec<u64> = st
                .readers
                .iter()
                .filter(|(_, r)| {
                    matches!(r.phase, ReaderPhase::Opening | ReaderPhase::Established)
                        && r.contacts.contains(&contact)
                })
                .map(|(&id, _)| id)
                .collect();
            for id in lost {
                warn!("[WriterStream] reader cohort {} lost ({})", id, contact);
                if let Some(rec) = st.readers.get_mut(&id) {
                    rec.phase = ReaderPhase::Failed;
                    rec.conns.clear();
                }
                for ts in st.queue.drop_reader(id) {
                    dp.release_timestep(ts);
                }
                st.observed_failures.push(id);
            }
            inner.cv.notify_all();
        }
    }
}

impl WriterStream {
    /// Open a stream for writing. Collective over the writer cohort; rank 0
    /// publishes the contact line and blocks (with every other rank) until
    /// `rendezvous_reader_count` reader cohorts are established.
    pub(crate) fn open(
        net: &Arc<dyn ControlNet>,
        dp_factory: &Arc<dyn DpFactory>,
        cohort: Arc<dyn Cohort>,
        name: &str,
        params: StreamParams,
    ) -> Result<Self> {
        let opened_at = Instant::now();
        let dp = dp_factory.make_writer(net)?;
        let inner = Arc::new(Inner {
            state: Mutex::new(WriterState {
                status: StreamStatus::NotOpen,
                token: 0,
                next_step: 0,
                announced: 0,
                marshal: MarshalWriter::new(),
                queue: WriterQueue::new(),
                readers: HashMap::new(),
                pending_regs: Vec::new(),
                observed_failures: Vec::new(),
                format_backlog: Vec::new(),
                all_formats: Vec::new(),
                next_reader_id: 1,
                stats: StreamStats::default(),
            }),
            cv: Condvar::new(),
        });
        let handler_inner = Arc::clone(&inner);
        let handler_dp = Arc::clone(&dp);
        let ep = net.open_endpoint(Box::new(move |event| {
            handle_event(&handler_inner, &handler_dp, event);
        }))?;

        let writer_contacts = gather_contacts(&cohort, &ep)?;
        let token = broadcast_u64(
            &cohort,
            0,
            if cohort.rank() == 0 { fastrand::u64(1..) } else { 0 },
        );
        {
            let mut st = inner.state.lock();
            st.token = token;
            st.status = StreamStatus::Established;
        }

        let rendezvous = (cohort.rank() == 0).then(|| Rendezvous::from_params(name, &params));
        if let Some(rdv) = &rendezvous {
            rdv.publish(&ContactLine {
                token,
                contact: ep.contact(),
            })?;
            info!(
                "[WriterStream::open] stream {} published (token {:x}, {} ranks)",
                name,
                token,
                cohort.size()
            );
        }
        // No rank proceeds before the contact line is out.
        cohort.barrier();

        let config = WriterConfig {
            queue_limit: params.queue_limit as u64,
            discard_on_full: params.queue_full_policy == QueueFullPolicy::Discard,
        };
        let stream = Self {
            cohort,
            params,
            ep,
            dp,
            rendezvous,
            inner,
            writer_contacts,
            config,
            opened_at,
        };

        let deadline = opened_at + stream.params.open_timeout;
        while stream.established_readers() < stream.params.rendezvous_reader_count {
            stream.service_pending_joins()?;
            if stream.established_readers() >= stream.params.rendezvous_reader_count {
                break;
            }
            // Rank 0's clock decides the timeout for everyone.
            let give_up = broadcast_u64(
                &stream.cohort,
                0,
                u64::from(Instant::now() >= deadline),
            ) != 0;
            if give_up {
                return Err(Error::Timeout);
            }
            if stream.cohort.rank() == 0 {
                let mut st = stream.inner.state.lock();
                if st.pending_regs.is_empty() {
                    stream.inner.cv.wait_for(&mut st, SYNC_WAIT);
                }
            }
        }

        stream.inner.state.lock().stats.open_duration = opened_at.elapsed();
        Ok(stream)
    }

    /// Stage one array block for the current timestep. Local; the payload is
    /// copied, so the caller's buffer is reusable on return.
    pub fn put_array(
        &mut self,
        name: &str,
        vtype: VarType,
        shape: &[u64],
        start: &[u64],
        count: &[u64],
        payload: &[u8],
    ) -> Result<()> {
        let mut st = self.inner.state.lock();
        ensure_established(&st)?;
        st.marshal.put_array(name, vtype, shape, start, count, payload)
    }

    /// Stage one scalar for the current timestep. Local.
    pub fn put_scalar(&mut self, name: &str, vtype: VarType, value: &[u8]) -> Result<()> {
        let mut st = self.inner.state.lock();
        ensure_established(&st)?;
        st.marshal.put_scalar(name, vtype, value)
    }

    /// The timestep number the next `close_timestep` will publish.
    pub fn current_step(&self) -> u64 {
        self.inner.state.lock().next_step
    }

    pub fn status(&self) -> StreamStatus {
        self.inner.state.lock().status
    }

    /// Seal the staged puts into a timestep and announce it to every
    /// established reader cohort. Collective.
    pub fn close_timestep(&mut self) -> Result<u64> {
        let (ts, closed) = {
            let mut st = self.inner.state.lock();
            ensure_established(&st)?;
            let ts = st.next_step;
            (ts, st.marshal.close_step())
        };

        if self.params.queue_limit > 0 {
            loop {
                let (max_len, _) = self.sync_cohort();
                if (max_len as usize) < self.params.queue_limit {
                    break;
                }
                match self.params.queue_full_policy {
                    QueueFullPolicy::Discard => {
                        // Never-announced steps are identical on every rank,
                        // so this choice is cohort-consistent without another
                        // round of agreement.
                        let evicted = self.inner.state.lock().queue.evict_oldest_unheld();
                        match evicted {
                            Some(old) => {
                                self.dp.release_timestep(old);
                                let mut st = self.inner.state.lock();
                                st.stats.timesteps_discarded += 1;
                                warn!(
                                    "[WriterStream::close_timestep] discarded queued timestep {}",
                                    old
                                );
                            }
                            None => {
                                // Every queued step is held by a reader; drop
                                // the incoming one instead. Its format
                                // announcements must survive into the next
                                // published step.
                                let mut st = self.inner.state.lock();
                                st.format_backlog.extend(closed.new_formats);
                                st.stats.timesteps_discarded += 1;
                                st.next_step = ts + 1;
                                warn!(
                                    "[WriterStream::close_timestep] discarded timestep {} (queue full)",
                                    ts
                                );
                                return Ok(ts);
                            }
                        }
                        break;
                    }
                    QueueFullPolicy::Block => {
                        // A cohort registering mid-wait must still be
                        // admitted; its releases are what drain the queue.
                        self.service_pending_joins()?;
                        let mut st = self.inner.state.lock();
                        self.inner.cv.wait_for(&mut st, SYNC_WAIT);
                    }
                }
            }
        } else {
            // Unlimited queue still reconciles reader failures at step
            // boundaries.
            self.sync_cohort();
        }

        // The data plane must be able to serve the block before any reader
        // learns the step exists.
        let data = Arc::new(closed.data);
        let data_len = data.len() as u64;
        let dp_info = self.dp.provide_timestep(ts, Arc::clone(&data))?;

        let my_formats: Vec<FormatBlock> = {
            let mut st = self.inner.state.lock();
            let mut f = std::mem::take(&mut st.format_backlog);
            f.extend(closed.new_formats);
            f
        };
        let blob = {
            let mut w = WireWriter::new();
            w.put_block(&closed.metadata);
            w.put_block(&dp_info);
            w.put_u32(my_formats.len() as u32);
            for fb in &my_formats {
                w.put_bytes(&fb.hash);
                w.put_block(&fb.body);
            }
            w.into_vec()
        };
        let gathered = self.cohort.allgather(blob);

        let mut metadata = Vec::with_capacity(gathered.len());
        let mut dp_infos = Vec::with_capacity(gathered.len());
        let mut formats = Vec::new();
        let mut seen: HashSet<[u8; 16]> = self
            .inner
            .state
            .lock()
            .all_formats
            .iter()
            .map(|f| f.hash)
            .collect();
        for bytes in &gathered {
            let mut r = WireReader::new(bytes);
            metadata.push(r.read_block()?);
            dp_infos.push(r.read_block()?);
            let n = r.read_u32()?;
            for _ in 0..n {
                let mut hash = [0u8; 16];
                hash.copy_from_slice(r.read_bytes(16)?);
                let body = r.read_block()?;
                if seen.insert(hash) {
                    formats.push(FormatBlock { hash, body });
                }
            }
        }

        let agg = Arc::new(StepAggregate {
            metadata,
            dp_info: dp_infos,
            formats,
        });
        let targets: Vec<(u64, Vec<Arc<dyn ControlConn>>)> = {
            let mut st = self.inner.state.lock();
            st.all_formats.extend(agg.formats.iter().cloned());
            let holders: HashSet<u64> = st
                .readers
                .iter()
                .filter(|(_, r)| r.phase == ReaderPhase::Established)
                .map(|(&id, _)| id)
                .collect();
            st.queue.insert(ts, Arc::clone(&agg), data, holders);
            st.stats.timesteps += 1;
            st.stats.bytes_transferred += data_len;
            st.next_step = ts + 1;
            st.announced = ts + 1;
            st.readers
                .iter()
                .filter(|(_, r)| r.phase == ReaderPhase::Established)
                .map(|(&id, r)| (id, r.conns.clone()))
                .collect()
        };

        let msg = ControlMsg::TimestepMetadata {
            timestep: ts,
            metadata: agg.metadata.clone(),
            dp_info: agg.dp_info.clone(),
            formats: agg.formats.clone(),
        };
        let n_targets = targets.len();
        for (id, conns) in targets {
            for conn in conns {
                if let Err(e) = conn.send(&msg) {
                    warn!(
                        "[WriterStream::close_timestep] announce to reader {} failed: {}",
                        id, e
                    );
                    self.inner.state.lock().observed_failures.push(id);
                }
            }
        }
        debug!(
            "[WriterStream::close_timestep] timestep {} announced to {} cohorts",
            ts, n_targets
        );

        // Admit anyone who registered while the step was being built.
        self.service_pending_joins()?;
        Ok(ts)
    }

    /// Close the stream: announce the final timestep, wait for readers to
    /// drain the queue, reclaim what remains. Collective.
    pub fn close(&mut self) -> Result<StreamStats> {
        let close_start = Instant::now();
        {
            let mut st = self.inner.state.lock();
            ensure_established(&st)?;
            st.stats.valid_duration = self.opened_at.elapsed() - st.stats.open_duration;
        }

        // Last chance for cohorts that registered but were never admitted.
        self.service_pending_joins()?;

        let (final_timestep, targets) = {
            let st = self.inner.state.lock();
            let targets: Vec<(u64, Vec<Arc<dyn ControlConn>>)> = st
                .readers
                .iter()
                .filter(|(_, r)| r.phase == ReaderPhase::Established)
                .map(|(&id, r)| (id, r.conns.clone()))
                .collect();
            // `announced`, not `next_step`: a reader waiting for a step that
            // was discarded before announcement would otherwise never see the
            // end of the stream.
            (st.announced, targets)
        };
        let msg = ControlMsg::WriterClose { final_timestep };
        for (id, conns) in targets {
            for conn in conns {
                if let Err(e) = conn.send(&msg) {
                    warn!("[WriterStream::close] close notice to reader {} failed: {}", id, e);
                    self.inner.state.lock().observed_failures.push(id);
                }
            }
        }

        let deadline = self.params.close_timeout.map(|t| Instant::now() + t);
        loop {
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            let give_up = broadcast_u64(&self.cohort, 0, u64::from(expired)) != 0;
            let (_, max_held) = self.sync_cohort();
            if max_held == 0 {
                break;
            }
            if give_up {
                warn!(
                    "[WriterStream::close] drain timed out with {} held steps",
                    max_held
                );
                break;
            }
            let mut st = self.inner.state.lock();
            self.inner.cv.wait_for(&mut st, SYNC_WAIT);
        }

        {
            let mut st = self.inner.state.lock();
            for ts in st.queue.clear() {
                self.dp.release_timestep(ts);
            }
            st.status = StreamStatus::Closed;
        }
        if let Some(rdv) = &self.rendezvous {
            rdv.unpublish();
        }
        self.dp.shutdown();
        self.ep.close();
        self.cohort.barrier();

        let stats = {
            let mut st = self.inner.state.lock();
            st.stats.close_duration = close_start.elapsed();
            st.stats.clone()
        };
        info!(
            "[WriterStream::close] closed after {} timesteps ({} discarded)",
            stats.timesteps, stats.timesteps_discarded
        );
        Ok(stats)
    }

    // ------------------------------------------------------------------------
    // Reader cohort admission
    // ------------------------------------------------------------------------

    /// Admit every reader cohort rank 0 has queued registrations for.
    /// Collective; every rank must call this at the same point.
    fn service_pending_joins(&self) -> Result<usize> {
        let regs: Vec<PendingReg> = if self.cohort.rank() == 0 {
            std::mem::take(&mut self.inner.state.lock().pending_regs)
        } else {
            Vec::new()
        };
        let count = broadcast_u64(&self.cohort, 0, regs.len() as u64) as usize;

        let mut joined = 0;
        for i in 0..count {
            let blob = if self.cohort.rank() == 0 {
                let reader_id = {
                    let mut st = self.inner.state.lock();
                    let id = st.next_reader_id;
                    st.next_reader_id += 1;
                    id
                };
                let mut w = WireWriter::new();
                w.put_u64(reader_id);
                w.put_u32(regs[i].contacts.len() as u32);
                for c in &regs[i].contacts {
                    w.put_str(&c.0);
                }
                Some(w.into_vec())
            } else {
                None
            };
            let blob = self.cohort.broadcast(0, blob);
            let mut r = WireReader::new(&blob);
            let reader_id = r.read_u64()?;
            let n = r.read_u32()? as usize;
            let mut contacts = Vec::with_capacity(n);
            for _ in 0..n {
                contacts.push(ContactInfo(r.read_str()?));
            }

            let response_cond = (self.cohort.rank() == 0).then(|| regs[i].response_cond);
            if self.admit_reader(reader_id, contacts, response_cond)? {
                joined += 1;
            }
        }
        Ok(joined)
    }

    /// One cohort's admission: connect, pick a starting step, respond,
    /// replay, wait for activation. Collective.
    fn admit_reader(
        &self,
        reader_id: u64,
        contacts: Vec<ContactInfo>,
        response_cond: Option<u64>,
    ) -> Result<bool> {
        let slice = peer_slice(self.cohort.rank(), self.cohort.size(), contacts.len());
        let mut conns = Vec::with_capacity(slice.len());
        let mut reachable = true;
        for peer in slice.clone() {
            match self.ep.connect(&contacts[peer]) {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    warn!(
                        "[WriterStream::admit_reader] cannot reach reader rank {}: {}",
                        peer, e
                    );
                    reachable = false;
                    break;
                }
            }
        }
        // Every rank must agree the cohort is reachable before announcing it.
        if self.cohort.allreduce_max(u64::from(!reachable)) != 0 {
            info!("[WriterStream::admit_reader] reader cohort {} abandoned", reader_id);
            return Ok(false);
        }

        // The oldest step every rank can still serve in full. Releases
        // arrive in timestep order, so each rank's queue has no holes above
        // its oldest entry.
        let local = {
            let st = self.inner.state.lock();
            st.queue.oldest().unwrap_or(st.next_step)
        };
        let start_step = self.cohort.allreduce_max(local);

        {
            let mut st = self.inner.state.lock();
            st.readers.insert(
                reader_id,
                ReaderRecord {
                    contacts,
                    conns: conns.clone(),
                    phase: ReaderPhase::Opening,
                    activated: false,
                },
            );
        }

        if let Some(response_cond) = response_cond {
            let (formats, reader0) = {
                let st = self.inner.state.lock();
                (
                    st.all_formats.clone(),
                    st.readers[&reader_id].contacts[0].clone(),
                )
            };
            let response = ControlMsg::WriterResponse {
                response_cond,
                reader_id,
                writer_cohort: self.writer_contacts.clone(),
                start_step,
                config: self.config,
                formats,
            };
            // A failure here must not desync the cohort; the activation wait
            // below will time out and the join is abandoned collectively.
            let outcome = if slice.contains(&0) {
                conns[0].send(&response)
            } else {
                self.ep
                    .connect(&reader0)
                    .and_then(|conn| conn.send(&response))
            };
            if let Err(e) = outcome {
                warn!(
                    "[WriterStream::admit_reader] response to reader {} failed: {}",
                    reader_id, e
                );
            }
        }

        // Replay queued steps from the starting step; the joiner becomes a
        // holder of each.
        let replay: Vec<(u64, Arc<StepAggregate>)> = {
            let mut st = self.inner.state.lock();
            let steps: Vec<(u64, Arc<StepAggregate>)> = st.queue.steps_from(start_step).collect();
            for (ts, _) in &steps {
                st.queue.add_holder(*ts, reader_id);
            }
            steps
        };
        for (ts, agg) in replay {
            let msg = ControlMsg::TimestepMetadata {
                timestep: ts,
                metadata: agg.metadata.clone(),
                dp_info: agg.dp_info.clone(),
                formats: agg.formats.clone(),
            };
            for conn in &conns {
                // A send failure here surfaces as PeerDown.
                let _ = conn.send(&msg);
            }
        }

        self.dp.init_per_reader(reader_id);

        // Each reader rank activates its slice of the writer cohort, so
        // every writer rank waits for exactly one activate.
        let activated = {
            let deadline = Instant::now() + self.params.open_timeout;
            let mut st = self.inner.state.lock();
            loop {
                match st.readers.get(&reader_id) {
                    Some(rec) if rec.activated => break true,
                    Some(rec) if rec.phase == ReaderPhase::Failed => break false,
                    None => break false,
                    _ => {}
                }
                if Instant::now() >= deadline {
                    break false;
                }
                self.inner.cv.wait_for(&mut st, SYNC_WAIT);
            }
        };
        let all_active = self.cohort.allreduce_max(u64::from(!activated)) == 0;

        let mut st = self.inner.state.lock();
        if all_active {
            if let Some(rec) = st.readers.get_mut(&reader_id) {
                rec.phase = ReaderPhase::Established;
            }
            info!(
                "[WriterStream::admit_reader] reader cohort {} established from step {}",
                reader_id, start_step
            );
        } else {
            if let Some(rec) = st.readers.get_mut(&reader_id) {
                rec.phase = ReaderPhase::Failed;
                rec.conns.clear();
            }
            for ts in st.queue.drop_reader(reader_id) {
                self.dp.release_timestep(ts);
            }
            warn!(
                "[WriterStream::admit_reader] reader cohort {} failed to activate",
                reader_id
            );
        }
        Ok(all_active)
    }

    // ------------------------------------------------------------------------
    // Cohort synchronization
    // ------------------------------------------------------------------------

    /// Exchange queue occupancy and locally-observed reader failures.
    /// Returns (max queue length, max held-step count) across the cohort.
    fn sync_cohort(&self) -> (u64, u64) {
        let blob = {
            let mut st = self.inner.state.lock();
            let failed = std::mem::take(&mut st.observed_failures);
            let mut w = WireWriter::new();
            w.put_u32(st.queue.len() as u32);
            w.put_u32(st.queue.held_count() as u32);
            w.put_u32(failed.len() as u32);
            for id in failed {
                w.put_u64(id);
            }
            w.into_vec()
        };
        let gathered = self.cohort.allgather(blob);

        let mut max_len = 0u64;
        let mut max_held = 0u64;
        let mut failed_union = Vec::new();
        for bytes in &gathered {
            let mut r = WireReader::new(bytes);
            let (Ok(len), Ok(held), Ok(n)) = (r.read_u32(), r.read_u32(), r.read_u32()) else {
                continue;
            };
            max_len = max_len.max(u64::from(len));
            max_held = max_held.max(u64::from(held));
            for _ in 0..n {
                if let Ok(id) = r.read_u64() {
                    failed_union.push(id);
                }
            }
        }

        if !failed_union.is_empty() {
            let mut st = self.inner.state.lock();
            for id in failed_union {
                let phase = st.readers.get(&id).map(|r| r.phase);
                if matches!(phase, Some(ReaderPhase::Opening | ReaderPhase::Established)) {
                    warn!("[WriterStream] reader cohort {} failed cohort-wide", id);
                    if let Some(rec) = st.readers.get_mut(&id) {
                        rec.phase = ReaderPhase::Failed;
                        rec.conns.clear();
                    }
                    for ts in st.queue.drop_reader(id) {
                        self.dp.release_timestep(ts);
                    }
                }
            }
        }
        (max_len, max_held)
    }

    fn established_readers(&self) -> usize {
        self.inner
            .state
            .lock()
            .readers
            .values()
            .filter(|r| r.phase == ReaderPhase::Established)
            .count()
    }
}

impl Drop for WriterStream {
    fn drop(&mut self) {
        let status = self.inner.state.lock().status;
        if status == StreamStatus::Established {
            warn!("[WriterStream] dropped without close; queued timesteps are lost");
            self.dp.shutdown();
            self.ep.close();
        }
    }
}

fn ensure_established(st: &WriterState) -> Result<()> {
    if st.status == StreamStatus::Established {
        Ok(())
    } else {
        Err(Error::InvalidState(format!("stream is {:?}", st.status)))
    }
}

pub(crate) fn gather_contacts(
    cohort: &Arc<dyn Cohort>,
    ep: &Arc<dyn ControlEndpoint>,
) -> Result<Vec<ContactInfo>> {
    cohort
        .allgather(ep.contact().0.into_bytes())
        .into_iter()
        .map(|bytes| {
            String::from_utf8(bytes)
                .map(ContactInfo)
                .map_err(|_| Error::Codec("contact exchange produced invalid UTF-8".into()))
        })
        .collect()
}

pub(crate) fn broadcast_u64(cohort: &Arc<dyn Cohort>, root: usize, value: u64) -> u64 {
    let payload = (cohort.rank() == root).then(|| value.to_le_bytes().to_vec());
    let bytes = cohort.broadcast(root, payload);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}
