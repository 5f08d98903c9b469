// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Reader-side stream: rendezvous lookup, registration, ordered timestep
//! consumption and deferred remote reads.
//!
//! Every rank of the reader cohort holds one `ReaderStream`. `open`,
//! `release_step` and `close` are collective; `advance_step` is collective
//! only in `LatestAvailable` mode. The get/perform calls are local.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::cohort::Cohort;
use crate::config::StreamParams;
use crate::control::msg::{ControlMsg, FormatBlock, WriterConfig};
use crate::control::wire::{WireReader, WireWriter};
use crate::control::{ContactInfo, ControlConn, ControlEndpoint, ControlNet, NetEvent};
use crate::cp::peer::peer_slice;
use crate::cp::writer::gather_contacts;
use crate::cp::{StepMode, StepStatus, StreamStatus};
use crate::dp::{DpFactory, DpReader, ReadHandle};
use crate::error::{Error, Result};
use crate::marshal::selection::{extract_into, overlaps};
use crate::marshal::{MarshalReader, Selection, VarType};
use crate::rendezvous::Rendezvous;
use crate::stats::StreamStats;

const SYNC_WAIT: Duration = Duration::from_millis(50);

/// Handle for one deferred get, resolved by `perform_gets`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GetToken(u64);

/// One completed get: the selection's data, row-major in selection shape.
pub struct GetResult {
    pub token: GetToken,
    pub data: Vec<u8>,
}

struct DeferredGet {
    token: GetToken,
    name: String,
    sel: Selection,
}

/// One announced-but-not-yet-consumed timestep.
struct PendingStep {
    metadata: Vec<Vec<u8>>,
    dp_info: Vec<Vec<u8>>,
    formats: Vec<FormatBlock>,
}

/// Decoded `WriterResponse`, parked by the handler for rank 0's open.
struct Registration {
    reader_id: u64,
    writer_cohort: Vec<ContactInfo>,
    start_step: u64,
    config: WriterConfig,
    formats: Vec<FormatBlock>,
}

struct ReaderState {
    status: StreamStatus,
    steps: BTreeMap<u64, PendingStep>,
    /// Next timestep to deliver; everything below is consumed or skipped.
    next_expect: u64,
    current: Option<u64>,
    current_dp_info: Vec<Vec<u8>>,
    final_step: Option<u64>,
    marshal: MarshalReader,
    deferred: Vec<DeferredGet>,
    next_token: u64,
    /// Rank 0 open handshake.
    expected_cond: Option<u64>,
    registration: Option<Registration>,
    writer_contacts: Vec<ContactInfo>,
    stats: StreamStats,
}

struct Inner {
    state: Mutex<ReaderState>,
    cv: Condvar,
}

/// One reader rank's half of a stream.
pub struct ReaderStream {
    cohort: Arc<dyn Cohort>,
    ep: Arc<dyn ControlEndpoint>,
    dp: Arc<dyn DpReader>,
    inner: Arc<Inner>,
    reader_id: u64,
    config: WriterConfig,
    writer_size: usize,
    /// Connections to this rank's slice of the writer cohort.
    conns: Vec<Arc<dyn ControlConn>>,
    opened_at: Instant,
}

fn handle_event(inner: &Inner, dp: &Arc<dyn DpReader>, event: NetEvent) {
    match event {
        NetEvent::Msg(ControlMsg::TimestepMetadata {
            timestep,
            metadata,
            dp_info,
            formats,
        }) => {
            let mut st = inner.state.lock();
            if st.status == StreamStatus::Established && timestep < st.next_expect {
                debug!("[ReaderStream] duplicate timestep {} ignored", timestep);
                return;
            }
            st.steps.insert(
                timestep,
                PendingStep {
                    metadata,
                    dp_info,
                    formats,
                },
            );
            inner.cv.notify_all();
        }
        NetEvent::Msg(ControlMsg::WriterClose { final_timestep }) => {
            let mut st = inner.state.lock();
            st.final_step = Some(final_timestep);
            if st.status == StreamStatus::Established {
                st.status = StreamStatus::PeerClosed;
            }
            info!(
                "[ReaderStream] writer closed; final timestep is {}",
                final_timestep
            );
            inner.cv.notify_all();
        }
        NetEvent::Msg(ControlMsg::WriterResponse {
            response_cond,
            reader_id,
            writer_cohort,
            start_step,
            config,
            formats,
        }) => {
            let mut st = inner.state.lock();
            if st.expected_cond == Some(response_cond) {
                st.expected_cond = None;
                st.registration = Some(Registration {
                    reader_id,
                    writer_cohort,
                    start_step,
                    config,
                    formats,
                });
                inner.cv.notify_all();
            } else {
                warn!("[ReaderStream] unsolicited writer response ignored");
            }
        }
        NetEvent::Msg(_) => {
            debug!("[ReaderStream] ignoring control message not addressed to a reader");
        }
        NetEvent::PeerDown(contact) => {
            let mut st = inner.state.lock();
            // An orderly close tears connections down too; only an
            // unannounced loss is a failure.
            if matches!(st.status, StreamStatus::PeerClosed | StreamStatus::Closed) {
                return;
            }
            if let Some(rank) = st.writer_contacts.iter().position(|c| c == &contact) {
                warn!("[ReaderStream] writer rank {} lost ({})", rank, contact);
                st.status = StreamStatus::PeerFailed;
                dp.notify_conn_failure(rank);
                inner.cv.notify_all();
            }
        }
    }
}

enum Wakeup {
    Available,
    EndOfStream,
    Fatal,
    TimedOut,
}

impl ReaderStream {
    /// Open a stream for reading. Collective over the reader cohort; rank 0
    /// performs the rendezvous and registration, then the whole cohort
    /// connects and activates.
    pub(crate) fn open(
        net: &Arc<dyn ControlNet>,
        dp_factory: &Arc<dyn DpFactory>,
        cohort: Arc<dyn Cohort>,
        name: &str,
        params: StreamParams,
    ) -> Result<Self> {
        let opened_at = Instant::now();
        let dp = dp_factory.make_reader(net)?;
        let inner = Arc::new(Inner {
            state: Mutex::new(ReaderState {
                status: StreamStatus::NotOpen,
                steps: BTreeMap::new(),
                next_expect: 0,
                current: None,
                current_dp_info: Vec::new(),
                final_step: None,
                marshal: MarshalReader::new(0),
                deferred: Vec::new(),
                next_token: 1,
                expected_cond: None,
                registration: None,
                writer_contacts: Vec::new(),
                stats: StreamStats::default(),
            }),
            cv: Condvar::new(),
        });
        let handler_inner = Arc::clone(&inner);
        let handler_dp = Arc::clone(&dp);
        let ep = net.open_endpoint(Box::new(move |event| {
            handle_event(&handler_inner, &handler_dp, event);
        }))?;

        let my_contacts = gather_contacts(&cohort, &ep)?;

        // Rank 0 registers; success or failure is shared with the cohort
        // before anyone proceeds, so a failed rendezvous fails everywhere.
        let (blob, rank0_err) = if cohort.rank() == 0 {
            match register(&inner, &ep, name, &params, my_contacts) {
                Ok(blob) => (Some(blob), None),
                Err(e) => (Some(Vec::new()), Some(e)),
            }
        } else {
            (None, None)
        };
        let blob = cohort.broadcast(0, blob);
        if let Some(e) = rank0_err {
            return Err(e);
        }
        if blob.is_empty() {
            return Err(Error::RendezvousFailed(
                "writer registration failed on rank 0".into(),
            ));
        }
        let reg = decode_registration(&blob)?;
        let writer_size = reg.writer_cohort.len();

        {
            let mut st = inner.state.lock();
            let mut marshal = MarshalReader::new(writer_size);
            marshal.add_formats(&reg.formats)?;
            st.marshal = marshal;
            st.next_expect = reg.start_step;
            st.steps = st.steps.split_off(&reg.start_step);
            st.writer_contacts = reg.writer_cohort.clone();
            st.status = StreamStatus::Established;
        }

        // Connect this rank's writer slice and activate. All ranks must
        // succeed or the whole cohort abandons the open.
        let slice = peer_slice(cohort.rank(), cohort.size(), writer_size);
        let mut conns = Vec::with_capacity(slice.len());
        let mut ok = true;
        for w in slice {
            match ep.connect(&reg.writer_cohort[w]) {
                Ok(conn) => {
                    if let Err(e) = conn.send(&ControlMsg::ReaderActivate {
                        reader_id: reg.reader_id,
                    }) {
                        warn!("[ReaderStream::open] activate of writer rank {} failed: {}", w, e);
                        ok = false;
                        break;
                    }
                    conns.push(conn);
                }
                Err(e) => {
                    warn!("[ReaderStream::open] cannot reach writer rank {}: {}", w, e);
                    ok = false;
                    break;
                }
            }
        }
        if cohort.allreduce_max(u64::from(!ok)) != 0 {
            dp.shutdown();
            ep.close();
            return Err(Error::ConnectFailed("writer cohort unreachable".into()));
        }

        inner.state.lock().stats.open_duration = opened_at.elapsed();
        cohort.barrier();
        info!(
            "[ReaderStream::open] joined stream {} as reader {} from step {}",
            name, reg.reader_id, reg.start_step
        );
        Ok(Self {
            cohort,
            ep,
            dp,
            inner,
            reader_id: reg.reader_id,
            config: reg.config,
            writer_size,
            conns,
            opened_at,
        })
    }

    /// Block until a timestep is consumable and install it.
    ///
    /// `LatestAvailable` is collective (the cohort agrees on the newest step
    /// every rank has been offered, and agrees first on whether the wait
    /// produced anything at all); `NextAvailable` needs no agreement because
    /// announcements arrive in order.
    pub fn advance_step(&mut self, mode: StepMode, timeout: Option<Duration>) -> Result<StepStatus> {
        {
            let st = self.inner.state.lock();
            if st.current.is_some() {
                return Err(Error::InvalidState(
                    "previous timestep has not been released".into(),
                ));
            }
            if matches!(st.status, StreamStatus::NotOpen | StreamStatus::Closed) {
                return Err(Error::InvalidState(format!("stream is {:?}", st.status)));
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let target = match mode {
            StepMode::NextAvailable => {
                match self.wait_for_step(deadline) {
                    Wakeup::Fatal => return Ok(StepStatus::FatalError),
                    Wakeup::EndOfStream => return Ok(StepStatus::EndOfStream),
                    Wakeup::TimedOut => return Ok(StepStatus::Timeout),
                    Wakeup::Available => {}
                }
                let st = self.inner.state.lock();
                match st.steps.range(st.next_expect..).next() {
                    Some((&ts, _)) => ts,
                    None => return Ok(StepStatus::Timeout),
                }
            }
            StepMode::LatestAvailable => {
                // The cohort agrees on the wait's outcome before the step
                // reduction; a rank returning early while a sibling enters
                // the reduction would desync every later collective.
                let code = match self.wait_for_step(deadline) {
                    Wakeup::Available => 0u64,
                    Wakeup::TimedOut => 1,
                    Wakeup::EndOfStream => 2,
                    Wakeup::Fatal => 3,
                };
                match self.cohort.allreduce_max(code) {
                    0 => {}
                    1 => return Ok(StepStatus::Timeout),
                    2 => return Ok(StepStatus::EndOfStream),
                    _ => return Ok(StepStatus::FatalError),
                }
                let local_newest = {
                    let st = self.inner.state.lock();
                    match st.steps.range(st.next_expect..).next_back() {
                        Some((&ts, _)) => ts,
                        // Every rank just reported an available step.
                        None => unreachable!("available wakeup with no queued step"),
                    }
                };
                let agreed = self.cohort.allreduce_max(local_newest);
                // Some rank was offered `agreed`; ours is in flight at worst.
                let mut st = self.inner.state.lock();
                while !st.steps.contains_key(&agreed) {
                    if st.status == StreamStatus::PeerFailed {
                        return Ok(StepStatus::FatalError);
                    }
                    self.inner.cv.wait_for(&mut st, SYNC_WAIT);
                }
                // Skipped steps are released unseen, keeping the writer's
                // reference counts exact.
                let skipped: Vec<u64> = st
                    .steps
                    .range(st.next_expect..agreed)
                    .map(|(&ts, _)| ts)
                    .collect();
                for ts in skipped {
                    st.steps.remove(&ts);
                    drop(st);
                    self.send_release(ts);
                    st = self.inner.state.lock();
                }
                agreed
            }
        };

        let mut st = self.inner.state.lock();
        let step = match st.steps.remove(&target) {
            Some(step) => step,
            None => panic!("timestep {} vanished before install", target),
        };
        st.marshal.add_formats(&step.formats)?;
        st.marshal.install_step(target, &step.metadata)?;
        st.current = Some(target);
        st.current_dp_info = step.dp_info;
        st.next_expect = target + 1;
        st.stats.timesteps += 1;
        debug!("[ReaderStream::advance_step] installed timestep {}", target);
        Ok(StepStatus::Success)
    }

    /// Currently installed timestep, if any.
    pub fn current_step(&self) -> Option<u64> {
        self.inner.state.lock().current
    }

    pub fn status(&self) -> StreamStatus {
        self.inner.state.lock().status
    }

    /// Writer-side queue configuration echoed at registration.
    pub fn writer_config(&self) -> WriterConfig {
        self.config
    }

    /// Type and global shape of a variable in the installed timestep.
    pub fn var_geometry(&self, name: &str) -> Result<(VarType, Vec<u64>)> {
        let st = self.inner.state.lock();
        ensure_installed(&st)?;
        let var = st
            .marshal
            .var(name)
            .ok_or_else(|| Error::UnknownVariable(name.into()))?;
        Ok((var.vtype, var.shape.clone()))
    }

    /// Variable names present in the installed timestep.
    pub fn var_names(&self) -> Result<Vec<String>> {
        let st = self.inner.state.lock();
        ensure_installed(&st)?;
        Ok(st.marshal.var_names().iter().map(|s| (*s).to_string()).collect())
    }

    /// Scalar value (element-size little-endian bytes) from the installed
    /// timestep.
    pub fn get_scalar(&self, name: &str) -> Result<Vec<u8>> {
        let st = self.inner.state.lock();
        ensure_installed(&st)?;
        let var = st
            .marshal
            .var(name)
            .ok_or_else(|| Error::UnknownVariable(name.into()))?;
        var.scalar
            .clone()
            .ok_or_else(|| Error::SelectionMismatch(format!("{} is not a scalar", name)))
    }

    /// Queue a selection read against the installed timestep. Nothing moves
    /// until `perform_gets`.
    pub fn get_deferred(&mut self, name: &str, sel: Selection) -> Result<GetToken> {
        let mut st = self.inner.state.lock();
        ensure_installed(&st)?;
        validate_selection(&st, name, &sel)?;
        let token = GetToken(st.next_token);
        st.next_token += 1;
        st.deferred.push(DeferredGet {
            token,
            name: name.to_string(),
            sel,
        });
        Ok(token)
    }

    /// Read one selection immediately, leaving any deferred gets queued.
    /// An empty selection returns an empty buffer without touching the
    /// data plane.
    pub fn get_sync(&mut self, name: &str, sel: Selection) -> Result<Vec<u8>> {
        let get = {
            let mut st = self.inner.state.lock();
            ensure_installed(&st)?;
            validate_selection(&st, name, &sel)?;
            let token = GetToken(st.next_token);
            st.next_token += 1;
            DeferredGet {
                token,
                name: name.to_string(),
                sel,
            }
        };
        let mut results = self.resolve_gets(vec![get])?;
        Ok(results.remove(0).data)
    }

    /// Issue every deferred read, wait for the data and assemble each
    /// selection. Reads fetch each contributing writer rank's whole block
    /// for the variable; one block feeds every selection overlapping it.
    pub fn perform_gets(&mut self) -> Result<Vec<GetResult>> {
        let gets = {
            let mut st = self.inner.state.lock();
            ensure_installed(&st)?;
            std::mem::take(&mut st.deferred)
        };
        self.resolve_gets(gets)
    }

    fn resolve_gets(&mut self, gets: Vec<DeferredGet>) -> Result<Vec<GetResult>> {
        struct Plan {
            token: GetToken,
            sel: Selection,
            elem_size: usize,
            name: String,
            /// (writer rank, start, count) of each overlapping block.
            blocks: Vec<(usize, Vec<u64>, Vec<u64>)>,
        }

        let (current, plans, dp_info) = {
            let st = self.inner.state.lock();
            ensure_installed(&st)?;
            let current = match st.current {
                Some(ts) => ts,
                None => unreachable!("ensure_installed checked"),
            };
            let mut plans = Vec::with_capacity(gets.len());
            for get in gets {
                let var = match st.marshal.var(&get.name) {
                    Some(var) => var,
                    // Validated at get_deferred time; the step cannot have
                    // changed since (release requires an installed step).
                    None => panic!("variable {} vanished from installed step", get.name),
                };
                let blocks = var
                    .per_rank
                    .iter()
                    .enumerate()
                    .filter_map(|(rank, geom)| {
                        let geom = geom.as_ref()?;
                        overlaps(&get.sel, &geom.start, &geom.count)
                            .then(|| (rank, geom.start.clone(), geom.count.clone()))
                    })
                    .collect();
                plans.push(Plan {
                    token: get.token,
                    sel: get.sel,
                    elem_size: var.vtype.elem_size(),
                    name: get.name,
                    blocks,
                });
            }
            (current, plans, st.current_dp_info.clone())
        };

        // Issue one whole-block read per (variable, writer rank) pair.
        let mut handles: HashMap<(String, usize), ReadHandle> = HashMap::new();
        for plan in &plans {
            if plan.sel.is_empty() {
                continue;
            }
            for (rank, _, _) in &plan.blocks {
                let key = (plan.name.clone(), *rank);
                if handles.contains_key(&key) {
                    continue;
                }
                let (off, len) = {
                    let st = self.inner.state.lock();
                    match st.marshal.var(&plan.name).and_then(|v| v.per_rank[*rank].as_ref()) {
                        Some(geom) => (geom.data_off, geom.data_len),
                        None => panic!("geometry for {} rank {} vanished", plan.name, rank),
                    }
                };
                let handle =
                    self.dp
                        .read_remote_memory(*rank, current, off, len, &dp_info[*rank])?;
                handles.insert(key, handle);
            }
        }

        // Wait for every block. A lost writer fails these promptly through
        // the data plane's failure notification.
        let mut blocks: HashMap<(String, usize), Vec<u8>> = HashMap::new();
        let mut fetched = 0u64;
        for (key, handle) in handles {
            let data = handle.wait(None)?;
            fetched += data.len() as u64;
            blocks.insert(key, data);
        }

        let mut results = Vec::with_capacity(plans.len());
        for plan in plans {
            let n_bytes = plan.sel.n_elems() as usize * plan.elem_size;
            let mut data = vec![0u8; n_bytes];
            if !plan.sel.is_empty() {
                for (rank, start, count) in &plan.blocks {
                    let block = &blocks[&(plan.name.clone(), *rank)];
                    extract_into(&mut data, plan.elem_size, &plan.sel, start, count, block);
                }
            }
            results.push(GetResult {
                token: plan.token,
                data,
            });
        }

        self.inner.state.lock().stats.bytes_transferred += fetched;
        Ok(results)
    }

    /// Release the installed timestep back to the writer. Collective; panics
    /// if the cohort's ranks are not all at the same timestep, because the
    /// writer's reference counts would silently corrupt.
    pub fn release_step(&mut self) -> Result<()> {
        let current = {
            let st = self.inner.state.lock();
            st.current
                .ok_or_else(|| Error::InvalidState("no timestep installed".into()))?
        };
        let agreed = self.cohort.allreduce_max(current);
        assert_eq!(
            agreed,
            current,
            "release_step: rank {} is at timestep {} but the cohort reached {}",
            self.cohort.rank(),
            current,
            agreed
        );
        self.send_release(current);
        let mut st = self.inner.state.lock();
        st.current = None;
        st.current_dp_info.clear();
        st.deferred.clear();
        Ok(())
    }

    /// Depart the stream. Collective. Any installed or pending timesteps
    /// are implicitly released by the departure notice.
    pub fn close(&mut self) -> Result<StreamStats> {
        let close_start = Instant::now();
        {
            let mut st = self.inner.state.lock();
            if matches!(st.status, StreamStatus::NotOpen | StreamStatus::Closed) {
                return Err(Error::InvalidState(format!("stream is {:?}", st.status)));
            }
            st.stats.valid_duration = self.opened_at.elapsed() - st.stats.open_duration;
            st.status = StreamStatus::Closed;
        }
        for conn in &self.conns {
            // A dead writer cannot receive the notice and does not need it.
            let _ = conn.send(&ControlMsg::ReaderClose {
                reader_id: self.reader_id,
            });
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
            "[ReaderStream::close] departed after {} timesteps",
            stats.timesteps
        );
        Ok(stats)
    }

    /// Send one release to this rank's writer slice.
    fn send_release(&self, timestep: u64) {
        let msg = ControlMsg::ReleaseTimestep {
            reader_id: self.reader_id,
            timestep,
        };
        for conn in &self.conns {
            if let Err(e) = conn.send(&msg) {
                debug!(
                    "[ReaderStream::send_release] release of {} not delivered: {}",
                    timestep, e
                );
            }
        }
    }

    /// Wait until a deliverable step exists or the stream reaches a terminal
    /// condition.
    fn wait_for_step(&self, deadline: Option<Instant>) -> Wakeup {
        let mut st = self.inner.state.lock();
        loop {
            if st.steps.range(st.next_expect..).next().is_some() {
                return Wakeup::Available;
            }
            if st.status == StreamStatus::PeerFailed {
                return Wakeup::Fatal;
            }
            if let Some(fin) = st.final_step {
                if st.next_expect >= fin {
                    return Wakeup::EndOfStream;
                }
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Wakeup::TimedOut;
                    }
                    self.inner.cv.wait_for(&mut st, (d - now).min(SYNC_WAIT));
                }
                None => {
                    self.inner.cv.wait_for(&mut st, SYNC_WAIT);
                }
            }
        }
    }
}

impl Drop for ReaderStream {
    fn drop(&mut self) {
        let status = self.inner.state.lock().status;
        if !matches!(status, StreamStatus::Closed) {
            warn!("[ReaderStream] dropped without close");
            for conn in &self.conns {
                let _ = conn.send(&ControlMsg::ReaderClose {
                    reader_id: self.reader_id,
                });
            }
            self.dp.shutdown();
            self.ep.close();
        }
    }
}

fn ensure_installed(st: &ReaderState) -> Result<()> {
    if st.current.is_some() {
        Ok(())
    } else {
        Err(Error::InvalidState("no timestep installed".into()))
    }
}

/// Selection must match the variable's rank and stay inside its shape.
fn validate_selection(st: &ReaderState, name: &str, sel: &Selection) -> Result<()> {
    let var = st
        .marshal
        .var(name)
        .ok_or_else(|| Error::UnknownVariable(name.into()))?;
    if var.ndims == 0 {
        return Err(Error::SelectionMismatch(format!(
            "{} is a scalar; use get_scalar",
            name
        )));
    }
    if sel.ndims() != var.ndims {
        return Err(Error::SelectionMismatch(format!(
            "{} has {} dimensions, selection has {}",
            name,
            var.ndims,
            sel.ndims()
        )));
    }
    for d in 0..var.ndims {
        if sel.start[d].saturating_add(sel.count[d]) > var.shape[d] {
            return Err(Error::SelectionMismatch(format!(
                "{} dim {}: selection {}+{} exceeds shape {}",
                name, d, sel.start[d], sel.count[d], var.shape[d]
            )));
        }
    }
    Ok(())
}

/// Rank 0: rendezvous, register, await the writer's response. Returns the
/// serialized registration for broadcast to the cohort.
fn register(
    inner: &Inner,
    ep: &Arc<dyn ControlEndpoint>,
    name: &str,
    params: &StreamParams,
    my_contacts: Vec<ContactInfo>,
) -> Result<Vec<u8>> {
    let rdv = Rendezvous::from_params(name, params);
    let line = rdv.lookup(params.open_timeout)?;
    let cond = fastrand::u64(1..);
    inner.state.lock().expected_cond = Some(cond);

    let conn = ep.connect(&line.contact)?;
    conn.send(&ControlMsg::ReaderRegister {
        writer_token: line.token,
        response_cond: cond,
        reader_cohort: my_contacts,
    })?;

    let deadline = Instant::now() + params.open_timeout;
    let mut st = inner.state.lock();
    let reg = loop {
        if let Some(reg) = st.registration.take() {
            break reg;
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        inner.cv.wait_for(&mut st, SYNC_WAIT);
    };
    drop(st);

    let mut w = WireWriter::new();
    w.put_u64(reg.reader_id);
    w.put_u32(reg.writer_cohort.len() as u32);
    for c in &reg.writer_cohort {
        w.put_str(&c.0);
    }
    w.put_u64(reg.start_step);
    w.put_u64(reg.config.queue_limit);
    w.put_u8(u8::from(reg.config.discard_on_full));
    w.put_u32(reg.formats.len() as u32);
    for fb in &reg.formats {
        w.put_bytes(&fb.hash);
        w.put_block(&fb.body);
    }
    Ok(w.into_vec())
}

fn decode_registration(blob: &[u8]) -> Result<Registration> {
    let mut r = WireReader::new(blob);
    let reader_id = r.read_u64()?;
    let n = r.read_u32()? as usize;
    let mut writer_cohort = Vec::with_capacity(n);
    for _ in 0..n {
        writer_cohort.push(ContactInfo(r.read_str()?));
    }
    let start_step = r.read_u64()?;
    let config = WriterConfig {
        queue_limit: r.read_u64()?,
        discard_on_full: r.read_u8()? != 0,
    };
    let nf = r.read_u32()? as usize;
    let mut formats = Vec::with_capacity(nf);
    for _ in 0..nf {
        let mut hash = [0u8; 16];
        hash.copy_from_slice(r.read_bytes(16)?);
        formats.push(FormatBlock {
            hash,
            body: r.read_block()?,
        });
    }
    Ok(Registration {
        reader_id,
        writer_cohort,
        start_step,
        config,
        formats,
    })
}
