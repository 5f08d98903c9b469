// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! The embedder's entry point: one `Context` per process, holding the
//! control net and the data plane registry, from which streams are opened.

use std::sync::Arc;

use crate::cohort::Cohort;
use crate::config::StreamParams;
use crate::control::{ControlNet, InProcNet, TcpNet};
use crate::cp::{ReaderStream, WriterStream};
use crate::dp::{DpFactory, DpRegistry};
use crate::error::Result;

/// Shared environment for every stream a process opens.
///
/// Explicit rather than ambient: two contexts in one process (say, an
/// in-process net for tests next to a TCP net for real peers) never share
/// state.
pub struct Context {
    net: Arc<dyn ControlNet>,
    registry: DpRegistry,
}

impl Context {
    /// Context over the in-process control net. Writer and reader cohorts
    /// must live in this process; used by tests and single-process staging.
    pub fn in_process() -> Self {
        Self {
            net: InProcNet::new(),
            registry: DpRegistry::with_builtin(),
        }
    }

    /// Context over TCP, listening on `bind_addr` (port 0 picks one).
    pub fn over_tcp(bind_addr: &str) -> Result<Self> {
        Ok(Self {
            net: TcpNet::bind(bind_addr)?,
            registry: DpRegistry::with_builtin(),
        })
    }

    /// Context over a caller-supplied control net.
    pub fn with_net(net: Arc<dyn ControlNet>) -> Self {
        Self {
            net,
            registry: DpRegistry::with_builtin(),
        }
    }

    /// Make an additional data plane selectable by name or priority.
    pub fn register_data_plane(&mut self, factory: Arc<dyn DpFactory>) {
        self.registry.register(factory);
    }

    /// Names of the selectable data planes.
    pub fn data_planes(&self) -> Vec<&'static str> {
        self.registry.names()
    }

    /// Open `name` for writing. Collective over `cohort`.
    pub fn open_writer(
        &self,
        cohort: Arc<dyn Cohort>,
        name: &str,
        params: StreamParams,
    ) -> Result<WriterStream> {
        let factory = self.registry.select(params.data_plane.as_deref())?;
        WriterStream::open(&self.net, &factory, cohort, name, params)
    }

    /// Open `name` for reading. Collective over `cohort`.
    pub fn open_reader(
        &self,
        cohort: Arc<dyn Cohort>,
        name: &str,
        params: StreamParams,
    ) -> Result<ReaderStream> {
        let factory = self.registry.select(params.data_plane.as_deref())?;
        ReaderStream::open(&self.net, &factory, cohort, name, params)
    }
}
