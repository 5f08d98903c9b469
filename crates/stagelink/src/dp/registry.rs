// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Data plane registry: enumerate compiled-in planes, select by name or by
//! descending priority.

use std::sync::Arc;

use crate::dp::DpFactory;
use crate::error::{Error, Result};

/// Registry of available data plane implementations.
pub struct DpRegistry {
    factories: Vec<Arc<dyn DpFactory>>,
}

impl DpRegistry {
    /// Registry with the built-in planes.
    pub fn with_builtin() -> Self {
        Self {
            factories: vec![Arc::new(super::InlineDpFactory)],
        }
    }

    /// Empty registry, for embedders supplying their own planes.
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn DpFactory>) {
        self.factories.push(factory);
    }

    /// Select by name, or highest priority when `name` is `None`.
    pub fn select(&self, name: Option<&str>) -> Result<Arc<dyn DpFactory>> {
        match name {
            Some(wanted) => self
                .factories
                .iter()
                .find(|f| f.name() == wanted)
                .cloned()
                .ok_or_else(|| Error::InvalidParam(format!("DataPlane={}", wanted))),
            None => self
                .factories
                .iter()
                .max_by_key(|f| f.priority())
                .cloned()
                .ok_or_else(|| Error::InvalidState("no data planes registered".into())),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlNet;
    use crate::dp::{DpReader, DpWriter};

    struct FakePlane(&'static str, i32);

    impl DpFactory for FakePlane {
        fn name(&self) -> &'static str {
            self.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
        fn make_writer(&self, _net: &Arc<dyn ControlNet>) -> Result<Arc<dyn DpWriter>> {
            Err(Error::InvalidState("fake".into()))
        }
        fn make_reader(&self, _net: &Arc<dyn ControlNet>) -> Result<Arc<dyn DpReader>> {
            Err(Error::InvalidState("fake".into()))
        }
    }

    #[test]
    fn selects_by_descending_priority() {
        let mut reg = DpRegistry::empty();
        reg.register(Arc::new(FakePlane("slow", 1)));
        reg.register(Arc::new(FakePlane("fast", 10)));
        reg.register(Arc::new(FakePlane("medium", 5)));
        assert_eq!(reg.select(None).unwrap().name(), "fast");
    }

    #[test]
    fn selects_by_name_or_rejects() {
        let mut reg = DpRegistry::empty();
        reg.register(Arc::new(FakePlane("slow", 1)));
        assert_eq!(reg.select(Some("slow")).unwrap().name(), "slow");
        assert!(matches!(
            reg.select(Some("rdma")),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn builtin_registry_has_inline() {
        let reg = DpRegistry::with_builtin();
        assert!(reg.names().contains(&"inline"));
    }
}
