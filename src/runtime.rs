//! The HTTP runtime handle.
//!
//! One `Http` value is shared by every connection it serves: it owns the
//! stage registry, the shared session cache, the session-creation lock, and
//! the monitor counters. It is threaded explicitly through constructors;
//! there is no process-wide singleton.

use crate::{
    filters::{range::RangeFilter, tail::TailFilter},
    handlers::{ActionHandler, PassHandler},
    limits::HttpLimits,
    pipeline::stage::Stage,
    session::TtlCache,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Errors,
    NotFound,
    LimitErrors,
    BadRequestErrors,
}

#[derive(Default)]
struct Counters {
    errors: AtomicU64,
    not_found: AtomicU64,
    limit_errors: AtomicU64,
    bad_request_errors: AtomicU64,
}

pub struct Http {
    pub limits: HttpLimits,
    stages: RwLock<HashMap<&'static str, Arc<dyn Stage>>>,
    pub(crate) session_cache: Arc<TtlCache>,
    /// Serialises the active-session count check during creation.
    pub(crate) session_lock: Mutex<()>,
    counters: Counters,
}

impl Http {
    pub fn new(limits: HttpLimits) -> Arc<Http> {
        let http = Arc::new(Http {
            limits,
            stages: RwLock::new(HashMap::new()),
            session_cache: Arc::new(TtlCache::new()),
            session_lock: Mutex::new(()),
            counters: Counters::default(),
        });
        http.add_stage(Arc::new(PassHandler::pass()));
        http.add_stage(Arc::new(PassHandler::error_alias()));
        http.add_stage(Arc::new(ActionHandler::new()));
        http.add_stage(Arc::new(RangeFilter));
        http.add_stage(Arc::new(TailFilter));
        http
    }

    /// Registers a stage by name. Later registrations replace earlier ones.
    pub fn add_stage(&self, stage: Arc<dyn Stage>) {
        tracing::debug!(name = stage.name(), "register stage");
        self.stages
            .write()
            .expect("stage registry poisoned")
            .insert(stage.name(), stage);
    }

    pub fn lookup_stage(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages
            .read()
            .expect("stage registry poisoned")
            .get(name)
            .cloned()
    }

    pub(crate) fn monitor(&self, counter: Counter, by: u64) {
        self.counter_cell(counter).fetch_add(by, Ordering::Relaxed);
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counter_cell(counter).load(Ordering::Relaxed)
    }

    fn counter_cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Errors => &self.counters.errors,
            Counter::NotFound => &self.counters.not_found,
            Counter::LimitErrors => &self.counters.limit_errors,
            Counter::BadRequestErrors => &self.counters.bad_request_errors,
        }
    }

    pub fn session_cache(&self) -> &Arc<TtlCache> {
        &self.session_cache
    }
}
