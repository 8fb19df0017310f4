pub mod admin;
pub mod codec;
pub mod listener;
pub mod pipeline;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;

use crate::counters::{Counters, HostClass};
use crate::policy::CachePolicy;
use crate::pool::WorkerPool;
use crate::settings::Settings;
use crate::store::CacheStore;

/// Where a request goes after host routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRoute {
    Cache(HostClass),
    Admin,
}

/// The long-lived engine threaded through the request pipeline:
/// configuration, store, policy, counters, and the write-back pool, built in
/// that order at startup.
#[derive(Clone)]
pub struct Engine {
    pub settings: Arc<Settings>,
    pub store: Arc<CacheStore>,
    pub policy: Arc<CachePolicy>,
    pub counters: Arc<Counters>,
    pub pool: Arc<WorkerPool>,
}

impl Engine {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<CacheStore>,
        policy: Arc<CachePolicy>,
        counters: Arc<Counters>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            settings,
            store,
            policy,
            counters,
            pool,
        }
    }

    pub fn route(&self, host: &str) -> Option<HostRoute> {
        let host = strip_port(host);
        if host.eq_ignore_ascii_case(&self.settings.global_host) {
            Some(HostRoute::Cache(HostClass::Global))
        } else if host.eq_ignore_ascii_case(&self.settings.image_host) {
            Some(HostRoute::Cache(HostClass::Image))
        } else if host.eq_ignore_ascii_case(&self.settings.admin_host) {
            Some(HostRoute::Admin)
        } else {
            None
        }
    }

    pub fn upstream_addr(&self, class: HostClass) -> String {
        match class {
            HostClass::Global => self.settings.global_upstream_addr(),
            HostClass::Image => self.settings.image_upstream_addr(),
        }
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

pub async fn run(engine: Engine) -> Result<()> {
    listener::start_listener(engine).await
}
