use crate::admission::AdmissionPipeline;
use crate::config::AdmissionConfig;
use crate::kvstore::KvStore;
use crate::metrics::Metrics;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared admin-server state, cheaply cloneable. The admission pipeline
/// itself is built once at bootstrap and handed to both the surrounding
/// gateway binary (for `admit()` calls) and this admin surface (for
/// introspection); `config` stays behind an `ArcSwap` so a future config
/// reload can swap it without taking a lock on the read path.
#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<ArcSwap<AdmissionConfig>>,
    pub metrics: Metrics,
    pub kv: Arc<dyn KvStore>,
    pub pipeline: Arc<AdmissionPipeline>,
}

impl AdminState {
    pub fn new(
        config: AdmissionConfig,
        metrics: Metrics,
        kv: Arc<dyn KvStore>,
        pipeline: Arc<AdmissionPipeline>,
    ) -> Self {
        Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            kv,
            pipeline,
        }
    }
}
