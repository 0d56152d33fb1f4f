//! Shared application state for the serving surface.

use hangar_config::HangarConfig;
use hangar_core::launcher::ModeLauncher;
use hangar_core::workers::ReloadHandler;
use hangar_core::{BatchExecutor, CancelToken, EventBus, HangarMetrics, Registry};
use hangar_core::ratelimit::RateLimiter;
use hangar_types::HangarResult;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub registry: Arc<Registry>,
    pub batch: BatchExecutor,
    pub reload: Option<Arc<ReloadHandler>>,
    pub limiter: RateLimiter,
    pub metrics: Arc<HangarMetrics>,
    pub bus: Arc<EventBus>,
    pub started_at: Instant,
    /// Calls currently being served; graceful shutdown waits on this.
    in_flight: AtomicUsize,
    /// Set when the process is draining; new calls are refused.
    pub shutting_down: CancelToken,
}

impl AppState {
    /// Build the full runtime from a validated configuration.
    pub fn build(config: &HangarConfig, config_path: Option<PathBuf>) -> HangarResult<Arc<Self>> {
        let bus = Arc::new(EventBus::new());
        let metrics = Arc::new(HangarMetrics::new());
        let launcher = Arc::new(ModeLauncher {
            container_runtime: config.server.container_runtime.clone(),
        });

        let registry = Registry::from_config(config, launcher, bus.clone(), metrics.clone())?;
        let batch = BatchExecutor::new(
            registry.clone(),
            config.batch.clone(),
            config.truncation.clone(),
            bus.clone(),
            metrics.clone(),
        );
        let limiter = RateLimiter::new(
            config.server.rate_limit_rps,
            config.server.rate_limit_burst,
        );
        let reload =
            config_path.map(|path| ReloadHandler::new(path, registry.clone(), bus.clone()));

        Ok(Arc::new(Self {
            registry,
            batch,
            reload,
            limiter,
            metrics,
            bus,
            started_at: Instant::now(),
            in_flight: AtomicUsize::new(0),
            shutting_down: CancelToken::new(),
        }))
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn begin_call(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { state: self }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub struct InFlightGuard<'a> {
    state: &'a AppState,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
