use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{LifecycleError, ModelEngine};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    Ready,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Loading => "loading",
            LifecycleState::Ready => "ready",
            LifecycleState::Terminated => "terminated",
        })
    }
}

/// The loaded engine, shared by every job for the life of the process.
///
/// The device can only run one generation at a time, so all access goes
/// through a single lock.
pub struct EngineHandle {
    engine: Mutex<Box<dyn ModelEngine>>,
    jobs_served: AtomicU64,
}

impl EngineHandle {
    pub fn new(engine: impl ModelEngine + 'static) -> Self {
        Self {
            engine: Mutex::new(Box::new(engine)),
            jobs_served: AtomicU64::new(0),
        }
    }

    /// Locks the engine for the duration of `f`.
    ///
    /// A panic in an earlier job poisons the lock; the engine is still the
    /// same engine, so the poison is cleared and the job proceeds.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut dyn ModelEngine) -> R) -> R {
        let mut guard = self.engine.lock().unwrap_or_else(|poisoned| {
            warn!("Engine lock was poisoned by an earlier job, recovering");
            self.engine.clear_poison();
            poisoned.into_inner()
        });
        f(&mut **guard)
    }

    pub fn jobs_served(&self) -> u64 {
        self.jobs_served.load(Ordering::Relaxed)
    }

    /// Counts a job and reports whether it is the first one (the cold start).
    pub(crate) fn record_job(&self) -> bool {
        self.jobs_served.fetch_add(1, Ordering::Relaxed) == 0
    }
}

/// Owns the engine and tracks `Uninitialized → Loading → Ready → Terminated`.
pub struct ProcessLifecycle {
    state: Mutex<LifecycleState>,
    engine: OnceLock<EngineHandle>,
}

impl Default for ProcessLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Uninitialized),
            engine: OnceLock::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        info!("Worker lifecycle: {} -> {}", *state, next);
        *state = next;
    }

    /// Drives the one-time load. A load failure is fatal: the lifecycle ends
    /// in `Terminated` and the caller is expected to exit.
    pub async fn start<M, F>(&self, load: F) -> Result<&EngineHandle, LifecycleError>
    where
        M: ModelEngine + 'static,
        F: Future<Output = anyhow::Result<M>>,
    {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != LifecycleState::Uninitialized {
                return Err(LifecycleError::AlreadyStarted(*state));
            }
            info!("Worker lifecycle: {} -> {}", *state, LifecycleState::Loading);
            *state = LifecycleState::Loading;
        }

        info!("Loading model engine...");
        let started = Instant::now();
        match load.await {
            Ok(model) => {
                let handle = self.engine.get_or_init(|| EngineHandle::new(model));
                info!("Model engine loaded in {:.2?}", started.elapsed());
                self.set_state(LifecycleState::Ready);
                Ok(handle)
            }
            Err(e) => {
                error!("FATAL: failed to load model engine: {e:#}");
                self.set_state(LifecycleState::Terminated);
                Err(LifecycleError::Fatal(e))
            }
        }
    }

    /// Lends the engine, but only while the worker is `Ready`.
    pub fn engine(&self) -> Option<&EngineHandle> {
        match self.state() {
            LifecycleState::Ready => self.engine.get(),
            _ => None,
        }
    }

    pub fn shutdown(&self) {
        if self.state() != LifecycleState::Terminated {
            self.set_state(LifecycleState::Terminated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineFault;
    use anyhow::anyhow;
    use image::DynamicImage;

    struct BlankEngine;

    impl ModelEngine for BlankEngine {
        fn generate(
            &mut self,
            _prompt: &str,
            _steps: u32,
            _guidance_scale: f64,
            width: u32,
            height: u32,
        ) -> Result<DynamicImage, EngineFault> {
            Ok(DynamicImage::new_rgb8(width, height))
        }

        fn release_cache(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn load_reaches_ready_and_lends_the_engine() {
        let lifecycle = ProcessLifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
        assert!(lifecycle.engine().is_none());

        lifecycle.start(async { Ok(BlankEngine) }).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Ready);

        let first = lifecycle.engine().unwrap() as *const EngineHandle;
        let second = lifecycle.engine().unwrap() as *const EngineHandle;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn load_failure_is_fatal() {
        let lifecycle = ProcessLifecycle::new();
        let err = lifecycle
            .start(async { Err::<BlankEngine, _>(anyhow!("weights unavailable")) })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LifecycleError::Fatal(_)));
        assert_eq!(err.kind(), crate::ErrorKind::Fatal);
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
        assert!(lifecycle.engine().is_none());
    }

    #[tokio::test]
    async fn start_only_runs_once() {
        let lifecycle = ProcessLifecycle::new();
        lifecycle.start(async { Ok(BlankEngine) }).await.unwrap();
        let err = lifecycle
            .start(async { Ok(BlankEngine) })
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LifecycleError::AlreadyStarted(LifecycleState::Ready)
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_lending() {
        let lifecycle = ProcessLifecycle::new();
        lifecycle.start(async { Ok(BlankEngine) }).await.unwrap();
        lifecycle.shutdown();
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
        assert!(lifecycle.engine().is_none());
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let handle = EngineHandle::new(BlankEngine);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handle.with_engine(|_| panic!("engine blew up"));
        }));
        assert!(result.is_err());

        let image = handle
            .with_engine(|engine| engine.generate("x", 9, 0.0, 8, 8))
            .unwrap();
        assert_eq!((image.width(), image.height()), (8, 8));
    }
}
