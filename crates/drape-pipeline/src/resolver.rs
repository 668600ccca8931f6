//! Synthesis backend resolution — a priority-ordered fallback cascade.
//!
//! Individual backends fail to load for divergent, environment-dependent
//! reasons (missing optional component, missing weight file, unsupported
//! device).  The cascade converts many independent hard failures into one
//! graceful degradation path: candidates are tried highest-capability
//! first, a load failure is memoized against the descriptor and never
//! retried within the process, and the first usable candidate wins.
//!
//! Memoized failures are cleared only by explicit eviction
//! ([`SynthesisResolver::reset`] / [`SynthesisResolver::evict_all`]), which
//! also evicts the backing registry entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use drape_core::backend::{BackendDescriptor, LoadState, TryOnBackend};
use drape_core::error::{Result, TryOnError};
use drape_core::registry::ModelRegistry;

/// Priority-ordered registry of synthesis candidates.
pub struct SynthesisResolver {
    backends: Vec<Arc<dyn TryOnBackend>>,
    states: Mutex<HashMap<&'static str, LoadState>>,
    registry: Arc<ModelRegistry>,
}

impl SynthesisResolver {
    /// Build the cascade.  Descriptors are created here, once, and mutated
    /// only forward through load states.
    pub fn new(
        mut backends: Vec<Arc<dyn TryOnBackend>>,
        registry: Arc<ModelRegistry>,
    ) -> SynthesisResolver {
        backends.sort_by_key(|b| b.rank());
        let states = backends
            .iter()
            .map(|b| (b.name(), LoadState::Unloaded))
            .collect();
        SynthesisResolver {
            backends,
            states: Mutex::new(states),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Walk candidates in priority order and return the first usable one.
    ///
    /// # Errors
    ///
    /// Returns [`TryOnError::NoBackendAvailable`] when every candidate has
    /// failed.  Callers must surface this explicitly — the unprocessed
    /// input is never substituted as a successful result.
    pub async fn resolve(&self) -> Result<Arc<dyn TryOnBackend>> {
        for backend in &self.backends {
            let state = self.state_of(backend.name());
            if state == LoadState::Failed {
                debug!(backend = backend.name(), "skipping memoized failure");
                continue;
            }
            if state == LoadState::Loaded && backend.is_ready() {
                return Ok(Arc::clone(backend));
            }

            self.set_state(backend.name(), LoadState::Loading);
            match backend.load(&self.registry).await {
                Ok(()) => {
                    self.set_state(backend.name(), LoadState::Loaded);
                    info!(backend = backend.name(), rank = backend.rank(), "backend resolved");
                    return Ok(Arc::clone(backend));
                }
                Err(err) => {
                    self.set_state(backend.name(), LoadState::Failed);
                    warn!(
                        backend = backend.name(),
                        error = %err,
                        "backend unavailable, advancing cascade"
                    );
                }
            }
        }
        Err(TryOnError::NoBackendAvailable)
    }

    /// Consistent snapshot of the descriptor table, in priority order.
    pub fn status(&self) -> Vec<BackendDescriptor> {
        let states = self.states.lock().expect("resolver lock poisoned");
        self.backends
            .iter()
            .map(|b| BackendDescriptor {
                name: b.name().to_string(),
                rank: b.rank(),
                load_state: *states.get(b.name()).unwrap_or(&LoadState::Unloaded),
                device: self.registry.pin(b.preferred_device()),
            })
            .collect()
    }

    /// Reset one descriptor to `Unloaded` and evict its registry entries.
    /// The only sanctioned way to retry a memoized failure.
    pub fn reset(&self, name: &str) {
        let mut states = self.states.lock().expect("resolver lock poisoned");
        if let Some(state) = states.get_mut(name) {
            info!(backend = name, "resetting backend descriptor");
            *state = LoadState::Unloaded;
        }
        self.registry.evict(name);
    }

    /// Reset every descriptor and release every cached model (memory
    /// pressure path).
    pub fn evict_all(&self) {
        {
            let mut states = self.states.lock().expect("resolver lock poisoned");
            for state in states.values_mut() {
                *state = LoadState::Unloaded;
            }
        }
        self.registry.evict_all();
    }

    fn state_of(&self, name: &str) -> LoadState {
        *self
            .states
            .lock()
            .expect("resolver lock poisoned")
            .get(name)
            .unwrap_or(&LoadState::Unloaded)
    }

    fn set_state(&self, name: &'static str, state: LoadState) {
        self.states
            .lock()
            .expect("resolver lock poisoned")
            .insert(name, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use drape_core::device::{DeviceClass, DeviceInventory};
    use drape_core::registry::{ModelHandle, ModelLoader};
    use drape_core::types::{GenerationRequest, GenerationResult};

    struct NullLoader;

    #[async_trait]
    impl ModelLoader for NullLoader {
        async fn load(&self, name: &str, _device: DeviceClass) -> Result<ModelHandle> {
            Ok(Arc::new(name.to_string()) as ModelHandle)
        }
    }

    struct ScriptedBackend {
        name: &'static str,
        rank: u32,
        loads_ok: bool,
        load_attempts: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(name: &'static str, rank: u32, loads_ok: bool) -> Arc<ScriptedBackend> {
            Arc::new(ScriptedBackend {
                name,
                rank,
                loads_ok,
                load_attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TryOnBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn rank(&self) -> u32 {
            self.rank
        }

        fn preferred_device(&self) -> DeviceClass {
            DeviceClass::Cpu
        }

        async fn load(&self, _models: &ModelRegistry) -> Result<()> {
            self.load_attempts.fetch_add(1, Ordering::SeqCst);
            if self.loads_ok {
                Ok(())
            } else {
                Err(TryOnError::BackendUnavailable {
                    backend: self.name.to_string(),
                    reason: "weights missing".into(),
                })
            }
        }

        fn is_ready(&self) -> bool {
            self.loads_ok
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResult> {
            unreachable!("resolver tests never generate")
        }
    }

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::new(
            Arc::new(NullLoader),
            DeviceInventory { cuda: false, metal: false },
        ))
    }

    #[tokio::test]
    async fn cascade_returns_first_loadable_candidate() {
        let a = ScriptedBackend::new("a", 0, false);
        let b = ScriptedBackend::new("b", 1, true);
        let c = ScriptedBackend::new("c", 2, true);
        let resolver = SynthesisResolver::new(
            vec![
                a.clone() as Arc<dyn TryOnBackend>,
                b.clone(),
                c.clone(),
            ],
            registry(),
        );

        for _ in 0..5 {
            let resolved = resolver.resolve().await.expect("resolve");
            assert_eq!(resolved.name(), "b");
        }

        // A's load was attempted exactly once (memoized), C never reached.
        assert_eq!(a.load_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(b.load_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(c.load_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn priority_order_ignores_construction_order() {
        let low = ScriptedBackend::new("low", 7, true);
        let high = ScriptedBackend::new("high", 0, true);
        let resolver = SynthesisResolver::new(
            vec![low as Arc<dyn TryOnBackend>, high.clone()],
            registry(),
        );
        let resolved = resolver.resolve().await.expect("resolve");
        assert_eq!(resolved.name(), "high");
    }

    #[tokio::test]
    async fn exhausted_cascade_is_a_terminal_error() {
        let a = ScriptedBackend::new("a", 0, false);
        let b = ScriptedBackend::new("b", 1, false);
        let resolver =
            SynthesisResolver::new(vec![a as Arc<dyn TryOnBackend>, b], registry());
        let err = resolver.resolve().await.err().expect("all candidates fail");
        assert!(matches!(err, TryOnError::NoBackendAvailable));

        let status = resolver.status();
        assert!(status.iter().all(|d| d.load_state == LoadState::Failed));
    }

    #[tokio::test]
    async fn evict_all_makes_failed_candidates_eligible_again() {
        let a = ScriptedBackend::new("a", 0, false);
        let b = ScriptedBackend::new("b", 1, true);
        let resolver = SynthesisResolver::new(
            vec![a.clone() as Arc<dyn TryOnBackend>, b],
            registry(),
        );

        resolver.resolve().await.expect("resolve");
        assert_eq!(a.load_attempts.load(Ordering::SeqCst), 1);

        resolver.evict_all();
        assert!(
            resolver
                .status()
                .iter()
                .all(|d| d.load_state == LoadState::Unloaded)
        );

        resolver.resolve().await.expect("resolve after eviction");
        assert_eq!(a.load_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn status_reports_priority_order() {
        let a = ScriptedBackend::new("garment-fusion", 0, true);
        let b = ScriptedBackend::new("overlay", 2, true);
        let resolver =
            SynthesisResolver::new(vec![b as Arc<dyn TryOnBackend>, a], registry());
        let status = resolver.status();
        assert_eq!(status[0].name, "garment-fusion");
        assert_eq!(status[1].name, "overlay");
        assert!(status.iter().all(|d| d.load_state == LoadState::Unloaded));
    }
}
