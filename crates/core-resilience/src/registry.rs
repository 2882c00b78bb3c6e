//! Process-wide registry of pools, one per downstream target
//!
//! The registry is an explicit object: build it once at process startup, hand
//! `Arc` clones to whoever needs a pool, and call
//! [`PoolRegistry::shutdown_all`] during teardown so every pool drains.
//!
//! Lazy construction is guarded per target by a `tokio::sync::OnceCell`: when
//! many callers ask for the same new target at once, exactly one runs the
//! (async) pool construction and the rest await that same instance.

use crate::error::{ClassifyFn, PoolError};
use crate::pool::{Pool, PoolConfig};
use crate::slot_manager::ClientFactory;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

type PoolCell<C, E> = Arc<OnceCell<Arc<Pool<C, E>>>>;

struct RegistryState<C, E> {
    pools: HashMap<String, PoolCell<C, E>>,
    closed: bool,
}

/// Shared pools keyed by target name
pub struct PoolRegistry<C, E> {
    state: Mutex<RegistryState<C, E>>,
}

impl<C, E> PoolRegistry<C, E>
where
    C: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                pools: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<C, E>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the pool for `target`, constructing it on first use
    ///
    /// `config`, `factory` and `classify` are only used by the caller that
    /// wins the construction race. If construction fails the target stays
    /// unregistered and a later call may try again.
    pub async fn get_or_create(
        &self,
        target: &str,
        config: PoolConfig,
        factory: Arc<dyn ClientFactory<C, E>>,
        classify: ClassifyFn<E>,
    ) -> Result<Arc<Pool<C, E>>, PoolError<E>> {
        let cell = {
            let mut st = self.lock();
            if st.closed {
                return Err(PoolError::PoolClosed);
            }
            st.pools
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let pool = cell
            .get_or_try_init(|| async move {
                debug!(pool = %target, "Constructing pool");
                Pool::new(target, config, factory, classify)
                    .await
                    .map(Arc::new)
            })
            .await?;

        // shutdown_all took this cell while it was still being built and
        // drains the pool itself
        if self.is_closed() {
            debug!(pool = %target, "Registry closed during construction");
            return Err(PoolError::PoolClosed);
        }
        Ok(pool.clone())
    }

    /// The pool for `target`, if it has finished construction
    pub fn get(&self, target: &str) -> Option<Arc<Pool<C, E>>> {
        self.lock()
            .pools
            .get(target)
            .and_then(|cell| cell.get().cloned())
    }

    /// Names of the targets with a constructed pool, sorted
    pub fn targets(&self) -> Vec<String> {
        let st = self.lock();
        let mut targets: Vec<String> = st
            .pools
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        targets.sort();
        targets
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Shut down every pool concurrently, each with the same grace period,
    /// and refuse further registrations. Returns true if every pool drained.
    ///
    /// Pools still under construction are awaited and shut down as well.
    pub async fn shutdown_all(&self, grace: Duration) -> bool {
        let cells: Vec<PoolCell<C, E>> = {
            let mut st = self.lock();
            st.closed = true;
            st.pools.drain().map(|(_, cell)| cell).collect()
        };

        let pending = cells.iter().filter(|cell| !cell.initialized()).count();
        if pending > 0 {
            debug!(pending, "Waiting for pools under construction");
        }

        // Waits out an in-flight initialiser; an empty cell stays empty
        let settled = join_all(cells.iter().map(|cell| {
            cell.get_or_try_init(|| async { Err::<_, PoolError<E>>(PoolError::PoolClosed) })
        }))
        .await;
        let pools: Vec<Arc<Pool<C, E>>> = settled
            .into_iter()
            .filter_map(|result| result.ok().cloned())
            .collect();

        info!(pools = pools.len(), "Shutting down all pools");
        let results = join_all(pools.iter().map(|pool| pool.shutdown(grace))).await;
        results.into_iter().all(|drained| drained)
    }
}

impl<C, E> Default for PoolRegistry<C, E>
where
    C: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify_all_retryable;
    use crate::slot_manager::factory_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Client;

    fn counting_factory(built: Arc<AtomicUsize>) -> Arc<dyn ClientFactory<Client, String>> {
        factory_fn(move || {
            let built = built.clone();
            async move {
                // Give concurrent initialisers a chance to pile up
                tokio::task::yield_now().await;
                built.fetch_add(1, Ordering::SeqCst);
                Ok(Client)
            }
        })
    }

    fn config() -> PoolConfig {
        PoolConfig::default().with_connections(2, 4)
    }

    #[tokio::test]
    async fn test_same_target_returns_same_pool() {
        let registry = PoolRegistry::new();
        let built = Arc::new(AtomicUsize::new(0));

        let a = registry
            .get_or_create("llm", config(), counting_factory(built.clone()), classify_all_retryable())
            .await
            .unwrap();
        let b = registry
            .get_or_create("llm", config(), counting_factory(built.clone()), classify_all_retryable())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(registry.targets(), vec!["llm".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_constructs_once() {
        let registry = Arc::new(PoolRegistry::new());
        let built = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let built = built.clone();
                tokio::spawn(async move {
                    registry
                        .get_or_create("llm", config(), counting_factory(built), classify_all_retryable())
                        .await
                        .map_err(|e| e.to_string())
                })
            })
            .collect();

        let pools: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert!(pools.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        // Only the winner warmed up its min_connections slots
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_construction_can_be_retried() {
        let registry: PoolRegistry<Client, String> = PoolRegistry::new();
        let failing = factory_fn(|| async { Err("no credentials".to_string()) });

        let result = registry
            .get_or_create("llm", config(), failing, classify_all_retryable())
            .await;
        assert!(matches!(result, Err(PoolError::ClientFactory(_))));
        assert!(registry.get("llm").is_none());

        let built = Arc::new(AtomicUsize::new(0));
        let pool = registry
            .get_or_create("llm", config(), counting_factory(built), classify_all_retryable())
            .await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_all_drains_and_closes() {
        let registry = PoolRegistry::new();
        let built = Arc::new(AtomicUsize::new(0));

        let search = registry
            .get_or_create("search", config(), counting_factory(built.clone()), classify_all_retryable())
            .await
            .unwrap();
        registry
            .get_or_create("llm", config(), counting_factory(built.clone()), classify_all_retryable())
            .await
            .unwrap();
        assert_eq!(registry.targets(), vec!["llm".to_string(), "search".to_string()]);

        assert!(registry.shutdown_all(Duration::from_millis(50)).await);
        assert!(registry.is_closed());
        assert!(search.is_closed());
        assert!(registry.targets().is_empty());

        let late = registry
            .get_or_create("llm", config(), counting_factory(built), classify_all_retryable())
            .await;
        assert!(matches!(late, Err(PoolError::PoolClosed)));
    }

    struct TrackedClient(Arc<AtomicUsize>);

    impl Drop for TrackedClient {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_slow_construction_still_drains() {
        let registry: Arc<PoolRegistry<TrackedClient, String>> = Arc::new(PoolRegistry::new());
        let built = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        let slow: Arc<dyn ClientFactory<TrackedClient, String>> = {
            let built = built.clone();
            let dropped = dropped.clone();
            factory_fn(move || {
                let built = built.clone();
                let dropped = dropped.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(TrackedClient(dropped))
                }
            })
        };

        let creating = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .get_or_create("llm", config(), slow, classify_all_retryable())
                    .await
                    .map(|_| ())
                    .map_err(|e| e.category())
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.targets().is_empty());

        assert!(registry.shutdown_all(Duration::from_millis(10)).await);
        assert!(registry.is_closed());

        // Warm-up finished during shutdown and every client was torn down
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);

        let outcome = creating.await.unwrap();
        assert_eq!(outcome, Err("pool_closed"));
        assert!(registry.get("llm").is_none());
    }
}
