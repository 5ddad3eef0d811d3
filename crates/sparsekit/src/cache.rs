//! Bounded, memoizing cache for built compute kernels.
//!
//! The cache pairs a capacity-bounded FIFO store with a construction
//! coordinator that admits at most one in-flight build per configuration.
//! Construction callbacks always run outside the store lock, so expensive
//! codegen never stalls unrelated lookups.

use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::profiling;
use crate::spec::{KernelDescriptor, KernelError, KernelHandle, KernelResult, OperatorConfig};

/// Default number of kernels the process-wide cache retains.
pub const DEFAULT_KERNEL_CACHE_CAPACITY: usize = 1024;

/// Process-wide kernel cache, created on first access and never torn down.
static GLOBAL_KERNEL_CACHE: Lazy<KernelCache> =
    Lazy::new(|| KernelCache::new(crate::env::kernel_cache_capacity()));

/// Thread-safe configuration→kernel cache with exactly-once construction.
///
/// Entries are evicted in insertion order (FIFO) once the fixed capacity is
/// reached; plain lookups never reorder the queue, so the eviction sequence
/// is a pure function of the inserts performed. Handles are reference
/// counted: evicting an entry never invalidates a handle a caller already
/// holds.
pub struct KernelCache {
    state: Mutex<CacheState>,
    pending: Condvar,
}

struct CacheState {
    capacity: usize,
    entries: HashMap<OperatorConfig, KernelHandle>,
    order: VecDeque<OperatorConfig>,
    building: HashSet<OperatorConfig>,
}

impl CacheState {
    fn insert(&mut self, cfg: OperatorConfig, kernel: KernelHandle) {
        if self.entries.insert(cfg.clone(), kernel).is_some() {
            self.remove_from_order(&cfg);
        }
        self.order.push_back(cfg);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
                profiling::cache_event("kernel_cache.evict");
            }
        }
    }

    fn remove_from_order(&mut self, cfg: &OperatorConfig) {
        if let Some(pos) = self.order.iter().position(|candidate| candidate == cfg) {
            self.order.remove(pos);
        }
    }
}

impl KernelCache {
    /// Creates a cache bounded to `capacity` entries (zero is clamped to one).
    pub fn new(capacity: usize) -> Self {
        KernelCache {
            state: Mutex::new(CacheState {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                order: VecDeque::new(),
                building: HashSet::new(),
            }),
            pending: Condvar::new(),
        }
    }

    /// Returns the process-wide cache instance.
    ///
    /// Lazily created on first access with [`DEFAULT_KERNEL_CACHE_CAPACITY`]
    /// entries (`SPARSEKIT_KERNEL_CACHE_CAPACITY` overrides) and lives for
    /// the rest of the process. Code that wants isolation should construct
    /// and pass its own [`KernelCache`] instead of reaching for this one.
    pub fn global() -> &'static KernelCache {
        &GLOBAL_KERNEL_CACHE
    }

    /// Side-effect-free lookup of the kernel cached for `cfg`.
    pub fn get(&self, cfg: &OperatorConfig) -> Option<KernelHandle> {
        let state = self.state.lock().expect("kernel cache mutex poisoned");
        state.entries.get(cfg).cloned()
    }

    /// Inserts or refreshes the kernel cached for `cfg`.
    ///
    /// Eviction is FIFO by insertion: once the store is full the
    /// least-recently-inserted configuration is dropped first. Re-inserting a
    /// present configuration replaces its entry and moves it to the back of
    /// the eviction queue without growing the entry count.
    pub fn put(&self, cfg: OperatorConfig, kernel: KernelHandle) {
        let mut state = self.state.lock().expect("kernel cache mutex poisoned");
        state.insert(cfg, kernel);
    }

    /// Number of kernels currently cached.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("kernel cache mutex poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry bound fixed at construction time.
    pub fn capacity(&self) -> usize {
        self.state
            .lock()
            .expect("kernel cache mutex poisoned")
            .capacity
    }

    fn lock_state(&self) -> KernelResult<MutexGuard<'_, CacheState>> {
        self.state.lock().map_err(|_| KernelError::CachePoisoned)
    }

    /// Returns the kernel for `cfg`, building it with `build` if absent.
    ///
    /// At most one construction per configuration is in flight at any
    /// instant: concurrent callers for the same configuration block until the
    /// winning thread publishes its result, then share the built handle.
    /// Callers for other configurations proceed unhindered. `build` runs
    /// without the cache lock held. On build failure nothing is inserted, the
    /// error goes to this caller, and blocked callers wake to attempt
    /// construction themselves.
    pub fn find_or_construct<F>(&self, cfg: &OperatorConfig, build: F) -> KernelResult<KernelHandle>
    where
        F: FnOnce(&OperatorConfig) -> KernelResult<KernelHandle>,
    {
        let mut state = self.lock_state()?;
        loop {
            if let Some(found) = state.entries.get(cfg) {
                profiling::cache_event("kernel_cache.hit");
                return Ok(Arc::clone(found));
            }
            if !state.building.contains(cfg) {
                break;
            }
            // Another thread owns this build; completions (and spurious
            // wakeups) funnel back through the presence/marker re-check.
            profiling::cache_event("kernel_cache.wait");
            state = self
                .pending
                .wait(state)
                .map_err(|_| KernelError::CachePoisoned)?;
        }
        state.building.insert(cfg.clone());
        drop(state);
        profiling::cache_event("kernel_cache.miss");

        // A panicking `build` must not strand waiters: the mark clears and
        // notifies during unwind as well.
        let mark = BuildMark {
            cache: self,
            cfg,
            armed: Cell::new(true),
        };
        let built = build(cfg);

        let mut state = self.lock_state()?;
        state.building.remove(cfg);
        mark.disarm();
        let result = match built {
            Ok(kernel) => {
                state.insert(cfg.clone(), Arc::clone(&kernel));
                profiling::cache_event("kernel_cache.insert");
                Ok(kernel)
            }
            Err(err) => {
                profiling::cache_event("kernel_cache.build_failed");
                Err(err)
            }
        };
        drop(state);
        self.pending.notify_all();
        result
    }

    /// Returns the descriptor for `cfg`, deriving it with `derive` when no
    /// cached kernel carries one.
    ///
    /// Descriptor access stays outside the construction protocol: it never
    /// waits on an in-flight build and never inserts anything. `derive` runs
    /// without the lock and its errors propagate unchanged. Derivation is
    /// expected to be deterministic, so equal configurations observe equal
    /// descriptors whether served from the store or derived fresh.
    pub fn get_kd<F>(&self, cfg: &OperatorConfig, derive: F) -> KernelResult<Arc<KernelDescriptor>>
    where
        F: FnOnce(&OperatorConfig) -> KernelResult<Arc<KernelDescriptor>>,
    {
        let cached = {
            let state = self.lock_state()?;
            state
                .entries
                .get(cfg)
                .map(|kernel| Arc::clone(kernel.descriptor()))
        };
        if let Some(descriptor) = cached {
            return Ok(descriptor);
        }
        derive(cfg)
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new(DEFAULT_KERNEL_CACHE_CAPACITY)
    }
}

struct BuildMark<'a> {
    cache: &'a KernelCache,
    cfg: &'a OperatorConfig,
    armed: Cell<bool>,
}

impl BuildMark<'_> {
    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for BuildMark<'_> {
    fn drop(&mut self) {
        if !self.armed.get() {
            return;
        }
        if let Ok(mut state) = self.cache.state.lock() {
            state.building.remove(self.cfg);
        }
        self.cache.pending.notify_all();
    }
}
