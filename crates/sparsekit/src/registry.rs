//! Kernel factory registry for kind-based kernel resolution.
//!
//! Engine crates register a [`KernelFactory`] per kernel kind at startup;
//! callers then resolve kernels through a [`KernelCache`] without naming
//! concrete kernel types. Registration is global to the process, matching
//! the cache's process-wide instance.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::cache::KernelCache;
use crate::spec::{
    KernelDescriptor, KernelError, KernelHandle, KernelKind, KernelResult, OperatorConfig,
};

/// Derives the descriptor for a configuration of this factory's kind.
pub type DescribeFn = fn(&OperatorConfig) -> KernelResult<Arc<KernelDescriptor>>;

/// Builds a ready-to-invoke kernel for a configuration of this factory's kind.
pub type BuildFn = fn(&OperatorConfig) -> KernelResult<KernelHandle>;

/// Registered describe/build pair for one kernel kind.
#[derive(Clone, Copy)]
pub struct KernelFactory {
    pub kind: KernelKind,
    pub describe: DescribeFn,
    pub build: BuildFn,
}

struct FactoryRegistry {
    factories: RwLock<HashMap<KernelKind, KernelFactory>>,
}

impl FactoryRegistry {
    fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, factory: KernelFactory) {
        self.factories
            .write()
            .expect("kernel factory registry poisoned")
            .insert(factory.kind, factory);
    }

    fn lookup(&self, kind: KernelKind) -> Option<KernelFactory> {
        self.factories
            .read()
            .expect("kernel factory registry poisoned")
            .get(&kind)
            .copied()
    }

    fn kinds(&self) -> Vec<KernelKind> {
        self.factories
            .read()
            .expect("kernel factory registry poisoned")
            .keys()
            .copied()
            .collect()
    }
}

static GLOBAL_REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

fn global_registry() -> &'static FactoryRegistry {
    GLOBAL_REGISTRY.get_or_init(FactoryRegistry::new)
}

/// Registers `factory` under its kind.
///
/// The latest registration for a kind wins, which keeps repeated calls from
/// engine initializers idempotent.
pub fn register_kernel_factory(factory: KernelFactory) {
    global_registry().register(factory);
}

/// Looks up the registered factory for `kind`.
pub fn kernel_factory(kind: KernelKind) -> Option<KernelFactory> {
    global_registry().lookup(kind)
}

/// Checks whether a factory for `kind` is registered.
pub fn has_kernel_factory(kind: KernelKind) -> bool {
    global_registry().lookup(kind).is_some()
}

/// Lists all kinds with a registered factory.
pub fn registered_kinds() -> Vec<KernelKind> {
    global_registry().kinds()
}

/// Resolves the kernel for `cfg` through `cache`, constructing it with the
/// registered factory on a miss. Unknown kinds fail before touching the
/// cache.
pub fn resolve_kernel(cache: &KernelCache, cfg: &OperatorConfig) -> KernelResult<KernelHandle> {
    let factory = kernel_factory(cfg.kind).ok_or(KernelError::UnsupportedKind(cfg.kind))?;
    cache.find_or_construct(cfg, factory.build)
}

/// Resolves the descriptor for `cfg` through `cache`, deriving it with the
/// registered factory when no cached kernel carries one.
pub fn resolve_descriptor(
    cache: &KernelCache,
    cfg: &OperatorConfig,
) -> KernelResult<Arc<KernelDescriptor>> {
    let factory = kernel_factory(cfg.kind).ok_or(KernelError::UnsupportedKind(cfg.kind))?;
    cache.get_kd(cfg, factory.describe)
}
