use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use sparsekit::profiling;
use sparsekit::spec::{
    DataType, EngineKind, Kernel, KernelDescriptor, KernelError, KernelHandle, KernelKind,
    KernelResult, OperatorConfig, SparseFormat, TensorArg, TensorDesc,
};
use sparsekit::KernelCache;

static CACHE_TEST_MUTEX: Mutex<()> = Mutex::new(());

const THREADS: usize = 8;

#[derive(Debug)]
struct StubKernel {
    descriptor: Arc<KernelDescriptor>,
}

impl Kernel for StubKernel {
    fn name(&self) -> &'static str {
        "stub_kernel"
    }

    fn descriptor(&self) -> &Arc<KernelDescriptor> {
        &self.descriptor
    }

    fn execute(&self, _args: &mut [TensorArg<'_>]) -> KernelResult<()> {
        Ok(())
    }
}

fn derive_descriptor(cfg: &OperatorConfig) -> KernelResult<Arc<KernelDescriptor>> {
    Ok(Arc::new(KernelDescriptor::new(
        cfg.kind,
        cfg.engine,
        cfg.tensors.clone(),
        0,
    )))
}

fn stub_kernel(cfg: &OperatorConfig) -> KernelHandle {
    let descriptor = derive_descriptor(cfg).expect("stub descriptor derivation");
    Arc::new(StubKernel { descriptor })
}

fn matmul_config(m: usize) -> OperatorConfig {
    OperatorConfig::new(
        KernelKind::SparseMatmul,
        EngineKind::Cpu,
        vec![
            TensorDesc::new(vec![m, 8], DataType::F32, SparseFormat::Csr),
            TensorDesc::dense(vec![8, 4], DataType::F32),
            TensorDesc::dense(vec![m, 4], DataType::F32),
        ],
    )
}

#[test]
fn round_trip_returns_the_inserted_instance() {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = KernelCache::new(4);
    let config = matmul_config(8);
    let kernel = stub_kernel(&config);

    assert!(cache.is_empty());
    cache.put(config.clone(), Arc::clone(&kernel));

    let found = cache.get(&config).expect("inserted entry must be found");
    assert!(Arc::ptr_eq(&found, &kernel), "lookup returns the stored handle");
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.capacity(), 4);
}

#[test]
fn distinct_configs_never_collide() {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = KernelCache::new(4);
    let first = matmul_config(8);
    let second = matmul_config(9);
    let first_kernel = stub_kernel(&first);
    let second_kernel = stub_kernel(&second);

    cache.put(first.clone(), Arc::clone(&first_kernel));
    cache.put(second.clone(), Arc::clone(&second_kernel));

    assert_eq!(cache.len(), 2);
    let found_first = cache.get(&first).expect("first entry present");
    let found_second = cache.get(&second).expect("second entry present");
    assert!(Arc::ptr_eq(&found_first, &first_kernel));
    assert!(Arc::ptr_eq(&found_second, &second_kernel));
}

#[test]
fn concurrent_find_or_construct_builds_once() -> anyhow::Result<()> {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = Arc::new(KernelCache::new(8));
    let config = matmul_config(64);
    let builds = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let cache = Arc::clone(&cache);
        let config = config.clone();
        let builds = Arc::clone(&builds);
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || {
            barrier.wait();
            cache.find_or_construct(&config, |cfg| {
                builds.fetch_add(1, Ordering::SeqCst);
                // Keep the build in flight long enough that the rest of the
                // pack arrives while it runs.
                thread::sleep(Duration::from_millis(20));
                Ok(stub_kernel(cfg))
            })
        }));
    }

    let mut handles: Vec<KernelHandle> = Vec::new();
    for worker in workers {
        handles.push(worker.join().expect("worker thread panicked")?);
    }

    assert_eq!(
        builds.load(Ordering::SeqCst),
        1,
        "exactly one construction may run for one config"
    );
    for handle in &handles[1..] {
        assert!(
            Arc::ptr_eq(&handles[0], handle),
            "every caller shares the built instance"
        );
    }
    assert_eq!(cache.len(), 1);
    Ok(())
}

#[test]
fn construction_failure_leaves_no_entry_and_allows_retry() -> anyhow::Result<()> {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = KernelCache::new(4);
    let config = matmul_config(16);

    let failed = cache.find_or_construct(&config, |cfg| {
        Err(KernelError::construction(cfg.kind, "simulated jit failure"))
    });
    assert!(
        matches!(failed, Err(KernelError::Construction { .. })),
        "builder failure surfaces to the caller"
    );
    assert!(cache.get(&config).is_none(), "failed build inserts nothing");
    assert!(cache.is_empty());

    let recovered = cache.find_or_construct(&config, |cfg| Ok(stub_kernel(cfg)))?;
    let cached = cache.get(&config).expect("retry result is cached");
    assert!(Arc::ptr_eq(&recovered, &cached));
    Ok(())
}

#[test]
fn failed_build_wakes_waiters_to_retry() -> anyhow::Result<()> {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = Arc::new(KernelCache::new(8));
    let config = matmul_config(32);
    let retries = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let failing = {
        let cache = Arc::clone(&cache);
        let config = config.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            cache.find_or_construct(&config, |cfg| {
                // The waiter is released only once this build owns the
                // in-flight marker.
                barrier.wait();
                thread::sleep(Duration::from_millis(20));
                Err(KernelError::construction(cfg.kind, "simulated jit failure"))
            })
        })
    };

    let retrying = {
        let cache = Arc::clone(&cache);
        let config = config.clone();
        let retries = Arc::clone(&retries);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            cache.find_or_construct(&config, |cfg| {
                retries.fetch_add(1, Ordering::SeqCst);
                Ok(stub_kernel(cfg))
            })
        })
    };

    let failed = failing.join().expect("failing thread panicked");
    assert!(
        matches!(failed, Err(KernelError::Construction { .. })),
        "first build surfaces its failure"
    );

    let recovered = retrying.join().expect("retrying thread panicked")?;
    assert_eq!(
        retries.load(Ordering::SeqCst),
        1,
        "waiter re-attempts construction itself"
    );
    let cached = cache.get(&config).expect("retry result is cached");
    assert!(Arc::ptr_eq(&recovered, &cached));
    Ok(())
}

#[test]
fn panicking_constructor_does_not_strand_waiters() -> anyhow::Result<()> {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = Arc::new(KernelCache::new(8));
    let config = matmul_config(48);
    let barrier = Arc::new(Barrier::new(2));

    let panicking = {
        let cache = Arc::clone(&cache);
        let config = config.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            cache.find_or_construct(&config, |_| {
                barrier.wait();
                panic!("simulated constructor crash");
            })
        })
    };

    let waiting = {
        let cache = Arc::clone(&cache);
        let config = config.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            cache.find_or_construct(&config, |cfg| Ok(stub_kernel(cfg)))
        })
    };

    assert!(
        panicking.join().is_err(),
        "constructor panic propagates to its caller"
    );
    let handle = waiting.join().expect("waiting thread panicked")?;
    let cached = cache.get(&config).expect("entry present after recovery");
    assert!(Arc::ptr_eq(&handle, &cached));
    Ok(())
}

#[test]
fn unrelated_configs_resolve_while_a_build_is_in_flight() -> anyhow::Result<()> {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = Arc::new(KernelCache::new(8));
    let slow = matmul_config(128);
    let fast = matmul_config(256);
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let builder = {
        let cache = Arc::clone(&cache);
        let slow = slow.clone();
        thread::spawn(move || {
            cache.find_or_construct(&slow, move |cfg| {
                entered_tx.send(()).expect("entered signal");
                release_rx.recv().expect("release signal");
                Ok(stub_kernel(cfg))
            })
        })
    };

    // The slow build is now in flight; if it held the cache lock, the fast
    // resolution below would deadlock instead of completing.
    entered_rx.recv().expect("builder entered its callback");
    let fast_handle = cache.find_or_construct(&fast, |cfg| Ok(stub_kernel(cfg)))?;
    let fast_cached = cache.get(&fast).expect("fast entry published");
    assert!(Arc::ptr_eq(&fast_handle, &fast_cached));
    assert!(
        cache.get(&slow).is_none(),
        "in-flight build publishes nothing early"
    );

    release_tx.send(()).expect("builder must be waiting for release");
    let slow_handle = builder.join().expect("builder thread panicked")?;
    let slow_cached = cache.get(&slow).expect("slow entry published after build");
    assert!(Arc::ptr_eq(&slow_handle, &slow_cached));
    Ok(())
}

#[test]
fn capacity_bound_evicts_oldest_insertion_first() {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = KernelCache::new(2);
    let first = matmul_config(1);
    let second = matmul_config(2);
    let third = matmul_config(3);

    cache.put(first.clone(), stub_kernel(&first));
    cache.put(second.clone(), stub_kernel(&second));
    cache.put(third.clone(), stub_kernel(&third));

    assert_eq!(cache.len(), 2, "store never exceeds its capacity");
    assert!(cache.get(&first).is_none(), "oldest insertion evicted first");
    assert!(cache.get(&second).is_some());
    assert!(cache.get(&third).is_some());
}

#[test]
fn reinsert_refreshes_eviction_position_without_growing() {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = KernelCache::new(2);
    let first = matmul_config(1);
    let second = matmul_config(2);
    let third = matmul_config(3);

    cache.put(first.clone(), stub_kernel(&first));
    let replacement = stub_kernel(&first);
    cache.put(first.clone(), Arc::clone(&replacement));
    assert_eq!(cache.len(), 1, "equal config re-insert must not grow the store");
    let cached = cache.get(&first).expect("entry survives re-insert");
    assert!(
        Arc::ptr_eq(&cached, &replacement),
        "re-insert replaces the stored handle"
    );

    cache.put(second.clone(), stub_kernel(&second));
    cache.put(first.clone(), stub_kernel(&first));
    cache.put(third.clone(), stub_kernel(&third));

    assert_eq!(cache.len(), 2);
    assert!(
        cache.get(&second).is_none(),
        "refreshed key outlives the older insertion"
    );
    assert!(cache.get(&first).is_some());
    assert!(cache.get(&third).is_some());
}

#[test]
fn zero_capacity_is_clamped_to_one() {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = KernelCache::new(0);
    assert_eq!(cache.capacity(), 1);

    let config = matmul_config(8);
    cache.put(config.clone(), stub_kernel(&config));
    assert!(cache.get(&config).is_some(), "a single entry still fits");
}

#[test]
fn get_kd_yields_equal_descriptors_for_equal_configs() -> anyhow::Result<()> {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = KernelCache::new(4);
    let first = matmul_config(8);
    let second = matmul_config(8);

    let derived_first = cache.get_kd(&first, derive_descriptor)?;
    let derived_second = cache.get_kd(&second, derive_descriptor)?;
    assert_eq!(derived_first, derived_second);
    assert!(cache.is_empty(), "descriptor access must not insert entries");

    cache.find_or_construct(&first, |cfg| Ok(stub_kernel(cfg)))?;
    let from_cache = cache.get_kd(&second, derive_descriptor)?;
    assert_eq!(
        from_cache, derived_first,
        "cached kernel descriptor matches fresh derivation"
    );
    Ok(())
}

#[test]
fn get_kd_propagates_derivation_errors_unchanged() {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let cache = KernelCache::new(4);
    let config = matmul_config(8);

    let result = cache.get_kd(&config, |cfg| {
        Err(KernelError::descriptor(cfg.kind, "unsupported operand layout"))
    });
    match result {
        Err(KernelError::Descriptor { kind, reason }) => {
            assert_eq!(kind, KernelKind::SparseMatmul);
            assert_eq!(reason, "unsupported operand layout");
        }
        other => panic!("expected a descriptor error, got {other:?}"),
    }
    assert!(cache.is_empty());
}

#[test]
fn cache_events_track_miss_hit_and_eviction() -> anyhow::Result<()> {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    profiling::reset_cache_events();

    let cache = KernelCache::new(2);
    let first = matmul_config(1);
    let second = matmul_config(2);
    let third = matmul_config(3);

    cache.find_or_construct(&first, |cfg| Ok(stub_kernel(cfg)))?;
    cache.find_or_construct(&first, |_| panic!("cached entry must not rebuild"))?;
    cache.find_or_construct(&second, |cfg| Ok(stub_kernel(cfg)))?;
    cache.find_or_construct(&third, |cfg| Ok(stub_kernel(cfg)))?;
    let _ = cache.find_or_construct(&first, |cfg| {
        Err(KernelError::construction(cfg.kind, "simulated jit failure"))
    });

    assert_eq!(profiling::cache_event_count("kernel_cache.miss"), 4);
    assert_eq!(profiling::cache_event_count("kernel_cache.insert"), 3);
    assert_eq!(profiling::cache_event_count("kernel_cache.hit"), 1);
    assert_eq!(profiling::cache_event_count("kernel_cache.evict"), 1);
    assert_eq!(profiling::cache_event_count("kernel_cache.build_failed"), 1);
    Ok(())
}

#[test]
fn global_cache_is_shared_across_call_sites() {
    let _serial_guard = CACHE_TEST_MUTEX.lock().expect("cache test mutex poisoned");
    let first = KernelCache::global();
    let second = KernelCache::global();
    assert!(std::ptr::eq(first, second));

    let config = matmul_config(4096);
    first.put(config.clone(), stub_kernel(&config));
    assert!(
        second.get(&config).is_some(),
        "one process-wide store backs every accessor"
    );
}
