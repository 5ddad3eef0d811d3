use std::env;
use std::sync::OnceLock;

use crate::cache::DEFAULT_KERNEL_CACHE_CAPACITY;

static KERNEL_CACHE_CAPACITY: OnceLock<usize> = OnceLock::new();

/// Capacity for the process-wide kernel cache, read once from
/// `SPARSEKIT_KERNEL_CACHE_CAPACITY`. Blank or unparsable values fall back to
/// the default; zero is clamped to one.
pub(crate) fn kernel_cache_capacity() -> usize {
    *KERNEL_CACHE_CAPACITY.get_or_init(|| match env::var("SPARSEKIT_KERNEL_CACHE_CAPACITY") {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<usize>()
            .map(|capacity| capacity.max(1))
            .unwrap_or(DEFAULT_KERNEL_CACHE_CAPACITY),
        _ => DEFAULT_KERNEL_CACHE_CAPACITY,
    })
}
