pub mod eltwise;
pub mod sparse_matmul;

use sparsekit::registry::{register_kernel_factory, KernelFactory};
use sparsekit::spec::KernelKind;

/// Registers every CPU kernel factory with the global registry.
///
/// Call this once during startup before resolving kernels; repeated calls are
/// harmless because the latest registration for a kind wins.
pub fn register_cpu_kernels() {
    register_kernel_factory(KernelFactory {
        kind: KernelKind::SparseMatmul,
        describe: sparse_matmul::describe,
        build: sparse_matmul::build,
    });
    register_kernel_factory(KernelFactory {
        kind: KernelKind::Eltwise,
        describe: eltwise::describe,
        build: eltwise::build,
    });
}
