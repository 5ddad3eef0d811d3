pub mod cache;
mod env;
pub mod hashing;
pub mod profiling;
pub mod registry;
pub mod spec;

pub use cache::{KernelCache, DEFAULT_KERNEL_CACHE_CAPACITY};
pub use spec::{
    AttrValue, DataType, EngineKind, Kernel, KernelDescriptor, KernelError, KernelHandle,
    KernelKind, KernelResult, OperatorConfig, SparseFormat, TensorArg, TensorDesc,
};
