use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumerates scalar element types supported by the kernel contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Si8,
    Ui8,
    Si32,
    Bf16,
    F16,
    F32,
}

impl DataType {
    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DataType::Bf16 | DataType::F16 | DataType::F32)
    }

    /// Returns the storage size in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Si8 | DataType::Ui8 => 1,
            DataType::Bf16 | DataType::F16 => 2,
            DataType::Si32 | DataType::F32 => 4,
        }
    }
}

/// Storage format of a kernel operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SparseFormat {
    Dense,
    Csr,
    Bsr,
}

/// Operand metadata coupling shape, dtype, and storage format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dims: Vec<usize>,
    pub dtype: DataType,
    pub format: SparseFormat,
}

impl TensorDesc {
    pub fn new(dims: Vec<usize>, dtype: DataType, format: SparseFormat) -> Self {
        Self {
            dims,
            dtype,
            format,
        }
    }

    /// Dense-layout shorthand.
    pub fn dense(dims: Vec<usize>, dtype: DataType) -> Self {
        Self::new(dims, dtype, SparseFormat::Dense)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns total element count; dimension products that overflow are a
    /// config error, never a panic.
    pub fn element_count(&self) -> KernelResult<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(*dim).ok_or_else(|| {
                KernelError::invalid_config(format!(
                    "element count overflows for dims {:?}",
                    self.dims
                ))
            })?;
        }
        Ok(count)
    }

    /// Returns total byte length of a dense realization of this operand.
    pub fn byte_len(&self) -> KernelResult<usize> {
        let count = self.element_count()?;
        count
            .checked_mul(self.dtype.size_in_bytes())
            .ok_or_else(|| {
                KernelError::invalid_config(format!(
                    "byte length overflows for dims {:?}",
                    self.dims
                ))
            })
    }
}

/// Attribute payload for operator configurations.
///
/// Attributes are intentionally limited to hashable primitives so
/// configurations stay usable as exact map keys; numeric tuning values travel
/// as canonical strings (e.g. `"1.5"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

/// Enumerates the kernel families this library can cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelKind {
    SparseMatmul,
    Eltwise,
}

impl KernelKind {
    pub fn name(self) -> &'static str {
        match self {
            KernelKind::SparseMatmul => "sparse_matmul",
            KernelKind::Eltwise => "eltwise",
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Execution engine an operator targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    Cpu,
    Gpu,
}

impl EngineKind {
    pub fn name(self) -> &'static str {
        match self {
            EngineKind::Cpu => "cpu",
            EngineKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable key describing a requested compute operation.
///
/// Equality and hashing cover every field, so two configurations compare equal
/// exactly when they request the same kernel specialization. Attribute order
/// is canonical (`BTreeMap`), which keeps fingerprints stable across
/// construction order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub kind: KernelKind,
    pub engine: EngineKind,
    pub tensors: Vec<TensorDesc>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl OperatorConfig {
    pub fn new(kind: KernelKind, engine: EngineKind, tensors: Vec<TensorDesc>) -> Self {
        Self {
            kind,
            engine,
            tensors,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Stable 64-bit fingerprint of the configuration.
    pub fn fingerprint(&self) -> KernelResult<u64> {
        crate::hashing::hash_serializable(self)
    }
}

/// Abstract shape of work derived from a configuration.
///
/// Descriptors are cheap to derive relative to full kernel construction and
/// compare by value: deriving twice from equal configurations yields equal
/// descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub kind: KernelKind,
    pub engine: EngineKind,
    pub operands: Vec<TensorDesc>,
    /// Dense-equivalent floating point operations for one invocation.
    pub flops: u64,
}

impl KernelDescriptor {
    pub fn new(kind: KernelKind, engine: EngineKind, operands: Vec<TensorDesc>, flops: u64) -> Self {
        Self {
            kind,
            engine,
            operands,
            flops,
        }
    }
}

/// Borrowed runtime operand passed to [`Kernel::execute`].
#[derive(Debug)]
pub enum TensorArg<'a> {
    F32(&'a [f32]),
    F32Mut(&'a mut [f32]),
    Si32(&'a [i32]),
}

/// A built, ready-to-invoke kernel.
///
/// Implementations are immutable once constructed; the cache and every caller
/// share them through [`KernelHandle`] without further synchronization.
pub trait Kernel: Send + Sync + std::fmt::Debug {
    /// Returns a human-readable kernel identifier (e.g. `"sparse_matmul_csr_f32"`).
    fn name(&self) -> &'static str;

    /// Returns the descriptor this kernel was built for.
    fn descriptor(&self) -> &Arc<KernelDescriptor>;

    /// Runs the kernel over borrowed operand buffers.
    fn execute(&self, args: &mut [TensorArg<'_>]) -> KernelResult<()>;
}

/// Shared, reference-counted handle to an immutable kernel.
pub type KernelHandle = Arc<dyn Kernel>;

/// Kernel and cache errors surfaced to callers.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid operator config: {0}")]
    InvalidConfig(String),
    #[error("descriptor derivation failed for {kind}: {reason}")]
    Descriptor { kind: KernelKind, reason: String },
    #[error("kernel construction failed for {kind}: {reason}")]
    Construction { kind: KernelKind, reason: String },
    #[error("kernel execution failure: {0}")]
    Execution(String),
    #[error("no kernel factory registered for kind {0}")]
    UnsupportedKind(KernelKind),
    #[error("kernel cache mutex poisoned")]
    CachePoisoned,
}

impl KernelError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        KernelError::InvalidConfig(message.into())
    }

    pub fn descriptor(kind: KernelKind, reason: impl Into<String>) -> Self {
        KernelError::Descriptor {
            kind,
            reason: reason.into(),
        }
    }

    pub fn construction(kind: KernelKind, reason: impl Into<String>) -> Self {
        KernelError::Construction {
            kind,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        KernelError::Execution(message.into())
    }
}

/// Convenience alias for results returned by kernel routines.
pub type KernelResult<T> = Result<T, KernelError>;
