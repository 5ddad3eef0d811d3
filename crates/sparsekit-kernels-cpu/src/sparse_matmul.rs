//! CSR sparse-matrix × dense-matrix multiply (f32): `c = a * b` with `a`
//! stored as compressed sparse rows.

use std::sync::Arc;

use sparsekit::spec::{
    DataType, EngineKind, Kernel, KernelDescriptor, KernelError, KernelHandle, KernelKind,
    KernelResult, OperatorConfig, SparseFormat, TensorArg,
};

/// Accumulator bytes targeted per row block; keeps one block's output slice
/// hot across the CSR traversal.
const TARGET_BLOCK_BYTES: usize = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MatmulShape {
    m: usize,
    k: usize,
    n: usize,
}

fn validate(cfg: &OperatorConfig) -> Result<MatmulShape, String> {
    if cfg.kind != KernelKind::SparseMatmul {
        return Err(format!("config describes {}, not a sparse matmul", cfg.kind));
    }
    if cfg.engine != EngineKind::Cpu {
        return Err(format!("unsupported engine {}", cfg.engine));
    }
    let [a, b, c] = cfg.tensors.as_slice() else {
        return Err(format!(
            "expected 3 operand descriptors (a, b, c), got {}",
            cfg.tensors.len()
        ));
    };
    if a.format != SparseFormat::Csr {
        return Err(format!("operand a must be csr, got {:?}", a.format));
    }
    if b.format != SparseFormat::Dense || c.format != SparseFormat::Dense {
        return Err("operands b and c must be dense".to_string());
    }
    for (name, desc) in [("a", a), ("b", b), ("c", c)] {
        if desc.dtype != DataType::F32 {
            return Err(format!("operand {name} must be f32, got {:?}", desc.dtype));
        }
        if desc.rank() != 2 {
            return Err(format!("operand {name} must be rank 2, got {}", desc.rank()));
        }
        desc.element_count().map_err(|err| err.to_string())?;
    }
    let (m, k) = (a.dims[0], a.dims[1]);
    let n = b.dims[1];
    if b.dims[0] != k {
        return Err(format!(
            "inner dimensions disagree: a is {m}x{k}, b is {}x{n}",
            b.dims[0]
        ));
    }
    if c.dims != [m, n] {
        return Err(format!(
            "output shape {:?} does not match {m}x{n}",
            c.dims
        ));
    }
    Ok(MatmulShape { m, k, n })
}

fn matmul_flops(shape: MatmulShape) -> u64 {
    2u64.saturating_mul(shape.m as u64)
        .saturating_mul(shape.k as u64)
        .saturating_mul(shape.n as u64)
}

/// Derives the descriptor for a CSR×dense matmul configuration.
pub fn describe(cfg: &OperatorConfig) -> KernelResult<Arc<KernelDescriptor>> {
    let shape = validate(cfg).map_err(|reason| KernelError::descriptor(cfg.kind, reason))?;
    Ok(Arc::new(KernelDescriptor::new(
        cfg.kind,
        cfg.engine,
        cfg.tensors.clone(),
        matmul_flops(shape),
    )))
}

/// Builds a sparse matmul kernel, precomputing its row-block plan.
pub fn build(cfg: &OperatorConfig) -> KernelResult<KernelHandle> {
    let shape = validate(cfg).map_err(|reason| KernelError::construction(cfg.kind, reason))?;
    let descriptor = Arc::new(KernelDescriptor::new(
        cfg.kind,
        cfg.engine,
        cfg.tensors.clone(),
        matmul_flops(shape),
    ));
    let plan = RowBlockPlan::compute(shape);
    Ok(Arc::new(SparseMatmulKernel {
        descriptor,
        shape,
        plan,
    }))
}

/// Row partitioning chosen once at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RowBlockPlan {
    blocks: Vec<(usize, usize)>,
}

impl RowBlockPlan {
    fn compute(shape: MatmulShape) -> Self {
        let row_bytes = shape
            .n
            .saturating_mul(DataType::F32.size_in_bytes())
            .max(1);
        let block_rows = (TARGET_BLOCK_BYTES / row_bytes).clamp(1, shape.m.max(1));
        let mut blocks = Vec::new();
        let mut start = 0;
        while start < shape.m {
            let end = (start + block_rows).min(shape.m);
            blocks.push((start, end));
            start = end;
        }
        RowBlockPlan { blocks }
    }
}

#[derive(Debug)]
struct SparseMatmulKernel {
    descriptor: Arc<KernelDescriptor>,
    shape: MatmulShape,
    plan: RowBlockPlan,
}

impl SparseMatmulKernel {
    fn check_extents(
        &self,
        indptr: &[i32],
        indices: &[i32],
        values: &[f32],
        b: &[f32],
        c: &[f32],
    ) -> KernelResult<()> {
        let MatmulShape { m, k, n } = self.shape;
        if indptr.len() != m + 1 {
            return Err(KernelError::execution(format!(
                "indptr length {} does not match expected {}",
                indptr.len(),
                m + 1
            )));
        }
        if values.len() != indices.len() {
            return Err(KernelError::execution(format!(
                "values length {} does not match indices length {}",
                values.len(),
                indices.len()
            )));
        }
        // Dimension products were overflow-checked at construction.
        if b.len() != k * n {
            return Err(KernelError::execution(format!(
                "operand b holds {} elements, expected {}",
                b.len(),
                k * n
            )));
        }
        if c.len() != m * n {
            return Err(KernelError::execution(format!(
                "output c holds {} elements, expected {}",
                c.len(),
                m * n
            )));
        }
        Ok(())
    }
}

fn csr_offset(indptr: &[i32], index: usize) -> KernelResult<usize> {
    let value = indptr[index];
    if value < 0 {
        return Err(KernelError::execution(format!(
            "negative csr offset {value} at position {index}"
        )));
    }
    Ok(value as usize)
}

impl Kernel for SparseMatmulKernel {
    fn name(&self) -> &'static str {
        "sparse_matmul_csr_f32"
    }

    fn descriptor(&self) -> &Arc<KernelDescriptor> {
        &self.descriptor
    }

    fn execute(&self, args: &mut [TensorArg<'_>]) -> KernelResult<()> {
        let [TensorArg::Si32(indptr), TensorArg::Si32(indices), TensorArg::F32(values), TensorArg::F32(b), TensorArg::F32Mut(c)] =
            args
        else {
            return Err(KernelError::execution(
                "sparse matmul expects (indptr: si32, indices: si32, values: f32, b: f32, c: f32 out)",
            ));
        };
        self.check_extents(indptr, indices, values, b, c)?;

        let MatmulShape { k, n, .. } = self.shape;
        for &(block_start, block_end) in &self.plan.blocks {
            for row in block_start..block_end {
                let row_start = csr_offset(indptr, row)?;
                let row_end = csr_offset(indptr, row + 1)?;
                if row_start > row_end || row_end > values.len() {
                    return Err(KernelError::execution(format!(
                        "csr row {row} spans invalid extent {row_start}..{row_end}"
                    )));
                }
                let out = &mut c[row * n..(row + 1) * n];
                out.fill(0.0);
                for position in row_start..row_end {
                    let column = indices[position];
                    if column < 0 || column as usize >= k {
                        return Err(KernelError::execution(format!(
                            "csr column index {column} out of range for k={k}"
                        )));
                    }
                    let weight = values[position];
                    let b_row = &b[column as usize * n..(column as usize + 1) * n];
                    for (acc, value) in out.iter_mut().zip(b_row) {
                        *acc += weight * value;
                    }
                }
            }
        }
        Ok(())
    }
}
