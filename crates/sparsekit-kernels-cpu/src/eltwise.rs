//! Dense elementwise kernels (f32): `y = op(x)`.

use std::sync::Arc;

use sparsekit::spec::{
    AttrValue, DataType, EngineKind, Kernel, KernelDescriptor, KernelError, KernelHandle,
    KernelKind, KernelResult, OperatorConfig, SparseFormat, TensorArg,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum EltwiseOp {
    Relu,
    Scale(f32),
    AddScalar(f32),
}

fn parse_alpha(cfg: &OperatorConfig) -> Result<f32, String> {
    let Some(AttrValue::Str(alpha)) = cfg.attr("alpha") else {
        return Err("missing string attr `alpha`".to_string());
    };
    alpha
        .parse::<f32>()
        .map_err(|_| format!("attr `alpha` is not a canonical float: `{alpha}`"))
}

fn parse_op(cfg: &OperatorConfig) -> Result<EltwiseOp, String> {
    let Some(AttrValue::Str(op)) = cfg.attr("op") else {
        return Err("missing string attr `op`".to_string());
    };
    match op.as_str() {
        "relu" => Ok(EltwiseOp::Relu),
        "scale" => Ok(EltwiseOp::Scale(parse_alpha(cfg)?)),
        "add_scalar" => Ok(EltwiseOp::AddScalar(parse_alpha(cfg)?)),
        other => Err(format!("unknown eltwise op `{other}`")),
    }
}

fn validate(cfg: &OperatorConfig) -> Result<(EltwiseOp, usize), String> {
    if cfg.kind != KernelKind::Eltwise {
        return Err(format!("config describes {}, not an eltwise op", cfg.kind));
    }
    if cfg.engine != EngineKind::Cpu {
        return Err(format!("unsupported engine {}", cfg.engine));
    }
    let [x, y] = cfg.tensors.as_slice() else {
        return Err(format!(
            "expected 2 operand descriptors (x, y), got {}",
            cfg.tensors.len()
        ));
    };
    if x.format != SparseFormat::Dense || y.format != SparseFormat::Dense {
        return Err("eltwise operands must be dense".to_string());
    }
    if x.dtype != DataType::F32 || y.dtype != DataType::F32 {
        return Err("eltwise operands must be f32".to_string());
    }
    if x.dims != y.dims {
        return Err(format!(
            "operand shapes differ: {:?} vs {:?}",
            x.dims, y.dims
        ));
    }
    let len = x.element_count().map_err(|err| err.to_string())?;
    let op = parse_op(cfg)?;
    Ok((op, len))
}

/// Derives the descriptor for an eltwise configuration.
pub fn describe(cfg: &OperatorConfig) -> KernelResult<Arc<KernelDescriptor>> {
    let (_, len) = validate(cfg).map_err(|reason| KernelError::descriptor(cfg.kind, reason))?;
    Ok(Arc::new(KernelDescriptor::new(
        cfg.kind,
        cfg.engine,
        cfg.tensors.clone(),
        len as u64,
    )))
}

/// Builds an eltwise kernel with its op resolved from the config attrs.
pub fn build(cfg: &OperatorConfig) -> KernelResult<KernelHandle> {
    let (op, len) = validate(cfg).map_err(|reason| KernelError::construction(cfg.kind, reason))?;
    let descriptor = Arc::new(KernelDescriptor::new(
        cfg.kind,
        cfg.engine,
        cfg.tensors.clone(),
        len as u64,
    ));
    Ok(Arc::new(EltwiseKernel {
        descriptor,
        op,
        len,
    }))
}

#[derive(Debug)]
struct EltwiseKernel {
    descriptor: Arc<KernelDescriptor>,
    op: EltwiseOp,
    len: usize,
}

impl Kernel for EltwiseKernel {
    fn name(&self) -> &'static str {
        "eltwise_f32"
    }

    fn descriptor(&self) -> &Arc<KernelDescriptor> {
        &self.descriptor
    }

    fn execute(&self, args: &mut [TensorArg<'_>]) -> KernelResult<()> {
        let [TensorArg::F32(x), TensorArg::F32Mut(y)] = args else {
            return Err(KernelError::execution("eltwise expects (x: f32, y: f32 out)"));
        };
        if x.len() != self.len || y.len() != self.len {
            return Err(KernelError::execution(format!(
                "operand lengths {}/{} do not match configured extent {}",
                x.len(),
                y.len(),
                self.len
            )));
        }
        match self.op {
            EltwiseOp::Relu => {
                for (out, value) in y.iter_mut().zip(x.iter()) {
                    *out = value.max(0.0);
                }
            }
            EltwiseOp::Scale(alpha) => {
                for (out, value) in y.iter_mut().zip(x.iter()) {
                    *out = alpha * value;
                }
            }
            EltwiseOp::AddScalar(alpha) => {
                for (out, value) in y.iter_mut().zip(x.iter()) {
                    *out = value + alpha;
                }
            }
        }
        Ok(())
    }
}
