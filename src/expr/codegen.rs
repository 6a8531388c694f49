//! Kernel source generation.
//!
//! A pure translation from a [`Shape`] to OpenCL C. Every operator tag maps
//! to one fixed fragment and parameters are named `prm_<n>` in binding order,
//! so equal shapes always produce byte-identical source.
//!
//! Launch geometry:
//!
//! - assign kernels loop over `n` with a grid stride and accept any global
//!   and local size;
//! - reduce kernels run as exactly one work-group of [`REDUCE_WORK_GROUP`]
//!   work-items and write the shard's single partial to `res[0]`.

use super::Shape;
use shardex_kernels::{BinaryOp, Instr, ParamKind, ReduceOp, ScalarType, UnaryOp};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Work-items in the single work-group of a reduce kernel.
pub const REDUCE_WORK_GROUP: usize = 256;

/// Source of one kernel, generated from a [`Shape`] or supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    name: String,
    text: String,
    scalar: ScalarType,
    shape: Option<Shape>,
    work_group: Option<usize>,
}

impl KernelSource {
    /// A hand-written kernel with entry point `name`, built with
    /// [`Context::build`](crate::Context::build) and launched by the caller.
    pub fn custom(name: impl Into<String>, text: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            scalar,
            shape: None,
            work_group: None,
        }
    }

    /// Entry point name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The expression shape this source was generated from, `None` for
    /// custom sources.
    pub fn shape(&self) -> Option<&Shape> {
        self.shape.as_ref()
    }

    pub fn scalar(&self) -> ScalarType {
        self.scalar
    }

    /// Required work-group size. `Some(size)` means the kernel must be
    /// launched as a single work-group of exactly `size` work-items.
    pub fn work_group_size(&self) -> Option<usize> {
        self.work_group
    }
}

pub fn kernel_name(shape: &Shape) -> String {
    let mut hasher = DefaultHasher::new();
    shape.hash(&mut hasher);
    format!("shardex_{:016x}", hasher.finish())
}

pub fn generate(shape: &Shape) -> KernelSource {
    let name = kernel_name(shape);
    let t = shape.scalar().c_name();
    let program = shape.program();
    let mut text = String::new();

    if shape.scalar() == ScalarType::F64 {
        text.push_str("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n\n");
    }
    if program.params().contains(&ParamKind::SpMv) {
        text.push_str(&spmv_helper(t));
    }

    let mut args = vec!["ulong n".to_string(), format!("global {} *res", t)];
    for (p, kind) in program.params().iter().enumerate() {
        match kind {
            ParamKind::Vector => args.push(format!("global const {} *prm_{}", t, p)),
            ParamKind::Scalar => args.push(format!("{} prm_{}", t, p)),
            ParamKind::SpMv => {
                for (suffix, ty) in [
                    ("lrow", "ulong"),
                    ("lcol", "ulong"),
                    ("lval", t),
                    ("rrow", "ulong"),
                    ("rcol", "ulong"),
                    ("rval", t),
                    ("x", t),
                    ("imp", t),
                ] {
                    args.push(format!("global const {} *prm_{}_{}", ty, p, suffix));
                }
            }
        }
    }
    let work_group = program.reduce_op().map(|_| REDUCE_WORK_GROUP);
    if let Some(size) = work_group {
        text.push_str(&format!(
            "__attribute__((reqd_work_group_size({}, 1, 1)))\n",
            size
        ));
    }
    text.push_str(&format!("kernel void {}(\n    ", name));
    text.push_str(&args.join(",\n    "));
    text.push_str("\n)\n{\n");

    let value = infix(program.instrs());
    match program.reduce_op() {
        None => {
            text.push_str(
                "    for (size_t idx = get_global_id(0); idx < n; idx += get_global_size(0)) {\n",
            );
            text.push_str(&format!("        res[idx] = {};\n", value));
            text.push_str("    }\n");
        }
        Some(op) => text.push_str(&reduce_body(op, t, &value)),
    }
    text.push_str("}\n");

    KernelSource {
        name,
        text,
        scalar: shape.scalar(),
        shape: Some(shape.clone()),
        work_group,
    }
}

fn spmv_helper(t: &str) -> String {
    format!(
        "{t} spmv_row(ulong row,\n\
         \x20   global const ulong *lrow, global const ulong *lcol, global const {t} *lval,\n\
         \x20   global const ulong *rrow, global const ulong *rcol, global const {t} *rval,\n\
         \x20   global const {t} *x, global const {t} *imp)\n\
         {{\n\
         \x20   {t} sum = 0;\n\
         \x20   for (ulong j = lrow[row]; j < lrow[row + 1]; ++j) sum += lval[j] * x[lcol[j]];\n\
         \x20   for (ulong j = rrow[row]; j < rrow[row + 1]; ++j) sum += rval[j] * imp[rcol[j]];\n\
         \x20   return sum;\n\
         }}\n\n"
    )
}

fn reduce_body(op: ReduceOp, t: &str, value: &str) -> String {
    let mut body = String::new();
    body.push_str(&format!("    local {} scratch[{}];\n", t, REDUCE_WORK_GROUP));
    body.push_str("    size_t lid = get_local_id(0);\n");
    body.push_str(&format!("    {} acc = {};\n", t, identity(op)));
    body.push_str(&format!(
        "    for (size_t idx = lid; idx < n; idx += {}) {{\n",
        REDUCE_WORK_GROUP
    ));
    body.push_str(&format!("        {} v = {};\n", t, value));
    body.push_str(&format!("        acc = {};\n", combine(op, "acc", "v")));
    body.push_str("    }\n");
    body.push_str("    scratch[lid] = acc;\n");
    body.push_str("    barrier(CLK_LOCAL_MEM_FENCE);\n");
    // The upper half folds into the lower half; an odd middle element stays.
    body.push_str(&format!("    size_t block = {};\n", REDUCE_WORK_GROUP));
    body.push_str("    while (block > 1) {\n");
    body.push_str("        size_t half = (block + 1) / 2;\n");
    body.push_str(&format!(
        "        if (lid + half < block) scratch[lid] = {};\n",
        combine(op, "scratch[lid]", "scratch[lid + half]")
    ));
    body.push_str("        barrier(CLK_LOCAL_MEM_FENCE);\n");
    body.push_str("        block = half;\n");
    body.push_str("    }\n");
    body.push_str("    if (lid == 0) res[0] = scratch[0];\n");
    body
}

fn infix(instrs: &[Instr]) -> String {
    let mut stack: Vec<String> = Vec::new();
    for instr in instrs {
        let fragment = match *instr {
            Instr::Vector(p) => format!("prm_{}[idx]", p),
            Instr::Scalar(p) => format!("prm_{}", p),
            Instr::SpMv(p) => format!(
                "spmv_row(idx, prm_{p}_lrow, prm_{p}_lcol, prm_{p}_lval, \
                 prm_{p}_rrow, prm_{p}_rcol, prm_{p}_rval, prm_{p}_x, prm_{p}_imp)"
            ),
            Instr::Unary(op) => {
                let a = stack.pop().unwrap_or_default();
                unary(op, &a)
            }
            Instr::Binary(op) => {
                let b = stack.pop().unwrap_or_default();
                let a = stack.pop().unwrap_or_default();
                binary(op, &a, &b)
            }
        };
        stack.push(fragment);
    }
    stack.pop().unwrap_or_default()
}

fn unary(op: UnaryOp, a: &str) -> String {
    match op {
        UnaryOp::Neg => format!("(-{})", a),
        UnaryOp::Abs => format!("fabs({})", a),
        UnaryOp::Sqrt => format!("sqrt({})", a),
        UnaryOp::Exp => format!("exp({})", a),
        UnaryOp::Log => format!("log({})", a),
        UnaryOp::Sin => format!("sin({})", a),
        UnaryOp::Cos => format!("cos({})", a),
        UnaryOp::Tan => format!("tan({})", a),
    }
}

fn binary(op: BinaryOp, a: &str, b: &str) -> String {
    match op {
        BinaryOp::Add => format!("({} + {})", a, b),
        BinaryOp::Sub => format!("({} - {})", a, b),
        BinaryOp::Mul => format!("({} * {})", a, b),
        BinaryOp::Div => format!("({} / {})", a, b),
        BinaryOp::Pow => format!("pow({}, {})", a, b),
        BinaryOp::Min => format!("fmin({}, {})", a, b),
        BinaryOp::Max => format!("fmax({}, {})", a, b),
    }
}

fn identity(op: ReduceOp) -> &'static str {
    match op {
        ReduceOp::Sum | ReduceOp::Any => "0",
        ReduceOp::Product | ReduceOp::All => "1",
        ReduceOp::Min => "INFINITY",
        ReduceOp::Max => "-INFINITY",
    }
}

fn combine(op: ReduceOp, a: &str, b: &str) -> String {
    match op {
        ReduceOp::Sum => format!("{} + {}", a, b),
        ReduceOp::Product => format!("{} * {}", a, b),
        ReduceOp::Min => format!("fmin({}, {})", a, b),
        ReduceOp::Max => format!("fmax({}, {})", a, b),
        ReduceOp::All => format!("({} != 0 && {} != 0)", a, b),
        ReduceOp::Any => format!("({} != 0 || {} != 0)", a, b),
    }
}
