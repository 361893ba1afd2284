//! Scalar node and operator library (C1).
//!
//! A [`Node`] is a cheap `Rc` handle onto an immutable-structure graph node:
//! a forward value, a reverse-mode gradient accumulator, an operator tag, and
//! its parents. Unlike the teacher's `Value`, which clones its whole subtree
//! on every operator call (so shared subgraphs are duplicated), nodes here
//! are reference-counted so that a DAG with shared parents stays a DAG —
//! required for the canonicalizer (C3) and kernel compiler (C4) to see
//! genuine common subexpressions instead of a tree.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::DomainError;

/// Magnitude floor below which `÷` and `reciprocal` raise [`DomainError::DivisionByNearZero`].
pub const DIVISION_FLOOR: f64 = 1e-12;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static NO_GRAD_STACK: RefCell<Vec<bool>> = RefCell::new(Vec::new());
}

/// Returns whether gradient tracking is currently enabled (i.e. no enclosing
/// [`with_no_grad`] scope).
pub fn grad_enabled() -> bool {
    NO_GRAD_STACK.with(|s| !s.borrow().iter().any(|&disabled| disabled))
}

struct NoGradGuard;

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        NO_GRAD_STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// Runs `f` with gradient tracking disabled. Operators invoked inside `f`
/// produce nodes with `requires_grad = false` regardless of their parents'
/// flags. LIFO save/restore happens via an RAII guard, so the flag is
/// restored on every exit path — including an early `return`/`?` or a panic
/// unwinding through `f`.
pub fn with_no_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    NO_GRAD_STACK.with(|s| s.borrow_mut().push(true));
    let _guard = NoGradGuard;
    f()
}

/// Custom-gradient hook: a node whose forward and backward rules are
/// supplied by the caller (used to short-circuit expensive subgraphs whose
/// analytic gradient is cheap to state directly).
#[derive(Clone)]
pub struct CustomOp {
    pub name: String,
    pub forward: Rc<dyn Fn(&[f64]) -> f64>,
    pub backward: Rc<dyn Fn(&[f64], f64) -> Vec<f64>>,
}

impl fmt::Debug for CustomOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomOp").field("name", &self.name).finish()
    }
}

/// The closed operator catalog (spec.md §4.1 / §6). A kernel must recognize
/// exactly this set; the canonicalizer's hash table is keyed on
/// [`Op::tag_name`].
#[derive(Debug, Clone)]
pub enum Op {
    Parameter,
    Constant,

    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Mod,
    PowValue,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,

    Neg,
    Abs,
    Sign,
    Reciprocal,
    Square,
    Cube,
    PowConst(f64),
    Sqrt,
    Exp,
    Log,
    Floor,
    Ceil,
    Round,
    Clamp(f64, f64),

    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,

    Relu,
    Softplus,
    Sigmoid,
    Tanh,

    Sum,
    Mean,

    IfThenElse,

    Custom(CustomOp),
}

impl Op {
    /// The wire-stable tag name used by the canonicalizer's hash table and
    /// by the kernel compiler's emission `match`.
    pub fn tag_name(&self) -> String {
        match self {
            Op::Parameter => "parameter".to_string(),
            Op::Constant => "constant".to_string(),
            Op::Add => "+".to_string(),
            Op::Sub => "-".to_string(),
            Op::Mul => "\u{00d7}".to_string(),
            Op::Div => "\u{00f7}".to_string(),
            Op::Min => "min".to_string(),
            Op::Max => "max".to_string(),
            Op::Mod => "mod".to_string(),
            Op::PowValue => "pow-value".to_string(),
            Op::Lt => "lt".to_string(),
            Op::Le => "lte".to_string(),
            Op::Gt => "gt".to_string(),
            Op::Ge => "gte".to_string(),
            Op::Eq => "eq".to_string(),
            Op::Ne => "neq".to_string(),
            Op::Neg => "neg".to_string(),
            Op::Abs => "abs".to_string(),
            Op::Sign => "sign".to_string(),
            Op::Reciprocal => "reciprocal".to_string(),
            Op::Square => "square".to_string(),
            Op::Cube => "cube".to_string(),
            Op::PowConst(_) => "pow-const".to_string(),
            Op::Sqrt => "sqrt".to_string(),
            Op::Exp => "exp".to_string(),
            Op::Log => "log".to_string(),
            Op::Floor => "floor".to_string(),
            Op::Ceil => "ceil".to_string(),
            Op::Round => "round".to_string(),
            Op::Clamp(_, _) => "clamp".to_string(),
            Op::Sin => "sin".to_string(),
            Op::Cos => "cos".to_string(),
            Op::Tan => "tan".to_string(),
            Op::Asin => "asin".to_string(),
            Op::Acos => "acos".to_string(),
            Op::Atan => "atan".to_string(),
            Op::Relu => "relu".to_string(),
            Op::Softplus => "softplus".to_string(),
            Op::Sigmoid => "sigmoid".to_string(),
            Op::Tanh => "tanh".to_string(),
            Op::Sum => "sum".to_string(),
            Op::Mean => "mean".to_string(),
            Op::IfThenElse => "if-then-else".to_string(),
            Op::Custom(c) => format!("custom/{}", c.name),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::Parameter | Op::Constant)
    }

    /// Bit patterns of any constants this variant captures at construction
    /// time (e.g. `pow_const`'s exponent, `clamp`'s bounds). `tag_name`
    /// collapses these variants to a fixed string, so the canonicalizer
    /// mixes this into the signature hash separately to keep differently
    /// parameterized instances of the same tag from colliding.
    pub fn captured_bits(&self) -> Vec<u64> {
        match self {
            Op::PowConst(n) => vec![n.to_bits()],
            Op::Clamp(lo, hi) => vec![lo.to_bits(), hi.to_bits()],
            _ => vec![],
        }
    }
}

/// Backing storage for a [`Node`]. Structure (op, parents) is immutable once
/// created; only `value` and `grad` mutate afterward.
pub(crate) struct NodeData {
    pub id: u64,
    pub value: Cell<f64>,
    pub grad: Cell<f64>,
    pub requires_grad: bool,
    pub op: Op,
    pub parents: Vec<Node>,
    pub label: RefCell<Option<String>>,
    pub param_name: Option<String>,
}

/// A scalar node in the computation graph.
///
/// Cloning a `Node` clones the `Rc` handle, not the subgraph — two clones
/// denote the *same* node, which is what lets the graph be a DAG rather than
/// a tree.
#[derive(Clone)]
pub struct Node(pub(crate) Rc<NodeData>);

impl Node {
    fn new(
        op: Op,
        parents: Vec<Node>,
        value: f64,
        requires_grad: bool,
        label: Option<String>,
        param_name: Option<String>,
    ) -> Node {
        Node(Rc::new(NodeData {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            value: Cell::new(value),
            grad: Cell::new(0.0),
            requires_grad,
            op,
            parents,
            label: RefCell::new(label),
            param_name,
        }))
    }

    /// A grad-bearing leaf whose value the optimizer may move.
    pub fn parameter(value: f64) -> crate::error::Result<Node> {
        check_finite(value)?;
        Ok(Node::new(Op::Parameter, vec![], value, grad_enabled(), None, None))
    }

    /// A grad-bearing leaf identified by a stable parameter name (so the
    /// registry, per §3's dedup rule, collapses repeated calls with the same
    /// name to a single registry entry).
    pub fn named_parameter(value: f64, name: impl Into<String>) -> crate::error::Result<Node> {
        check_finite(value)?;
        let name = name.into();
        Ok(Node::new(
            Op::Parameter,
            vec![],
            value,
            grad_enabled(),
            Some(name.clone()),
            Some(name),
        ))
    }

    /// A non-grad leaf whose value never changes across evaluations.
    pub fn constant(value: f64) -> crate::error::Result<Node> {
        check_finite(value)?;
        Ok(Node::new(Op::Constant, vec![], value, false, None, None))
    }

    pub fn value(&self) -> f64 {
        self.0.value.get()
    }

    pub fn set_value(&self, value: f64) {
        self.0.value.set(value);
    }

    pub fn grad(&self) -> f64 {
        self.0.grad.get()
    }

    pub fn set_grad(&self, grad: f64) {
        self.0.grad.set(grad);
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    pub fn op(&self) -> &Op {
        &self.0.op
    }

    pub fn parents(&self) -> &[Node] {
        &self.0.parents
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn param_name(&self) -> Option<&str> {
        self.0.param_name.as_deref()
    }

    pub fn label(&self) -> Option<String> {
        self.0.label.borrow().clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        *self.0.label.borrow_mut() = Some(label.into());
    }

    fn ptr(&self) -> *const NodeData {
        Rc::as_ptr(&self.0)
    }

    // ---- operator catalog ----------------------------------------------

    fn unary(op: Op, a: &Node) -> crate::error::Result<Node> {
        let value = eval_op(&op, &[a.value()])?;
        let requires_grad = grad_enabled() && a.requires_grad();
        Ok(Node::new(op, vec![a.clone()], value, requires_grad, None, None))
    }

    fn binary(op: Op, a: &Node, b: &Node) -> crate::error::Result<Node> {
        let value = eval_op(&op, &[a.value(), b.value()])?;
        let requires_grad = grad_enabled() && (a.requires_grad() || b.requires_grad());
        Ok(Node::new(op, vec![a.clone(), b.clone()], value, requires_grad, None, None))
    }

    pub fn add(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Add, a, b).expect("add is infallible")
    }
    pub fn sub(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Sub, a, b).expect("sub is infallible")
    }
    pub fn mul(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Mul, a, b).expect("mul is infallible")
    }
    pub fn div(a: &Node, b: &Node) -> crate::error::Result<Node> {
        Self::binary(Op::Div, a, b)
    }
    pub fn min(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Min, a, b).expect("min is infallible")
    }
    pub fn max(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Max, a, b).expect("max is infallible")
    }
    pub fn modulo(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Mod, a, b).expect("mod is infallible")
    }
    pub fn pow_value(a: &Node, b: &Node) -> Node {
        Self::binary(Op::PowValue, a, b).expect("pow_value is not domain-checked (see DESIGN.md)")
    }
    pub fn lt(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Lt, a, b).expect("comparisons are infallible")
    }
    pub fn le(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Le, a, b).expect("comparisons are infallible")
    }
    pub fn gt(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Gt, a, b).expect("comparisons are infallible")
    }
    pub fn ge(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Ge, a, b).expect("comparisons are infallible")
    }
    pub fn eq_node(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Eq, a, b).expect("comparisons are infallible")
    }
    pub fn ne_node(a: &Node, b: &Node) -> Node {
        Self::binary(Op::Ne, a, b).expect("comparisons are infallible")
    }

    pub fn neg(&self) -> Node {
        Self::unary(Op::Neg, self).expect("neg is infallible")
    }
    pub fn abs(&self) -> Node {
        Self::unary(Op::Abs, self).expect("abs is infallible")
    }
    pub fn sign(&self) -> Node {
        Self::unary(Op::Sign, self).expect("sign is infallible")
    }
    pub fn reciprocal(&self) -> crate::error::Result<Node> {
        Self::unary(Op::Reciprocal, self)
    }
    pub fn square(&self) -> Node {
        Self::unary(Op::Square, self).expect("square is infallible")
    }
    pub fn cube(&self) -> Node {
        Self::unary(Op::Cube, self).expect("cube is infallible")
    }
    pub fn pow_const(&self, exponent: f64) -> crate::error::Result<Node> {
        Self::unary(Op::PowConst(exponent), self)
    }
    pub fn sqrt(&self) -> crate::error::Result<Node> {
        Self::unary(Op::Sqrt, self)
    }
    pub fn exp(&self) -> Node {
        Self::unary(Op::Exp, self).expect("exp is infallible")
    }
    pub fn log(&self) -> crate::error::Result<Node> {
        Self::unary(Op::Log, self)
    }
    pub fn floor(&self) -> Node {
        Self::unary(Op::Floor, self).expect("floor is infallible")
    }
    pub fn ceil(&self) -> Node {
        Self::unary(Op::Ceil, self).expect("ceil is infallible")
    }
    pub fn round(&self) -> Node {
        Self::unary(Op::Round, self).expect("round is infallible")
    }
    pub fn clamp(&self, lo: f64, hi: f64) -> Node {
        Self::unary(Op::Clamp(lo, hi), self).expect("clamp is infallible")
    }
    pub fn sin(&self) -> Node {
        Self::unary(Op::Sin, self).expect("sin is infallible")
    }
    pub fn cos(&self) -> Node {
        Self::unary(Op::Cos, self).expect("cos is infallible")
    }
    pub fn tan(&self) -> Node {
        Self::unary(Op::Tan, self).expect("tan is infallible")
    }
    pub fn asin(&self) -> Node {
        Self::unary(Op::Asin, self).expect("asin is infallible")
    }
    pub fn acos(&self) -> Node {
        Self::unary(Op::Acos, self).expect("acos is infallible")
    }
    pub fn atan(&self) -> Node {
        Self::unary(Op::Atan, self).expect("atan is infallible")
    }
    pub fn relu(&self) -> Node {
        Self::unary(Op::Relu, self).expect("relu is infallible")
    }
    pub fn softplus(&self) -> Node {
        Self::unary(Op::Softplus, self).expect("softplus is infallible")
    }
    pub fn sigmoid(&self) -> Node {
        Self::unary(Op::Sigmoid, self).expect("sigmoid is infallible")
    }
    pub fn tanh(&self) -> Node {
        Self::unary(Op::Tanh, self).expect("tanh is infallible")
    }

    /// Variadic sum reduction.
    pub fn sum(children: &[Node]) -> Node {
        let values: Vec<f64> = children.iter().map(Node::value).collect();
        let value = eval_op(&Op::Sum, &values).expect("sum is infallible");
        let requires_grad = grad_enabled() && children.iter().any(Node::requires_grad);
        Node::new(Op::Sum, children.to_vec(), value, requires_grad, None, None)
    }

    /// Variadic mean reduction.
    pub fn mean(children: &[Node]) -> Node {
        let values: Vec<f64> = children.iter().map(Node::value).collect();
        let value = eval_op(&Op::Mean, &values).expect("mean is infallible");
        let requires_grad = grad_enabled() && children.iter().any(Node::requires_grad);
        Node::new(Op::Mean, children.to_vec(), value, requires_grad, None, None)
    }

    /// Selects `then`'s value if `cond` is nonzero, else `else_`'s; gradient
    /// flows only through the selected branch. `cond`'s gradient is always
    /// zero.
    pub fn if_then_else(cond: &Node, then: &Node, else_: &Node) -> Node {
        let value = if cond.value() != 0.0 { then.value() } else { else_.value() };
        let requires_grad = grad_enabled() && (then.requires_grad() || else_.requires_grad());
        Node::new(
            Op::IfThenElse,
            vec![cond.clone(), then.clone(), else_.clone()],
            value,
            requires_grad,
            None,
            None,
        )
    }

    /// A node whose forward and backward rules are supplied by the caller.
    /// Two custom nodes share a compiled kernel only if they carry the same
    /// `name` and the same child arity/position (see the canonicalizer).
    pub fn custom(
        name: impl Into<String>,
        inputs: &[Node],
        forward: Rc<dyn Fn(&[f64]) -> f64>,
        backward: Rc<dyn Fn(&[f64], f64) -> Vec<f64>>,
    ) -> Node {
        let values: Vec<f64> = inputs.iter().map(Node::value).collect();
        let value = forward(&values);
        let requires_grad = grad_enabled() && inputs.iter().any(Node::requires_grad);
        let op = Op::Custom(CustomOp { name: name.into(), forward, backward });
        Node::new(op, inputs.to_vec(), value, requires_grad, None, None)
    }

    /// Recomputes this node's value, and every ancestor's, from current leaf
    /// values. The sanctioned channel for reflecting parameter moves is the
    /// registry's `update_from`, which calls this; direct `set_value` on a
    /// non-leaf is never done by this crate.
    pub fn recompute(&self) -> crate::error::Result<()> {
        let topo = topo_order(self);
        for node in &topo {
            if node.op().is_leaf() {
                continue;
            }
            let input_values: Vec<f64> = node.parents().iter().map(Node::value).collect();
            let value = eval_op(node.op(), &input_values)?;
            node.set_value(value);
        }
        Ok(())
    }

    /// Zeroes this node's gradient and every reachable ancestor's. Callers
    /// are responsible for calling this before `backward` when reusing a
    /// graph, since `backward` never re-zeroes on its own.
    pub fn zero_gradients(&self) {
        for node in topo_order(self) {
            node.set_grad(0.0);
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("op", &self.op().tag_name())
            .field("value", &self.value())
            .field("grad", &self.grad())
            .finish()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.ptr() as usize).hash(state);
    }
}

impl std::ops::Add for &Node {
    type Output = Node;
    fn add(self, rhs: &Node) -> Node {
        Node::add(self, rhs)
    }
}
impl std::ops::Sub for &Node {
    type Output = Node;
    fn sub(self, rhs: &Node) -> Node {
        Node::sub(self, rhs)
    }
}
impl std::ops::Mul for &Node {
    type Output = Node;
    fn mul(self, rhs: &Node) -> Node {
        Node::mul(self, rhs)
    }
}
impl std::ops::Neg for &Node {
    type Output = Node;
    fn neg(self) -> Node {
        Node::neg(self)
    }
}

fn check_finite(value: f64) -> crate::error::Result<()> {
    if !value.is_finite() {
        return Err(DomainError::NonFiniteLeaf(value).into());
    }
    Ok(())
}

/// Forward evaluation for every operator in the catalog, given its parents'
/// *current values* (not the parents themselves — this is what lets the
/// bytecode kernel interpreter and the graph-level constructors share one
/// implementation).
pub(crate) fn eval_op(op: &Op, inputs: &[f64]) -> crate::error::Result<f64> {
    use Op::*;
    Ok(match op {
        Parameter | Constant => unreachable!("leaves have no inputs to evaluate"),
        Add => inputs[0] + inputs[1],
        Sub => inputs[0] - inputs[1],
        Mul => inputs[0] * inputs[1],
        Div => {
            if inputs[1].abs() < DIVISION_FLOOR {
                return Err(DomainError::DivisionByNearZero(inputs[1]).into());
            }
            inputs[0] / inputs[1]
        }
        Min => inputs[0].min(inputs[1]),
        Max => inputs[0].max(inputs[1]),
        Mod => inputs[0] % inputs[1],
        PowValue => inputs[0].powf(inputs[1]),
        Lt => bool_f64(inputs[0] < inputs[1]),
        Le => bool_f64(inputs[0] <= inputs[1]),
        Gt => bool_f64(inputs[0] > inputs[1]),
        Ge => bool_f64(inputs[0] >= inputs[1]),
        Eq => bool_f64(inputs[0] == inputs[1]),
        Ne => bool_f64(inputs[0] != inputs[1]),
        Neg => -inputs[0],
        Abs => inputs[0].abs(),
        Sign => {
            if inputs[0] > 0.0 {
                1.0
            } else if inputs[0] < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        Reciprocal => {
            if inputs[0].abs() < DIVISION_FLOOR {
                return Err(DomainError::DivisionByNearZero(inputs[0]).into());
            }
            1.0 / inputs[0]
        }
        Square => inputs[0] * inputs[0],
        Cube => inputs[0] * inputs[0] * inputs[0],
        PowConst(n) => {
            if inputs[0] < 0.0 && n.fract() != 0.0 {
                return Err(DomainError::InvalidPower { base: inputs[0], exponent: *n }.into());
            }
            inputs[0].powf(*n)
        }
        Sqrt => {
            if inputs[0] < 0.0 {
                return Err(DomainError::SqrtOfNegative(inputs[0]).into());
            }
            inputs[0].sqrt()
        }
        Exp => inputs[0].exp(),
        Log => {
            if inputs[0] <= 0.0 {
                return Err(DomainError::LogOfNonPositive(inputs[0]).into());
            }
            inputs[0].ln()
        }
        Floor => inputs[0].floor(),
        Ceil => inputs[0].ceil(),
        Round => inputs[0].round(),
        Clamp(lo, hi) => inputs[0].clamp(*lo, *hi),
        Sin => inputs[0].sin(),
        Cos => inputs[0].cos(),
        Tan => inputs[0].tan(),
        Asin => inputs[0].asin(),
        Acos => inputs[0].acos(),
        Atan => inputs[0].atan(),
        Relu => inputs[0].max(0.0),
        Softplus => (1.0 + inputs[0].exp()).ln(),
        Sigmoid => 1.0 / (1.0 + (-inputs[0]).exp()),
        Tanh => inputs[0].tanh(),
        Sum => inputs.iter().sum(),
        Mean => inputs.iter().sum::<f64>() / inputs.len() as f64,
        IfThenElse => {
            if inputs[0] != 0.0 {
                inputs[1]
            } else {
                inputs[2]
            }
        }
        Custom(c) => (c.forward)(inputs),
    })
}

fn bool_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Computes each parent's gradient contribution for one backward step,
/// given only: the operator, the parents' *current values*, this node's own
/// (already-computed) forward value, and the gradient seeded into this
/// node. Pure function of f64s — shared by the graph-level [`backward`]
/// sweep and the compiled kernel's bytecode interpreter (C4), so the two
/// evaluation paths can never diverge on the math.
pub(crate) fn backward_contributions(op: &Op, parent_values: &[f64], node_value: f64, grad: f64) -> Vec<f64> {
    use Op::*;
    let g = grad;
    match op {
        Parameter | Constant => vec![],
        Add => vec![g, g],
        Sub => vec![g, -g],
        Mul => vec![parent_values[1] * g, parent_values[0] * g],
        Div => {
            let (x, y) = (parent_values[0], parent_values[1]);
            vec![g / y, -g * x / (y * y)]
        }
        Min => {
            let (a, b) = (parent_values[0], parent_values[1]);
            if a <= b {
                vec![g, 0.0]
            } else {
                vec![0.0, g]
            }
        }
        Max => {
            let (a, b) = (parent_values[0], parent_values[1]);
            if a >= b {
                vec![g, 0.0]
            } else {
                vec![0.0, g]
            }
        }
        Mod => vec![g, 0.0],
        PowValue => {
            let (a, b) = (parent_values[0], parent_values[1]);
            let da = g * b * a.powf(b - 1.0);
            let db = if a > 0.0 { g * node_value * a.ln() } else { 0.0 };
            vec![da, db]
        }
        Lt | Le | Gt | Ge | Eq | Ne => vec![0.0, 0.0],
        Neg => vec![-g],
        Abs => {
            let x = parent_values[0];
            let s = if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                1.0
            };
            vec![s * g]
        }
        Sign => vec![0.0],
        Reciprocal => {
            let x = parent_values[0];
            vec![-g / (x * x)]
        }
        Square => vec![2.0 * parent_values[0] * g],
        Cube => {
            let x = parent_values[0];
            vec![3.0 * x * x * g]
        }
        PowConst(n) => {
            let x = parent_values[0];
            vec![g * n * x.powf(n - 1.0)]
        }
        Sqrt => vec![g / (2.0 * node_value)],
        Exp => vec![node_value * g],
        Log => vec![g / parent_values[0]],
        Floor | Ceil | Round => vec![0.0],
        Clamp(lo, hi) => {
            let x = parent_values[0];
            vec![if x > *lo && x < *hi { g } else { 0.0 }]
        }
        Sin => vec![parent_values[0].cos() * g],
        Cos => vec![-parent_values[0].sin() * g],
        Tan => {
            let c = parent_values[0].cos();
            vec![g / (c * c)]
        }
        Asin => {
            let x = parent_values[0];
            vec![g / (1.0 - x * x).sqrt()]
        }
        Acos => {
            let x = parent_values[0];
            vec![-g / (1.0 - x * x).sqrt()]
        }
        Atan => {
            let x = parent_values[0];
            vec![g / (1.0 + x * x)]
        }
        Relu => vec![if parent_values[0] > 0.0 { g } else { 0.0 }],
        Softplus => {
            let s = 1.0 / (1.0 + (-parent_values[0]).exp());
            vec![s * g]
        }
        Sigmoid => {
            let s = node_value;
            vec![s * (1.0 - s) * g]
        }
        Tanh => {
            let t = node_value;
            vec![(1.0 - t * t) * g]
        }
        Sum => vec![g; parent_values.len()],
        Mean => {
            let n = parent_values.len() as f64;
            vec![g / n; parent_values.len()]
        }
        IfThenElse => {
            if parent_values[0] != 0.0 {
                vec![0.0, g, 0.0]
            } else {
                vec![0.0, 0.0, g]
            }
        }
        Custom(c) => (c.backward)(parent_values, g),
    }
}

/// Accumulates this node's backward contribution (assumed already seeded in
/// `node.grad()`) into each parent's gradient accumulator. Contributions are
/// added with `+=`, never overwritten, so shared parents correctly sum
/// contributions from every path that reaches them.
pub(crate) fn apply_backward(node: &Node) {
    let parents = node.parents();
    if parents.is_empty() {
        return;
    }
    let parent_values: Vec<f64> = parents.iter().map(Node::value).collect();
    let contributions = backward_contributions(node.op(), &parent_values, node.value(), node.grad());
    for (p, d) in parents.iter().zip(contributions) {
        p.set_grad(p.grad() + d);
    }
}

/// Builds a topological order of every node reachable from `root`
/// (post-order DFS: parents of a node always precede it). Iteration order
/// over each node's parent list is fixed, so the result is deterministic for
/// a given graph shape.
pub(crate) fn topo_order(root: &Node) -> Vec<Node> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(Node, usize)> = vec![(root.clone(), 0)];

    while let Some((node, next_parent)) = stack.pop() {
        let ptr = node.ptr();
        if next_parent == 0 {
            if visited.contains(&ptr) {
                continue;
            }
            visited.insert(ptr);
        }
        if next_parent < node.parents().len() {
            let child = node.parents()[next_parent].clone();
            stack.push((node.clone(), next_parent + 1));
            stack.push((child, 0));
        } else {
            order.push(node);
        }
    }
    order
}

/// Runs reverse-mode backward from `root`: seeds `root.grad = 1`, then
/// visits nodes in reverse topological order, skipping any subgraph whose
/// root has `requires_grad = false`. Never re-zeroes gradients; call
/// [`Node::zero_gradients`] first if reusing a graph across evaluations.
pub fn backward(root: &Node) {
    root.set_grad(1.0);
    let topo = topo_order(root);
    for node in topo.iter().rev() {
        if node.requires_grad() {
            apply_backward(node);
        }
    }
}
