//! End-to-end scenarios and cross-cutting testable properties: kernel reuse
//! under a function set, canonicalizer stability across rebuilds, the two
//! curve-fitting scenarios not already covered by unit tests alongside their
//! solvers, and the domain-error/finite-difference boundary checks.

use rand::Rng;

use scalarflow::{
    backward, canonicalize, compile, nonlinear_least_squares, with_no_grad, DomainError, Error, LmOptions, Node,
};

#[test]
fn kernel_reuse_audit_fifty_distance_constraints() {
    let mut params = Vec::new();
    let mut roots = Vec::new();
    for i in 0..50 {
        let ax = Node::parameter(i as f64).unwrap();
        let ay = Node::parameter(-(i as f64)).unwrap();
        let target = Node::constant(1.0 + i as f64 * 0.01).unwrap();
        let dx = ax.square();
        let dy = ay.square();
        let dist = Node::add(&dx, &dy).sqrt().unwrap();
        roots.push(Node::sub(&dist, &target));
        params.push(ax);
        params.push(ay);
    }

    let set = compile(&params, || roots.clone()).unwrap();
    assert_eq!(set.kernel_count(), 1);
    assert_eq!(set.num_residuals(), 50);
    assert_eq!(set.reuse_factor(), 50.0);
}

#[test]
fn canonicalizer_stability_across_one_hundred_rebuilds() {
    let mut signatures = Vec::with_capacity(100);
    for _ in 0..100 {
        let p = Node::parameter(1.0).unwrap();
        let c = Node::constant(5.0).unwrap();
        let r = Node::sub(&p, &c).square();
        signatures.push(canonicalize(&r, &[p]).hash);
    }
    assert!(signatures.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn constant_blind_reuse_across_two_residuals() {
    let p = Node::parameter(0.0).unwrap();
    let r1 = Node::sub(&p, &Node::constant(5.0).unwrap());
    let r2 = Node::sub(&p, &Node::constant(10.0).unwrap());

    let set = compile(&[p], || vec![r1.clone(), r2.clone()]).unwrap();
    assert_eq!(set.kernel_count(), 1);
    assert_eq!(set.num_residuals(), 2);
}

/// Two residuals with the same shape but different captured constants
/// (`pow_const`'s exponent, `clamp`'s bounds) must not alias onto the same
/// kernel and silently share the wrong one's instructions.
#[test]
fn differently_parameterized_captured_constants_do_not_alias_kernels() {
    let p = Node::parameter(2.0).unwrap();
    let squared = p.pow_const(2.0).unwrap();
    let cubed = p.pow_const(3.0).unwrap();

    let mut set = compile(&[p.clone()], || vec![squared.clone(), cubed.clone()]).unwrap();
    assert_eq!(set.kernel_count(), 2);

    let (values, jacobian) = set.evaluate_jacobian(&[2.0]).unwrap();
    assert!((values[0] - 4.0).abs() < 1e-12, "pow_const(2.0) at x=2 should be 4, got {}", values[0]);
    assert!((values[1] - 8.0).abs() < 1e-12, "pow_const(3.0) at x=2 should be 8, got {}", values[1]);
    assert!((jacobian[0][0] - 4.0).abs() < 1e-12, "d/dx x^2 at x=2 should be 4, got {}", jacobian[0][0]);
    assert!((jacobian[1][0] - 12.0).abs() < 1e-12, "d/dx x^3 at x=2 should be 12, got {}", jacobian[1][0]);

    let q = Node::parameter(0.5).unwrap();
    let clamp_lo = q.clamp(0.0, 1.0);
    let clamp_hi = q.clamp(0.0, 0.25);
    let mut clamp_set = compile(&[q], || vec![clamp_lo.clone(), clamp_hi.clone()]).unwrap();
    assert_eq!(clamp_set.kernel_count(), 2);

    let (clamp_values, _) = clamp_set.evaluate_jacobian(&[0.5]).unwrap();
    assert!((clamp_values[0] - 0.5).abs() < 1e-12, "clamp(0,1) at 0.5 should be unclamped, got {}", clamp_values[0]);
    assert!((clamp_values[1] - 0.25).abs() < 1e-12, "clamp(0,0.25) at 0.5 should clamp to 0.25, got {}", clamp_values[1]);
}

#[test]
fn circle_fit_recovers_center_and_radius() {
    let mut rng = rand::thread_rng();
    let (true_cx, true_cy, true_r) = (10.0_f64, -5.0_f64, 15.0_f64);

    let cx = Node::parameter(0.0).unwrap();
    let cy = Node::parameter(0.0).unwrap();
    let r = Node::parameter(5.0).unwrap();
    let params = vec![cx.clone(), cy.clone(), r.clone()];

    let roots: Vec<Node> = (0..100)
        .map(|_| {
            let theta: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
            let noise: f64 = rng.gen_range(-0.25..0.25);
            let x = true_cx + (true_r + noise) * theta.cos();
            let y = true_cy + (true_r + noise) * theta.sin();
            let dx = Node::sub(&Node::constant(x).unwrap(), &cx);
            let dy = Node::sub(&Node::constant(y).unwrap(), &cy);
            let dist = Node::add(&dx.square(), &dy.square()).sqrt().unwrap();
            Node::sub(&dist, &r)
        })
        .collect();

    let mut set = compile(&params, || roots.clone()).unwrap();
    let result = nonlinear_least_squares(&[0.0, 0.0, 5.0], &mut set, &LmOptions::default()).unwrap();

    assert!(result.iterations < 30);
    assert!(result.final_cost < 1e-2);
    assert!((result.parameters[0] - true_cx).abs() < 0.1);
    assert!((result.parameters[1] - true_cy).abs() < 0.1);
    assert!((result.parameters[2] - true_r).abs() < 0.1);
}

#[test]
fn exponential_fit_recovers_parameters_within_two_percent() {
    let mut rng = rand::thread_rng();
    let (true_a, true_b) = (2.0_f64, 0.5_f64);

    let a = Node::parameter(1.0).unwrap();
    let b = Node::parameter(0.1).unwrap();
    let params = vec![a.clone(), b.clone()];

    let roots: Vec<Node> = (0..100)
        .map(|i| {
            let x = 10.0 * i as f64 / 99.0;
            let noise: f64 = rng.gen_range(-0.05..0.05);
            let y = true_a * (true_b * x).exp() + noise;
            let bx = Node::mul(&b, &Node::constant(x).unwrap());
            let model = Node::mul(&a, &bx.exp());
            Node::sub(&model, &Node::constant(y).unwrap())
        })
        .collect();

    let mut set = compile(&params, || roots.clone()).unwrap();
    let result = nonlinear_least_squares(&[1.0, 0.1], &mut set, &LmOptions::default()).unwrap();

    assert!(result.final_cost < 0.5);
    assert!((result.parameters[0] - true_a).abs() / true_a < 0.02);
    assert!((result.parameters[1] - true_b).abs() / true_b < 0.02);
}

// ---- operator-catalog finite-difference audit -----------------------------
//
// Each `build` fn takes the case's parameter slice and returns the residual
// root; the same fn serves both the analytic path (compiled through a real
// `Kernel` via `compile`/`evaluate_jacobian`) and the finite-difference probe
// (evaluated directly via `Node::value`), so there is exactly one place per
// operator that describes its graph shape.

fn op_square(p: &[Node]) -> Node {
    p[0].square()
}
fn op_cube(p: &[Node]) -> Node {
    p[0].cube()
}
fn op_exp(p: &[Node]) -> Node {
    p[0].exp()
}
fn op_sin(p: &[Node]) -> Node {
    p[0].sin()
}
fn op_tanh(p: &[Node]) -> Node {
    p[0].tanh()
}
fn op_sigmoid(p: &[Node]) -> Node {
    p[0].sigmoid()
}
fn op_neg(p: &[Node]) -> Node {
    p[0].neg()
}
fn op_cos(p: &[Node]) -> Node {
    p[0].cos()
}
fn op_tan(p: &[Node]) -> Node {
    p[0].tan()
}
fn op_asin(p: &[Node]) -> Node {
    p[0].asin()
}
fn op_acos(p: &[Node]) -> Node {
    p[0].acos()
}
fn op_atan(p: &[Node]) -> Node {
    p[0].atan()
}
fn op_relu(p: &[Node]) -> Node {
    p[0].relu()
}
fn op_softplus(p: &[Node]) -> Node {
    p[0].softplus()
}
fn op_reciprocal(p: &[Node]) -> Node {
    p[0].reciprocal().unwrap()
}
fn op_log(p: &[Node]) -> Node {
    p[0].log().unwrap()
}
fn op_sqrt(p: &[Node]) -> Node {
    p[0].sqrt().unwrap()
}
fn op_pow_const(p: &[Node]) -> Node {
    p[0].pow_const(3.0).unwrap()
}
fn op_clamp(p: &[Node]) -> Node {
    p[0].clamp(0.0, 1.0)
}
fn op_div(p: &[Node]) -> Node {
    Node::div(&p[0], &p[1]).unwrap()
}
fn op_min(p: &[Node]) -> Node {
    Node::min(&p[0], &p[1])
}
fn op_max(p: &[Node]) -> Node {
    Node::max(&p[0], &p[1])
}
fn op_mod(p: &[Node]) -> Node {
    Node::modulo(&p[0], &p[1])
}
fn op_pow_value(p: &[Node]) -> Node {
    Node::pow_value(&p[0], &p[1])
}
fn op_sum(p: &[Node]) -> Node {
    Node::sum(p)
}
fn op_mean(p: &[Node]) -> Node {
    Node::mean(p)
}
fn op_if_then_else(p: &[Node]) -> Node {
    Node::if_then_else(&p[0], &p[1], &p[2])
}
fn op_custom(p: &[Node]) -> Node {
    Node::custom(
        "square_via_custom",
        p,
        std::rc::Rc::new(|vals: &[f64]| vals[0] * vals[0]),
        std::rc::Rc::new(|vals: &[f64], g: f64| vec![2.0 * vals[0] * g]),
    )
}

/// Compiles `build`'s residual for `inputs` and returns the kernel-dispatched
/// value and per-parameter gradient row (the property's "emitted kernel's
/// gradient", not just `backward`'s).
fn kernel_value_and_gradient(inputs: &[f64], build: fn(&[Node]) -> Node) -> (f64, Vec<f64>) {
    let params: Vec<Node> = inputs.iter().map(|&x| Node::parameter(x).unwrap()).collect();
    let root = build(&params);
    let mut set = compile(&params, || vec![root.clone()]).unwrap();
    let (values, jacobian) = set.evaluate_jacobian(inputs).unwrap();
    (values[0], jacobian[0].clone())
}

/// Central finite difference of `build` with respect to input `i`, evaluated
/// by rebuilding fresh parameter nodes at the perturbed points.
fn finite_difference_at(inputs: &[f64], i: usize, build: fn(&[Node]) -> Node) -> f64 {
    let eps = 1e-6;
    let eval = |values: &[f64]| -> f64 {
        let params: Vec<Node> = values.iter().map(|&x| Node::parameter(x).unwrap()).collect();
        build(&params).value()
    };
    let mut plus = inputs.to_vec();
    plus[i] += eps;
    let mut minus = inputs.to_vec();
    minus[i] -= eps;
    (eval(&plus) - eval(&minus)) / (2.0 * eps)
}

fn assert_matches_finite_difference(name: &str, inputs: &[f64], build: fn(&[Node]) -> Node) {
    let (value, grad) = kernel_value_and_gradient(inputs, build);
    assert!(value.is_finite(), "{name}{inputs:?}: kernel value is not finite ({value})");
    for i in 0..inputs.len() {
        let fd = finite_difference_at(inputs, i, build);
        assert!(
            (grad[i] - fd).abs() < 1e-4,
            "{name}{inputs:?} wrt input {i}: analytic={} fd={fd}",
            grad[i]
        );
    }
}

#[test]
fn operator_catalog_gradients_match_finite_differences() {
    let cases: Vec<(&str, Vec<f64>, fn(&[Node]) -> Node)> = vec![
        ("square", vec![2.0], op_square),
        ("square", vec![-2.0], op_square),
        ("square", vec![0.0001], op_square),
        ("cube", vec![1.5], op_cube),
        ("cube", vec![-1.5], op_cube),
        ("cube", vec![0.0001], op_cube),
        ("exp", vec![0.5], op_exp),
        ("exp", vec![-0.5], op_exp),
        ("exp", vec![0.0001], op_exp),
        ("sin", vec![0.3], op_sin),
        ("sin", vec![-0.3], op_sin),
        ("sin", vec![0.0001], op_sin),
        ("tanh", vec![0.7], op_tanh),
        ("tanh", vec![-0.7], op_tanh),
        ("tanh", vec![0.0001], op_tanh),
        ("sigmoid", vec![0.7], op_sigmoid),
        ("sigmoid", vec![-0.7], op_sigmoid),
        ("sigmoid", vec![0.0001], op_sigmoid),
        ("neg", vec![2.0], op_neg),
        ("neg", vec![-2.0], op_neg),
        ("neg", vec![0.0001], op_neg),
        ("cos", vec![0.3], op_cos),
        ("cos", vec![-0.3], op_cos),
        ("cos", vec![0.0001], op_cos),
        ("tan", vec![0.3], op_tan),
        ("tan", vec![-0.3], op_tan),
        ("tan", vec![0.0001], op_tan),
        ("asin", vec![0.5], op_asin),
        ("asin", vec![-0.5], op_asin),
        ("asin", vec![0.0001], op_asin),
        ("acos", vec![0.5], op_acos),
        ("acos", vec![-0.5], op_acos),
        ("acos", vec![0.0001], op_acos),
        ("atan", vec![1.0], op_atan),
        ("atan", vec![-1.0], op_atan),
        ("atan", vec![0.0001], op_atan),
        ("relu", vec![2.0], op_relu),
        ("relu", vec![-2.0], op_relu),
        ("relu", vec![0.5], op_relu),
        ("softplus", vec![2.0], op_softplus),
        ("softplus", vec![-2.0], op_softplus),
        ("softplus", vec![0.0001], op_softplus),
        ("reciprocal", vec![2.0], op_reciprocal),
        ("reciprocal", vec![-2.0], op_reciprocal),
        ("reciprocal", vec![0.05], op_reciprocal),
        ("log", vec![5.0], op_log),
        ("log", vec![0.5], op_log),
        ("log", vec![0.01], op_log),
        ("sqrt", vec![9.0], op_sqrt),
        ("sqrt", vec![2.0], op_sqrt),
        ("sqrt", vec![0.0001], op_sqrt),
        ("pow_const", vec![2.0], op_pow_const),
        ("pow_const", vec![-2.0], op_pow_const),
        ("pow_const", vec![0.0001], op_pow_const),
        ("clamp_inside", vec![0.5], op_clamp),
        ("clamp_below", vec![-0.5], op_clamp),
        ("clamp_above", vec![1.5], op_clamp),
        ("div", vec![4.0, 2.0], op_div),
        ("div", vec![-4.0, 2.0], op_div),
        ("div", vec![0.0007, 0.3], op_div),
        ("min", vec![1.0, 2.0], op_min),
        ("min", vec![-1.0, -2.0], op_min),
        ("min", vec![0.0001, 0.0002], op_min),
        ("max", vec![1.0, 2.0], op_max),
        ("max", vec![-1.0, -2.0], op_max),
        ("max", vec![0.0001, 0.0002], op_max),
        ("mod", vec![5.5, 2.0], op_mod),
        ("mod", vec![-5.5, 2.0], op_mod),
        ("mod", vec![0.0007, 0.3], op_mod),
        ("pow_value", vec![2.0, 3.0], op_pow_value),
        ("pow_value", vec![2.0, -1.5], op_pow_value),
        ("pow_value", vec![0.0001, 2.0], op_pow_value),
        ("sum", vec![1.0, -2.0, 0.0003], op_sum),
        ("mean", vec![4.0, -4.0, 0.0002], op_mean),
        ("if_then_else_then_positive", vec![1.0, 3.0, -2.0], op_if_then_else),
        ("if_then_else_then_negative_cond", vec![-1.0, 3.0, -2.0], op_if_then_else),
        ("if_then_else_else_branch", vec![0.0, 3.0, -2.0], op_if_then_else),
        ("custom", vec![3.0], op_custom),
    ];

    for (name, inputs, build) in cases {
        assert_matches_finite_difference(name, &inputs, build);
    }
}

#[test]
fn division_by_near_zero_raises_domain_error() {
    let a = Node::parameter(1.0).unwrap();
    let b = Node::constant(1e-13).unwrap();
    let result = Node::div(&a, &b);
    assert!(matches!(result, Err(Error::Domain(DomainError::DivisionByNearZero(_)))));
}

#[test]
fn log_of_zero_raises_domain_error() {
    let a = Node::constant(0.0).unwrap();
    let result = a.log();
    assert!(matches!(result, Err(Error::Domain(DomainError::LogOfNonPositive(_)))));
}

#[test]
fn abs_at_zero_has_pinned_positive_gradient() {
    let p = Node::parameter(0.0).unwrap();
    let out = p.abs();
    backward(&out);
    assert_eq!(p.grad(), 1.0);
}

#[test]
fn no_grad_scope_restores_on_early_return_from_domain_error() {
    let a = Node::parameter(1.0).unwrap();
    let b = Node::constant(0.0).unwrap();
    let result: Result<(), Error> = with_no_grad(|| {
        let _ = Node::div(&a, &b)?;
        Ok(())
    });
    assert!(result.is_err());
    assert!(scalarflow::node::grad_enabled());
}
