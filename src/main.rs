//! Demo/CLI binary (C9) for the scalar autodiff engine and its Levenberg–
//! Marquardt / L-BFGS solvers. Mirrors the teacher's `Args { mode, visualize }`
//! pattern with a `Scenario` selector over the three end-to-end curve-fitting
//! scenarios.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use rand::Rng;

use scalarflow::{compile, lm, nonlinear_least_squares_with_history, viz, LmOptions, Node};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(value_enum)]
    scenario: Scenario,

    #[arg(short, long)]
    visualize: bool,

    #[arg(long)]
    plot: Option<PathBuf>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Circle,
    Rosenbrock,
    Expfit,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let (result, history, root) = match args.scenario {
        Scenario::Circle => run_circle_fit()?,
        Scenario::Rosenbrock => run_rosenbrock()?,
        Scenario::Expfit => run_exponential_fit()?,
    };

    println!(
        "converged={} iterations={} final_cost={:.6e} reason={:?}",
        result.success, result.iterations, result.final_cost, result.convergence_reason
    );
    println!("parameters: {:?}", result.parameters);

    if args.visualize {
        println!("{}", viz::draw_ascii(&root));
    }

    if let Some(path) = args.plot {
        plot_cost_history(&history, &path)?;
        println!("wrote convergence plot to {}", path.display());
    }

    Ok(())
}

/// Scenario 1: fit a circle's center and radius to 100 noisy points sampled
/// from center (10, -5), radius 15, with +/-0.25 noise.
fn run_circle_fit() -> Result<(lm::LmResult, Vec<f64>, Node)> {
    let mut rng = rand::thread_rng();
    let (true_cx, true_cy, true_r) = (10.0, -5.0, 15.0);

    let mut points = Vec::with_capacity(100);
    for _ in 0..100 {
        let theta: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        let noise: f64 = rng.gen_range(-0.25..0.25);
        let x = true_cx + (true_r + noise) * theta.cos();
        let y = true_cy + (true_r + noise) * theta.sin();
        points.push((x, y));
    }

    let cx = Node::parameter(0.0)?;
    let cy = Node::parameter(0.0)?;
    let r = Node::parameter(5.0)?;
    let params = vec![cx.clone(), cy.clone(), r.clone()];

    let roots = points
        .iter()
        .map(|&(x, y)| {
            let dx = Node::sub(&Node::constant(x)?, &cx);
            let dy = Node::sub(&Node::constant(y)?, &cy);
            let dist = Node::add(&dx.square(), &dy.square()).sqrt()?;
            Ok(Node::sub(&dist, &r))
        })
        .collect::<scalarflow::Result<Vec<Node>>>()?;

    let mut set = compile(&params, || roots.clone())?;
    let root = roots[0].clone();
    let (result, history) =
        nonlinear_least_squares_with_history(&[0.0, 0.0, 5.0], &mut set, &LmOptions::default())?;
    Ok((result, history, root))
}

/// Scenario 2: classic Rosenbrock residuals, starting at (-1.2, 1.0).
fn run_rosenbrock() -> Result<(lm::LmResult, Vec<f64>, Node)> {
    let x = Node::parameter(-1.2)?;
    let y = Node::parameter(1.0)?;
    let params = vec![x.clone(), y.clone()];

    let r1 = Node::sub(&Node::constant(1.0)?, &x);
    let r2 = Node::mul(&Node::constant(10.0)?, &Node::sub(&y, &x.square()));
    let roots = vec![r1, r2];

    let mut set = compile(&params, || roots.clone())?;
    let root = roots[1].clone();
    let (result, history) = nonlinear_least_squares_with_history(&[-1.2, 1.0], &mut set, &LmOptions::default())?;
    Ok((result, history, root))
}

/// Scenario 3: fit `y = a * exp(b * x)` (a=2, b=0.5) to 100 noisy samples
/// over x in [0, 10], starting from a=1, b=0.1.
fn run_exponential_fit() -> Result<(lm::LmResult, Vec<f64>, Node)> {
    let mut rng = rand::thread_rng();
    let (true_a, true_b) = (2.0, 0.5);

    let mut samples = Vec::with_capacity(100);
    for i in 0..100 {
        let x = 10.0 * i as f64 / 99.0;
        let noise: f64 = rng.gen_range(-0.05..0.05);
        let y = true_a * (true_b * x).exp() + noise;
        samples.push((x, y));
    }

    let a = Node::parameter(1.0)?;
    let b = Node::parameter(0.1)?;
    let params = vec![a.clone(), b.clone()];

    let roots = samples
        .iter()
        .map(|&(x, y)| {
            let bx = Node::mul(&b, &Node::constant(x)?);
            let model = Node::mul(&a, &bx.exp());
            Ok(Node::sub(&model, &Node::constant(y)?))
        })
        .collect::<scalarflow::Result<Vec<Node>>>()?;

    let mut set = compile(&params, || roots.clone())?;
    let root = roots[0].clone();
    let (result, history) = nonlinear_least_squares_with_history(&[1.0, 0.1], &mut set, &LmOptions::default())?;
    Ok((result, history, root))
}

fn plot_cost_history(history: &[f64], path: &PathBuf) -> Result<()> {
    use plotters::prelude::*;

    let root = BitMapBackend::new(path, (800, 480)).into_drawing_area();
    root.fill(&WHITE)?;

    let max_cost = history.iter().cloned().fold(f64::MIN_POSITIVE, f64::max).max(1e-12);
    let mut chart = ChartBuilder::on(&root)
        .caption("cost per accepted LM step", ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(0..history.len().max(1), (1e-16..max_cost * 1.1).log_scale())?;

    chart.configure_mesh().y_desc("cost").x_desc("iteration").draw()?;
    chart.draw_series(LineSeries::new(history.iter().enumerate().map(|(i, &c)| (i, c.max(1e-16))), &RED))?;

    root.present()?;
    Ok(())
}
