//! Nonlinear least squares examples for the multilarge trust region solver.
//!
//! `multilarge_examples(k)` runs example k:
//! 0 - exponential decay fit with many residuals, every subproblem method
//! 1 - Rosenbrock function from the classical starting point (-1.2, 1)
//! 2 - weighted fit, covariance of the parameters and iteration history saved to csv
//! 3 - solver configuration read from a parameter document
use crate::numerical::multilarge::error::Result;
use crate::numerical::multilarge::fdf::MultilargeFdf;
use crate::numerical::multilarge::parameters::{MultilargeParameters, TrsKind};
use crate::numerical::multilarge::workspace::MultilargeWorkspace;
use nalgebra::{DMatrixViewMut, DVector, dvector};
use strum::IntoEnumIterator;

/// synthetic data y_i = 5 exp(-0.1 t_i) + 1 plus a small deterministic perturbation, t_i = 40 i / n
pub fn exponential_data(n: usize) -> (Vec<f64>, Vec<f64>) {
    let t: Vec<f64> = (0..n).map(|i| 40.0 * i as f64 / n as f64).collect();
    let y = t
        .iter()
        .enumerate()
        .map(|(i, ti)| 5.0 * (-0.1 * ti).exp() + 1.0 + 0.05 * (0.37 * i as f64).sin())
        .collect();
    (t, y)
}

/// f_i = A exp(-lambda t_i) + b - y_i with x = (A, lambda, b), analytic Jacobian and fvv
pub fn exponential_problem(t: Vec<f64>, y: Vec<f64>) -> MultilargeFdf {
    let n = t.len();
    let (tf, tj, tv) = (t.clone(), t.clone(), t);
    MultilargeFdf::new(n, 3, move |x: &DVector<f64>, f: &mut DVector<f64>| {
        for i in 0..tf.len() {
            f[i] = x[0] * (-x[1] * tf[i]).exp() + x[2] - y[i];
        }
        Ok(())
    })
    .with_jacobian(move |x: &DVector<f64>, row0: usize, mut block: DMatrixViewMut<f64>| {
        for i in 0..block.nrows() {
            let ti = tj[row0 + i];
            let e = (-x[1] * ti).exp();
            block[(i, 0)] = e;
            block[(i, 1)] = -x[0] * ti * e;
            block[(i, 2)] = 1.0;
        }
        Ok(())
    })
    .with_fvv(
        move |x: &DVector<f64>, v: &DVector<f64>, fvv: &mut DVector<f64>| {
            for i in 0..tv.len() {
                let ti = tv[i];
                let e = (-x[1] * ti).exp();
                fvv[i] = -2.0 * v[0] * v[1] * ti * e + v[1] * v[1] * x[0] * ti * ti * e;
            }
            Ok(())
        },
    )
}

/// f = (10 (x2 - x1^2), 1 - x1)
pub fn rosenbrock_problem() -> MultilargeFdf {
    MultilargeFdf::new(2, 2, |x: &DVector<f64>, f: &mut DVector<f64>| {
        f[0] = 10.0 * (x[1] - x[0] * x[0]);
        f[1] = 1.0 - x[0];
        Ok(())
    })
    .with_jacobian(|x: &DVector<f64>, row0: usize, mut block: DMatrixViewMut<f64>| {
        for i in 0..block.nrows() {
            match row0 + i {
                0 => {
                    block[(i, 0)] = -20.0 * x[0];
                    block[(i, 1)] = 10.0;
                }
                _ => {
                    block[(i, 0)] = -1.0;
                    block[(i, 1)] = 0.0;
                }
            }
        }
        Ok(())
    })
    .with_fvv(|_x: &DVector<f64>, v: &DVector<f64>, fvv: &mut DVector<f64>| {
        fvv[0] = -20.0 * v[0] * v[0];
        fvv[1] = 0.0;
        Ok(())
    })
}

/// Fits the exponential model to `n` synthetic points with the given method.
pub fn solve_exponential(n: usize, params: MultilargeParameters) -> Result<MultilargeWorkspace> {
    let (t, y) = exponential_data(n);
    let mut w = MultilargeWorkspace::new(params, n, 3)?;
    w.init(&dvector![1.0, 1.0, 0.0], exponential_problem(t, y))?;
    w.driver(200, 1e-8, 1e-8, 0.0, None)?;
    Ok(w)
}

pub fn multilarge_examples(example: usize) {
    match example {
        0 => {
            let n = 100_000;
            for trs in TrsKind::iter() {
                let params = MultilargeParameters::default().with_trs(trs);
                match solve_exponential(n, params) {
                    Ok(w) => println!(
                        "{:<10} {} iterations, x = {:?}, ||f|| = {:.6e}",
                        trs.to_string(),
                        w.niter(),
                        w.position().as_slice(),
                        w.normf()
                    ),
                    Err(e) => println!("{:<10} failed: {}", trs.to_string(), e),
                }
            }
        }
        1 => {
            for trs in TrsKind::iter() {
                let params = MultilargeParameters::default().with_trs(trs);
                let run = || -> Result<MultilargeWorkspace> {
                    let mut w = MultilargeWorkspace::new(params, 2, 2)?;
                    w.init(&dvector![-1.2, 1.0], rosenbrock_problem())?;
                    w.driver(500, 1e-12, 1e-12, 0.0, None)?;
                    Ok(w)
                };
                match run() {
                    Ok(w) => {
                        let fdf = w.fdf();
                        println!(
                            "{}: {} iterations, x = {:?}, nevalf = {:?}, nevaldf = {:?}",
                            w.name(),
                            w.niter(),
                            w.position().as_slice(),
                            fdf.map(|f| f.nevalf),
                            fdf.map(|f| f.nevaldf)
                        );
                    }
                    Err(e) => println!("{}: failed: {}", trs, e),
                }
            }
        }
        2 => {
            let n = 500;
            let (t, y) = exponential_data(n);
            // later points are trusted less
            let weights = DVector::from_iterator(n, t.iter().map(|ti| 1.0 / (1.0 + 0.1 * ti)));
            let params = MultilargeParameters::default().with_trs(TrsKind::LmAccel);
            let run = || -> Result<MultilargeWorkspace> {
                let mut w = MultilargeWorkspace::new(params, n, 3)?;
                w.set_log_level("info");
                w.enable_history();
                w.winit(&dvector![1.0, 1.0, 0.0], &weights, exponential_problem(t, y))?;
                let mut report = |iter: usize, w: &MultilargeWorkspace| {
                    println!(
                        "iter {:>3}: ||f|| = {:.6e}, |a|/|v| = {:.3}, delta = {:.3e}",
                        iter,
                        w.normf(),
                        w.avratio(),
                        w.trust().delta()
                    )
                };
                w.driver(200, 1e-8, 1e-8, 0.0, Some(&mut report))?;
                Ok(w)
            };
            match run() {
                Ok(mut w) => {
                    println!("x = {:?}", w.position().as_slice());
                    match w.covariance(0.0) {
                        Ok(covar) => println!("covariance = {}", covar),
                        Err(e) => println!("covariance failed: {}", e),
                    }
                    match w.rcond() {
                        Ok(rc) => println!("1/cond(J) = {:e}", rc),
                        Err(e) => println!("rcond failed: {}", e),
                    }
                    if let Some(history) = w.history() {
                        match history.save_to_csv("multilarge_history.csv") {
                            Ok(()) => println!("{} iterations saved", history.len()),
                            Err(e) => println!("cannot save history: {}", e),
                        }
                    }
                }
                Err(e) => println!("weighted fit failed: {}", e),
            }
        }
        3 => {
            let document = "trust_region\n trs: ddogleg\n scale: marquardt\n solver: qr\n block_rows: 64\ndriver\n maxiter: 100\n xtol: 1e-10\n gtol: 1e-10\n";
            let (params, settings) = match MultilargeParameters::from_document(document) {
                Ok(parsed) => parsed,
                Err(e) => {
                    println!("{}", e);
                    return;
                }
            };
            let n = 2000;
            let (t, y) = exponential_data(n);
            let run = || -> Result<MultilargeWorkspace> {
                let mut w = MultilargeWorkspace::new(params, n, 3)?;
                w.init(&dvector![1.0, 1.0, 0.0], exponential_problem(t, y))?;
                let info = w.driver_with(&settings, None)?;
                println!("stopped on {}", info);
                Ok(w)
            };
            match run() {
                Ok(w) => {
                    println!("{}: x = {:?}", w.name(), w.position().as_slice());
                    for (k, v) in w.statistics() {
                        println!("{}: {}", k, v);
                    }
                }
                Err(e) => println!("failed: {}", e),
            }
        }
        _ => println!("no example {}", example),
    }
}
