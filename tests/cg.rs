//! Conjugate gradients on top of the engine, as a solver would use it.

mod common;

use common::queues;
use shardex::{Queue, Reductor, Result, SpMat, Vector, inner_product};

/// `tridiag(-1, 2, -1)` of size `n`.
fn poisson(q: &[Queue], n: usize) -> SpMat<f64> {
    let mut row_ptr = vec![0];
    let mut col = Vec::new();
    let mut val = Vec::new();
    for i in 0..n {
        if i > 0 {
            col.push(i - 1);
            val.push(-1.0);
        }
        col.push(i);
        val.push(2.0);
        if i + 1 < n {
            col.push(i + 1);
            val.push(-1.0);
        }
        row_ptr.push(col.len());
    }
    SpMat::new(q, n, &row_ptr, &col, &val).unwrap()
}

/// Solves `A x = f` starting from `x`; returns the iteration count, or
/// `usize::MAX` if it did not converge.
fn cg(a: &SpMat<f64>, f: &Vector<f64>, x: &Vector<f64>, tol: f64) -> Result<usize> {
    let q = x.queues();
    let r = Vector::<f64>::new(q, x.len())?;
    let p = Vector::<f64>::new(q, x.len())?;
    let ap = Vector::<f64>::new(q, x.len())?;

    r.assign(f - a.product(x)?)?;
    p.assign(&r)?;
    let mut rho = inner_product(&r, &r)?;
    let max_abs = Reductor::max(q)?;

    for iter in 1..=x.len() * 2 {
        ap.assign(a.product(&p)?)?;
        let alpha = rho / inner_product(&p, &ap)?;
        x.assign_add(alpha * &p)?;
        r.assign_sub(alpha * &ap)?;
        if max_abs.apply(shardex::abs(&r))? < tol {
            return Ok(iter);
        }
        let next = inner_product(&r, &r)?;
        p.assign(&r + (next / rho) * &p)?;
        rho = next;
    }
    Ok(usize::MAX)
}

#[test]
fn test_cg_poisson() {
    for k in [1, 3] {
        let n = 64;
        let q = queues(k);
        let ctx = q[0].context().clone();
        let a = poisson(&q, n);
        let f = Vector::filled(&q, n, 1.0).unwrap();
        let x = Vector::<f64>::new(&q, n).unwrap();

        let iters = cg(&a, &f, &x, 1e-8).unwrap();
        assert!(iters <= 2 * n, "k={}: no convergence", k);

        // Residual checked independently on the host.
        let xs = x.to_vec().unwrap();
        for i in 0..n {
            let left = if i > 0 { xs[i - 1] } else { 0.0 };
            let right = if i + 1 < n { xs[i + 1] } else { 0.0 };
            let residual = 1.0 - (2.0 * xs[i] - left - right);
            assert!(residual.abs() < 1e-6, "row {}: residual {}", i, residual);
        }

        // Exact solution of the discrete problem: x_i = (i + 1)(n - i) / 2.
        let mid = n / 2;
        let exact = ((mid + 1) * (n - mid)) as f64 / 2.0;
        assert!((xs[mid] - exact).abs() < 1e-4 * exact);

        // The loop body reuses a handful of kernels.
        assert!(ctx.cached_kernels() <= 10, "{} kernels", ctx.cached_kernels());
    }
}
