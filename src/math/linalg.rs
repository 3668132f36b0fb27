//! Hand-rolled linear algebra over `ndarray` buffers.
//!
//! Everything here is total: near-singular matrices invert to the identity,
//! collapsed power iterations report 0, and non-finite values sanitize to
//! zero. Each substitution emits a `tracing` warning so the degradation is
//! observable without breaking the caller.

use ndarray::{Array1, Array2, Axis};

/// Pivot magnitudes below this are treated as singular.
pub const PIVOT_EPS: f32 = 1e-10;

/// Iterated-vector norms below this abort the power iteration.
pub const NORM_EPS: f32 = 1e-10;

/// Gauss-Jordan inverse with partial pivoting.
///
/// Returns `None` when the matrix is non-square or any pivot magnitude
/// drops below [`PIVOT_EPS`].
pub fn try_invert(m: &Array2<f32>) -> Option<Array2<f32>> {
    let n = m.nrows();
    if n == 0 || m.ncols() != n {
        return None;
    }
    if m.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mut a = m.clone();
    let mut inv: Array2<f32> = Array2::eye(n);

    for col in 0..n {
        // Partial pivot: largest magnitude in this column at or below the
        // diagonal.
        let mut pivot_row = col;
        let mut pivot_mag = a[[col, col]].abs();
        for row in (col + 1)..n {
            let mag = a[[row, col]].abs();
            if mag > pivot_mag {
                pivot_row = row;
                pivot_mag = mag;
            }
        }
        if pivot_mag < PIVOT_EPS {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                a.swap([col, k], [pivot_row, k]);
                inv.swap([col, k], [pivot_row, k]);
            }
        }

        let pivot = a[[col, col]];
        for k in 0..n {
            a[[col, k]] /= pivot;
            inv[[col, k]] /= pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                let a_ck = a[[col, k]];
                let i_ck = inv[[col, k]];
                a[[row, k]] -= factor * a_ck;
                inv[[row, k]] -= factor * i_ck;
            }
        }
    }

    Some(inv)
}

/// Total inverse: identity fallback on singular/ill-formed input.
///
/// The fallback keeps the forecasting loop producing (possibly degraded)
/// values instead of crashing; the event is logged at `warn`.
pub fn invert(m: &Array2<f32>) -> Array2<f32> {
    match try_invert(m) {
        Some(inv) => inv,
        None => {
            tracing::warn!(
                rows = m.nrows(),
                cols = m.ncols(),
                "near-singular matrix: substituting identity inverse"
            );
            Array2::eye(m.nrows())
        }
    }
}

/// Dominant-eigenvalue estimate by power iteration (Rayleigh quotient of
/// the converged direction).
///
/// Returns 0.0 when the iterated vector's norm collapses below
/// [`NORM_EPS`] — e.g. for nilpotent or zero matrices.
pub fn max_eigenvalue(m: &Array2<f32>, iterations: usize) -> f32 {
    let n = m.nrows();
    if n == 0 || m.ncols() != n {
        return 0.0;
    }

    let mut v = Array1::from_elem(n, 1.0 / (n as f32).sqrt());
    for _ in 0..iterations {
        let w = m.dot(&v);
        let norm = w.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < NORM_EPS || !norm.is_finite() {
            tracing::warn!(norm, "power iteration collapsed: reporting eigenvalue 0");
            return 0.0;
        }
        v = w / norm;
    }

    v.dot(&m.dot(&v))
}

/// Outer product `a · bᵗ` of two vectors.
pub fn outer(a: &Array1<f32>, b: &Array1<f32>) -> Array2<f32> {
    let col = a.view().insert_axis(Axis(1));
    let row = b.view().insert_axis(Axis(0));
    col.dot(&row)
}

/// Clamp every component into ±`limit` and zero anything non-finite.
pub fn sanitize(mut v: Array1<f32>, limit: f32) -> Array1<f32> {
    for x in v.iter_mut() {
        if !x.is_finite() {
            tracing::warn!("non-finite state component: substituting 0");
            *x = 0.0;
        } else {
            *x = x.clamp(-limit, limit);
        }
    }
    v
}
