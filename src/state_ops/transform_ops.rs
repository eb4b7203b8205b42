//! Representation changes: vector to density matrix promotion, the
//! best-effort rank-1 recovery used by `contract`, and the occupation
//! estimates used for truncation decisions.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::state_ops::tensor_ops::{norm, normalize};
use crate::{iter_mut, Precision};
use num_complex::Complex;
use num_traits::Zero;

/// Promote a `(D, 1)` state vector to its density matrix `psi psi^dag`.
pub fn expand_vector<P: Precision>(psi: &[Complex<P>]) -> Vec<Complex<P>> {
    let d = psi.len();
    let mut out = vec![Complex::zero(); d * d];
    iter_mut!(out).enumerate().for_each(|(idx, slot)| {
        *slot = psi[idx / d] * psi[idx % d].conj();
    });
    out
}

/// Attempt to recover a state vector from a `(d, d)` density matrix.
///
/// The matrix is accepted as rank-1 when its purity `Re tr(rho^2)` is
/// within `tol` of 1 and the dominant eigenvector (power iteration)
/// reproduces the matrix entrywise within `sqrt(tol)`. The recovered
/// vector has its largest component rotated to the positive real axis.
///
/// Returns `None` when the matrix is mixed; callers treat that as a
/// silent no-op, never an error.
pub fn contract_matrix<P: Precision>(
    rho: &[Complex<P>],
    d: usize,
    tol: P,
) -> Option<Vec<Complex<P>>> {
    let purity: P = (0..d)
        .map(|i| {
            (0..d)
                .map(|j| (rho[i * d + j] * rho[j * d + i]).re)
                .sum::<P>()
        })
        .sum();
    if (purity - P::one()).abs() > tol {
        return None;
    }

    // Power iteration from the column under the largest diagonal entry.
    // A rank-1 matrix converges in a single application.
    let mut start = 0;
    for i in 1..d {
        if rho[i * d + i].re > rho[start * d + start].re {
            start = i;
        }
    }
    let mut v: Vec<Complex<P>> = (0..d).map(|i| rho[i * d + start]).collect();
    if norm(&v).is_zero() {
        return None;
    }
    normalize(&mut v);
    for _ in 0..32 {
        let mut w: Vec<Complex<P>> = (0..d)
            .map(|i| (0..d).map(|j| rho[i * d + j] * v[j]).sum())
            .collect();
        let n = norm(&w);
        if n.is_zero() {
            return None;
        }
        w.iter_mut().for_each(|x| *x = x.unscale(n));
        let delta: P = w
            .iter()
            .zip(v.iter())
            .map(|(a, b)| (*a - *b).norm_sqr())
            .sum();
        v = w;
        if delta.sqrt() < tol {
            break;
        }
    }

    // Fix the global phase so the recovered vector is reproducible.
    let mut largest = 0;
    for i in 1..d {
        if v[i].norm_sqr() > v[largest].norm_sqr() {
            largest = i;
        }
    }
    let mag = v[largest].norm();
    if mag.is_zero() {
        return None;
    }
    let phase = v[largest].unscale(mag).conj();
    v.iter_mut().for_each(|x| *x = *x * phase);

    let residual_tol = tol.sqrt();
    for i in 0..d {
        for j in 0..d {
            let residual = (v[i] * v[j].conj() - rho[i * d + j]).norm();
            if residual > residual_tol {
                return None;
            }
        }
    }
    Some(v)
}

fn occupation_eps<P: Precision>() -> P {
    P::from(1e-10).unwrap()
}

/// Highest basis index carrying population in a marginal vector
/// (amplitudes or populations); 0 for a numerically empty array.
pub fn highest_occupation_vector<P: Precision>(v: &[Complex<P>]) -> usize {
    let eps = occupation_eps::<P>();
    (0..v.len()).rev().find(|&i| v[i].norm() > eps).unwrap_or(0)
}

/// Highest diagonal index carrying population in a `(d, d)` marginal
/// density matrix; 0 for a numerically empty array.
pub fn highest_occupation_matrix<P: Precision>(m: &[Complex<P>], d: usize) -> usize {
    let eps = occupation_eps::<P>();
    (0..d).rev().find(|&i| m[i * d + i].norm() > eps).unwrap_or(0)
}
