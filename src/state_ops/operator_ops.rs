//! Operator and channel application restricted to a subset of tensor
//! axes. The mixed-radix generalization of applying a gate matrix to a
//! chosen set of qubit indices in a flat state buffer.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::utils::{full_to_sub, sub_to_full, AxisVec};
use crate::{iter_mut, Precision};
use num_complex::Complex;
use num_traits::Zero;

/// Contract `op` (shape `(Ds, Ds)` over `axes`, `axes[0]` most
/// significant) into the tensor `input` of shape `dims`. With `conj_op`
/// the elementwise conjugate of `op` is applied instead, which is the
/// column-side factor of `K rho K^dag`.
pub(crate) fn apply_on_axes<P: Precision>(
    dims: &[usize],
    axes: &[usize],
    input: &[Complex<P>],
    op: &[Complex<P>],
    conj_op: bool,
) -> Vec<Complex<P>> {
    let ds: usize = axes.iter().map(|&a| dims[a]).product();
    let mut out = vec![Complex::zero(); input.len()];
    iter_mut!(out).enumerate().for_each(|(i, slot)| {
        let row = full_to_sub(dims, axes, i);
        let mut acc = Complex::zero();
        for col in 0..ds {
            let m = op[row * ds + col];
            let m = if conj_op { m.conj() } else { m };
            if !m.is_zero() {
                acc += m * input[sub_to_full(dims, axes, col, i)];
            }
        }
        *slot = acc;
    });
    out
}

/// Apply an operator to the `targets` axes of a state vector. The
/// operator is tensored in the order of `targets`.
pub fn apply_operator_vector<P: Precision>(
    dims: &[usize],
    targets: &[usize],
    state: &[Complex<P>],
    op: &[Complex<P>],
) -> Vec<Complex<P>> {
    apply_on_axes(dims, targets, state, op, false)
}

/// Apply `K rho K^dag` restricted to the `targets` axes of a density
/// matrix stored as a flat `(D, D)` array.
pub fn apply_operator_matrix<P: Precision>(
    dims: &[usize],
    targets: &[usize],
    state: &[Complex<P>],
    op: &[Complex<P>],
) -> Vec<Complex<P>> {
    let n = dims.len();
    let full_dims: AxisVec = dims.iter().chain(dims.iter()).copied().collect();
    let col_axes: AxisVec = targets.iter().map(|&t| t + n).collect();
    let rows_applied = apply_on_axes(&full_dims, targets, state, op, false);
    apply_on_axes(&full_dims, &col_axes, &rows_applied, op, true)
}

/// Apply a Kraus channel `sum_i K_i rho K_i^dag` restricted to the
/// `targets` axes. Completeness of the family is the caller's business;
/// see [`kraus_identity_check`].
pub fn apply_kraus_matrix<P: Precision>(
    dims: &[usize],
    targets: &[usize],
    state: &[Complex<P>],
    operators: &[Vec<Complex<P>>],
) -> Vec<Complex<P>> {
    let mut out = vec![Complex::zero(); state.len()];
    for op in operators {
        let term = apply_operator_matrix(dims, targets, state, op);
        out.iter_mut().zip(term.iter()).for_each(|(o, t)| *o += *t);
    }
    out
}

/// Verify the completeness relation `sum_i K_i^dag K_i = I` for a family
/// of `(d, d)` operators, entrywise within `tol`.
pub fn kraus_identity_check<P: Precision>(operators: &[Vec<Complex<P>>], d: usize, tol: P) -> bool {
    let mut acc = vec![Complex::<P>::zero(); d * d];
    for op in operators {
        for i in 0..d {
            for j in 0..d {
                let mut sum = Complex::zero();
                for m in 0..d {
                    sum += op[m * d + i].conj() * op[m * d + j];
                }
                acc[i * d + j] += sum;
            }
        }
    }
    (0..d * d).all(|idx| {
        let expected = if idx / d == idx % d {
            Complex::new(P::one(), P::zero())
        } else {
            Complex::zero()
        };
        (acc[idx] - expected).norm() <= tol
    })
}

#[cfg(test)]
mod operator_tests {
    use super::*;
    use crate::state_ops::from_reals;

    #[test]
    fn test_flip_second_qubit_of_vector() {
        // |00> with X on the second axis becomes |01>
        let state = from_reals(&[1.0, 0.0, 0.0, 0.0]);
        let x = from_reals(&[0.0, 1.0, 1.0, 0.0]);
        let out = apply_operator_vector(&[2, 2], &[1], &state, &x);
        assert_eq!(out, from_reals(&[0.0, 1.0, 0.0, 0.0]));
    }

    #[test]
    fn test_identity_on_matrix_is_noop() {
        let mut rho = vec![Complex::new(0.0, 0.0); 16];
        rho[0] = Complex::new(0.5, 0.0);
        rho[5] = Complex::new(0.5, 0.0);
        let eye = from_reals(&[1.0, 0.0, 0.0, 1.0]);
        let out = apply_operator_matrix(&[2, 2], &[0], &rho, &eye);
        assert_eq!(out, rho);
    }

    #[test]
    fn test_flip_matrix_rows_and_cols() {
        // rho = |0><0| on one qubit; X rho X = |1><1|
        let rho = from_reals(&[1.0, 0.0, 0.0, 0.0]);
        let x = from_reals(&[0.0, 1.0, 1.0, 0.0]);
        let out = apply_operator_matrix(&[2], &[0], &rho, &x);
        assert_eq!(out, from_reals(&[0.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_kraus_identity_check() {
        let h = (0.5f64).sqrt();
        let a = from_reals(&[h, 0.0, 0.0, h]);
        let b = from_reals(&[h, 0.0, 0.0, -h]);
        assert!(kraus_identity_check(&[a.clone(), b], 2, 1e-9));
        assert!(!kraus_identity_check(&[a], 2, 1e-9));
    }

    #[test]
    fn test_depolarizing_channel_preserves_trace() {
        let rho = from_reals(&[0.7, 0.0, 0.0, 0.3]);
        let p: f64 = 0.25;
        let k0 = from_reals(&[(1.0 - p).sqrt(), 0.0, 0.0, (1.0 - p).sqrt()]);
        let k1 = from_reals(&[0.0, p.sqrt(), p.sqrt(), 0.0]);
        assert!(kraus_identity_check(&[k0.clone(), k1.clone()], 2, 1e-9));
        let out = apply_kraus_matrix(&[2], &[0], &rho, &[k0, k1]);
        let trace = out[0] + out[3];
        assert!((trace.re - 1.0).abs() < 1e-9);
    }
}
