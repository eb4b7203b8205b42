//! Dense-array primitives over flat buffers: Kronecker products, axis
//! permutation, partial traces and axis resizing. Arrays are row-major
//! and addressed with the mixed-radix helpers in [`crate::utils`].

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::utils::{digit_at, strides, sub_to_full, total_dim, AxisVec};
use crate::{iter, iter_mut, Precision};
use num_complex::Complex;
use num_traits::{One, Zero};

/// Kronecker product of two flat row-major arrays with the given
/// `(rows, cols)` shapes.
pub fn kron<P: Precision>(
    a: &[Complex<P>],
    a_shape: (usize, usize),
    b: &[Complex<P>],
    b_shape: (usize, usize),
) -> Vec<Complex<P>> {
    let (ar, ac) = a_shape;
    let (br, bc) = b_shape;
    let cols = ac * bc;
    let mut out = vec![Complex::zero(); (ar * br) * cols];
    for i in 0..ar {
        for j in 0..ac {
            let av = a[i * ac + j];
            for k in 0..br {
                for l in 0..bc {
                    out[(i * br + k) * cols + (j * bc + l)] = av * b[k * bc + l];
                }
            }
        }
    }
    out
}

/// Left-to-right Kronecker product of a sequence of arrays, starting
/// from the scalar identity `[[1]]`.
pub fn kron_all<P, I>(arrays: I) -> (Vec<Complex<P>>, (usize, usize))
where
    P: Precision,
    I: IntoIterator<Item = (Vec<Complex<P>>, (usize, usize))>,
{
    arrays
        .into_iter()
        .fold((vec![Complex::one()], (1, 1)), |(acc, acc_shape), (arr, shape)| {
            let out = kron(&acc, acc_shape, &arr, shape);
            (out, (acc_shape.0 * shape.0, acc_shape.1 * shape.1))
        })
}

fn permute_tensor<P: Precision>(
    dims: &[usize],
    perm: &[usize],
    input: &[Complex<P>],
) -> Vec<Complex<P>> {
    let new_dims: AxisVec = perm.iter().map(|&p| dims[p]).collect();
    let in_strides = strides(dims);
    let mut out = vec![Complex::zero(); input.len()];
    iter_mut!(out).enumerate().for_each(|(o, slot)| {
        let i: usize = (0..perm.len())
            .map(|j| digit_at(&new_dims, j, o) * in_strides[perm[j]])
            .sum();
        *slot = input[i];
    });
    out
}

/// Permute the member axes of a state vector. `perm[j]` names the old
/// axis landing at position `j`; the trailing singleton axis of the
/// `(D, 1)` shape is untouched.
pub fn permute_vector<P: Precision>(
    dims: &[usize],
    perm: &[usize],
    input: &[Complex<P>],
) -> Vec<Complex<P>> {
    permute_tensor(dims, perm, input)
}

/// Permute the member axes of a density matrix: the permutation is
/// applied to the row block and duplicated onto the column block.
pub fn permute_matrix<P: Precision>(
    dims: &[usize],
    perm: &[usize],
    input: &[Complex<P>],
) -> Vec<Complex<P>> {
    let n = dims.len();
    let full_dims: AxisVec = dims.iter().chain(dims.iter()).copied().collect();
    let full_perm: AxisVec = perm
        .iter()
        .copied()
        .chain(perm.iter().map(|&p| p + n))
        .collect();
    permute_tensor(&full_dims, &full_perm, input)
}

/// Trace of a `d` by `d` flat matrix.
pub fn trace<P: Precision>(mat: &[Complex<P>], d: usize) -> Complex<P> {
    (0..d).map(|i| mat[i * d + i]).sum()
}

/// Frobenius (l2) norm of a flat array.
pub fn norm<P: Precision>(x: &[Complex<P>]) -> P {
    iter!(x).map(Complex::<P>::norm_sqr).sum::<P>().sqrt()
}

/// Divide an array by its norm in place; a numerically zero array is
/// left untouched.
pub fn normalize<P: Precision>(x: &mut [Complex<P>]) {
    let n = norm(x);
    if !n.is_zero() {
        x.iter_mut().for_each(|v| *v = v.unscale(n));
    }
}

/// True if no entry of the array has magnitude above `eps`.
pub fn is_zero_array<P: Precision>(x: &[Complex<P>], eps: P) -> bool {
    x.iter().all(|v| v.norm_sqr() <= eps * eps)
}

/// Partial trace of a density matrix over everything but `keep`,
/// returning the reduced `(Dk, Dk)` matrix with the kept axes tensored
/// in the order given.
pub fn trace_out_matrix<P: Precision>(
    dims: &[usize],
    keep: &[usize],
    input: &[Complex<P>],
) -> Vec<Complex<P>> {
    let d = total_dim(dims);
    let rest: AxisVec = (0..dims.len()).filter(|i| !keep.contains(i)).collect();
    let dk: usize = keep.iter().map(|&a| dims[a]).product();
    let de: usize = rest.iter().map(|&a| dims[a]).product();
    let mut out = vec![Complex::zero(); dk * dk];
    iter_mut!(out).enumerate().for_each(|(idx, slot)| {
        let (k_row, k_col) = (idx / dk, idx % dk);
        let row_base = sub_to_full(dims, keep, k_row, 0);
        let col_base = sub_to_full(dims, keep, k_col, 0);
        let mut acc = Complex::zero();
        for e in 0..de {
            let row = sub_to_full(dims, &rest, e, row_base);
            let col = sub_to_full(dims, &rest, e, col_base);
            acc += input[row * d + col];
        }
        *slot = acc;
    });
    out
}

/// Marginal populations of a state vector over `keep`: entry `k` is the
/// summed squared magnitude of all amplitudes whose kept digits equal
/// `k`. Returned as a `(Dk, 1)` array with zero imaginary parts.
pub fn trace_out_vector<P: Precision>(
    dims: &[usize],
    keep: &[usize],
    input: &[Complex<P>],
) -> Vec<Complex<P>> {
    let rest: AxisVec = (0..dims.len()).filter(|i| !keep.contains(i)).collect();
    let dk: usize = keep.iter().map(|&a| dims[a]).product();
    let de: usize = rest.iter().map(|&a| dims[a]).product();
    let mut out = vec![Complex::zero(); dk];
    iter_mut!(out).enumerate().for_each(|(k, slot)| {
        let base = sub_to_full(dims, keep, k, 0);
        let mut acc = P::zero();
        for e in 0..de {
            acc += input[sub_to_full(dims, &rest, e, base)].norm_sqr();
        }
        *slot = Complex::new(acc, P::zero());
    });
    out
}

/// Grow (zero-pad) or shrink (slice) one axis of a flat tensor to
/// `new_dim`. The caller is responsible for any occupation checks
/// before shrinking.
pub fn resize_axis<P: Precision>(
    dims: &[usize],
    axis: usize,
    new_dim: usize,
    input: &[Complex<P>],
) -> Vec<Complex<P>> {
    let mut new_dims: AxisVec = dims.iter().copied().collect();
    new_dims[axis] = new_dim;
    let in_strides = strides(dims);
    let mut out = vec![Complex::zero(); total_dim(&new_dims)];
    iter_mut!(out).enumerate().for_each(|(o, slot)| {
        let digit = digit_at(&new_dims, axis, o);
        if digit < dims[axis] {
            let i: usize = (0..dims.len())
                .map(|j| digit_at(&new_dims, j, o) * in_strides[j])
                .sum();
            *slot = input[i];
        }
    });
    out
}

#[cfg(test)]
mod tensor_tests {
    use super::*;
    use crate::state_ops::from_reals;

    #[test]
    fn test_kron_vectors() {
        let a = from_reals(&[1.0, 2.0]);
        let b = from_reals(&[3.0, 5.0, 7.0]);
        let out = kron(&a, (2, 1), &b, (3, 1));
        let expected = from_reals(&[3.0, 5.0, 7.0, 6.0, 10.0, 14.0]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_kron_matrices() {
        let a = from_reals(&[1.0, 2.0, 3.0, 4.0]);
        let b = from_reals(&[0.0, 5.0, 6.0, 7.0]);
        let out = kron(&a, (2, 2), &b, (2, 2));
        let expected = from_reals(&[
            0.0, 5.0, 0.0, 10.0, //
            6.0, 7.0, 12.0, 14.0, //
            0.0, 15.0, 0.0, 20.0, //
            18.0, 21.0, 24.0, 28.0,
        ]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_kron_all_starts_from_identity() {
        let (out, shape) = kron_all::<f64, _>(std::iter::empty());
        assert_eq!(shape, (1, 1));
        assert_eq!(out, vec![Complex::new(1.0, 0.0)]);
    }

    #[test]
    fn test_permute_vector_round_trip() {
        // shape [2, 3], amplitudes 0..6
        let v = from_reals(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let swapped = permute_vector(&[2, 3], &[1, 0], &v);
        // entry (b, a) of swapped = entry (a, b) of v
        assert_eq!(swapped, from_reals(&[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]));
        let back = permute_vector(&[3, 2], &[1, 0], &swapped);
        assert_eq!(back, v);
    }

    #[test]
    fn test_trace_out_matrix_of_product() {
        // rho = diag(0.25, 0.25, 0.25, 0.25) over two qubits
        let mut rho: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); 16];
        for i in 0..4 {
            rho[i * 4 + i] = Complex::new(0.25, 0.0);
        }
        let reduced = trace_out_matrix(&[2, 2], &[0], &rho);
        assert_eq!(reduced.len(), 4);
        assert!((reduced[0].re - 0.5).abs() < 1e-12);
        assert!((reduced[3].re - 0.5).abs() < 1e-12);
        assert!(reduced[1].norm() < 1e-12);
    }

    #[test]
    fn test_trace_out_vector_populations() {
        // |01> over two qubits
        let v = from_reals::<f64>(&[0.0, 1.0, 0.0, 0.0]);
        let first = trace_out_vector(&[2, 2], &[0], &v);
        assert!((first[0].re - 1.0).abs() < 1e-12);
        assert!(first[1].norm() < 1e-12);
        let second = trace_out_vector(&[2, 2], &[1], &v);
        assert!((second[1].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_resize_axis_pad_then_slice() {
        let v = from_reals(&[1.0, 2.0, 3.0, 4.0]);
        let padded = resize_axis(&[2, 2], 0, 3, &v);
        assert_eq!(padded, from_reals(&[1.0, 2.0, 3.0, 4.0, 0.0, 0.0]));
        let back = resize_axis(&[3, 2], 0, 2, &padded);
        assert_eq!(back, v);
    }
}
