//! Free-function algorithms over explicit `(dims, axes, flat array)`
//! triples. All mutable state is passed in and out explicitly; the
//! stateful orchestration layers sit on top of these.

/// Born-rule sampling: projective and generalized measurement.
pub mod measurement_ops;
/// Operator and Kraus-channel application on selected axes.
pub mod operator_ops;
/// Kronecker products, axis permutation, partial traces, resizing.
pub mod tensor_ops;
/// Representation promotion/demotion and occupation estimates.
pub mod transform_ops;

use crate::Precision;
use num_complex::Complex;
use num_traits::{One, Zero};

/// Turn a list of real values into a list of complex values with `0`
/// imaginary part.
pub fn from_reals<P: Precision>(data: &[P]) -> Vec<Complex<P>> {
    data.iter().map(|x| Complex::new(*x, P::zero())).collect()
}

/// The computational basis vector `|value>` of the given dimension as a
/// flat `(d, 1)` array.
pub fn basis_vector<P: Precision>(d: usize, value: usize) -> Vec<Complex<P>> {
    let mut out = vec![Complex::zero(); d];
    out[value.min(d - 1)] = Complex::one();
    out
}
