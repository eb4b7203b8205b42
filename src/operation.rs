//! Operation descriptors: a tagged category (with expected arity and
//! subsystem-kind signature, checked at the boundary), a
//! dimension-computation callback, an operator builder, and a
//! renormalization flag.

use crate::errors::{StateError, StateResult};
use crate::system::SystemKind;
use crate::utils::total_dim;
use num_complex::Complex64;
use num_traits::Zero;
use smallvec::{smallvec, SmallVec};
use std::fmt;

/// Per-target dimension list produced by a dimension callback.
pub type DimVec = SmallVec<[usize; 2]>;

type DimsFn = Box<dyn Fn(&[usize], &[Vec<Complex64>]) -> DimVec>;
type BuildFn = Box<dyn Fn(&[usize]) -> Vec<Complex64>>;

/// The category of an operation: which subsystem kinds it targets, and
/// how many of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// A single truncatable oscillator target.
    Bosonic,
    /// A single two-level target.
    Qubit,
    /// A single opaque custom-dimension target.
    Custom,
    /// A fixed sequence of targets with the given kind signature.
    Composite(SmallVec<[SystemKind; 2]>),
}

impl OperationKind {
    /// Number of targets this category expects.
    pub fn arity(&self) -> usize {
        match self {
            Self::Composite(sig) => sig.len(),
            _ => 1,
        }
    }

    fn accepts(&self, kinds: &[SystemKind]) -> bool {
        match self {
            Self::Bosonic => matches!(kinds, [SystemKind::Bosonic]),
            Self::Qubit => matches!(kinds, [SystemKind::Qubit]),
            Self::Custom => matches!(kinds, [SystemKind::Custom]),
            Self::Composite(sig) => sig.as_slice() == kinds,
        }
    }
}

/// An operator to apply to one or more subsystems. The operator matrix
/// is materialized lazily from the target dimensions, so truncatable
/// targets can be resized first when dynamic sizing is enabled.
pub struct Operation {
    kind: OperationKind,
    renormalize: bool,
    dims_for: DimsFn,
    build: BuildFn,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("renormalize", &self.renormalize)
            .finish_non_exhaustive()
    }
}

fn isqrt(n: usize) -> usize {
    let mut r = (n as f64).sqrt() as usize;
    while r * r > n {
        r -= 1;
    }
    while (r + 1) * (r + 1) <= n {
        r += 1;
    }
    r
}

impl Operation {
    /// An operation from explicit parts. `dims_for` receives, per
    /// target, its occupation estimate (truncatable kinds) or its
    /// dimension, and its traced-out marginal; it answers the
    /// dimensions the operator wants. `build` materializes the flat
    /// `(D, D)` operator for those dimensions.
    pub fn from_parts(
        kind: OperationKind,
        renormalize: bool,
        dims_for: DimsFn,
        build: BuildFn,
    ) -> Self {
        Self {
            kind,
            renormalize,
            dims_for,
            build,
        }
    }

    /// A fixed 2x2 operator on one two-level subsystem.
    pub fn qubit(matrix: Vec<Complex64>) -> StateResult<Self> {
        if matrix.len() != 4 {
            return Err(StateError::ShapeMismatch {
                expected: (2, 2),
                found: (isqrt(matrix.len()), isqrt(matrix.len())),
            });
        }
        Ok(Self::from_parts(
            OperationKind::Qubit,
            false,
            Box::new(|_, _| smallvec![2]),
            Box::new(move |_| matrix.clone()),
        ))
    }

    /// A fixed operator on one custom-dimension subsystem.
    pub fn custom(dimension: usize, matrix: Vec<Complex64>) -> StateResult<Self> {
        if matrix.len() != dimension * dimension {
            return Err(StateError::ShapeMismatch {
                expected: (dimension, dimension),
                found: (isqrt(matrix.len()), isqrt(matrix.len())),
            });
        }
        Ok(Self::from_parts(
            OperationKind::Custom,
            false,
            Box::new(move |_, _| smallvec![dimension]),
            Box::new(move |_| matrix.clone()),
        ))
    }

    /// A fixed operator on a sequence of subsystems with the given kind
    /// signature, tensored in target order.
    pub fn composite_fixed(
        signature: &[SystemKind],
        dimensions: &[usize],
        matrix: Vec<Complex64>,
    ) -> StateResult<Self> {
        let d = total_dim(dimensions);
        if matrix.len() != d * d {
            return Err(StateError::ShapeMismatch {
                expected: (d, d),
                found: (isqrt(matrix.len()), isqrt(matrix.len())),
            });
        }
        let dims: DimVec = dimensions.iter().copied().collect();
        Ok(Self::from_parts(
            OperationKind::Composite(signature.iter().copied().collect()),
            false,
            Box::new(move |_, _| dims.clone()),
            Box::new(move |_| matrix.clone()),
        ))
    }

    /// The bosonic annihilation operator `a`. Non-unitary; the state is
    /// renormalized after application. Annihilating the vacuum yields
    /// the all-zero array, which application reports as an invalid
    /// state.
    pub fn annihilation() -> Self {
        Self::from_parts(
            OperationKind::Bosonic,
            true,
            Box::new(|occ, _| smallvec![occ[0].max(1) + 1]),
            Box::new(|dims| {
                let d = dims[0];
                let mut m = vec![Complex64::zero(); d * d];
                for n in 1..d {
                    m[(n - 1) * d + n] = Complex64::new((n as f64).sqrt(), 0.0);
                }
                m
            }),
        )
    }

    /// The bosonic creation operator `a^dag`. Requests one extra level
    /// so the raised state is representable; non-unitary, renormalized
    /// after application.
    pub fn creation() -> Self {
        Self::from_parts(
            OperationKind::Bosonic,
            true,
            Box::new(|occ, _| smallvec![occ[0] + 2]),
            Box::new(|dims| {
                let d = dims[0];
                let mut m = vec![Complex64::zero(); d * d];
                for n in 0..d - 1 {
                    m[(n + 1) * d + n] = Complex64::new(((n + 1) as f64).sqrt(), 0.0);
                }
                m
            }),
        )
    }

    /// The bosonic phase shift `exp(i theta n)`.
    pub fn phase_shift(theta: f64) -> Self {
        Self::from_parts(
            OperationKind::Bosonic,
            false,
            Box::new(|occ, _| smallvec![occ[0].max(1) + 1]),
            Box::new(move |dims| {
                let d = dims[0];
                let mut m = vec![Complex64::zero(); d * d];
                for n in 0..d {
                    m[n * d + n] = Complex64::from_polar(1.0, theta * n as f64);
                }
                m
            }),
        )
    }

    /// The category tag of this operation.
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// Whether the state should be renormalized after application.
    pub fn renormalize(&self) -> bool {
        self.renormalize
    }

    /// Check the targets' kind signature against this operation's
    /// category.
    pub fn validate_targets(&self, kinds: &[SystemKind]) -> StateResult<()> {
        if self.kind.accepts(kinds) {
            Ok(())
        } else {
            Err(StateError::precondition(format!(
                "operation of kind {:?} cannot target subsystems {:?}",
                self.kind, kinds
            )))
        }
    }

    /// Ask the dimension callback for the dimensions the operator wants,
    /// given per-target occupation estimates and marginals.
    pub fn compute_dimensions(
        &self,
        occupations: &[usize],
        marginals: &[Vec<Complex64>],
    ) -> DimVec {
        (self.dims_for)(occupations, marginals)
    }

    /// Materialize the flat `(D, D)` operator for the given target
    /// dimensions, verifying its shape.
    pub fn operator(&self, dims: &[usize]) -> StateResult<Vec<Complex64>> {
        let matrix = (self.build)(dims);
        let d = total_dim(dims);
        if matrix.len() != d * d {
            return Err(StateError::ShapeMismatch {
                expected: (d, d),
                found: (isqrt(matrix.len()), isqrt(matrix.len())),
            });
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod operation_tests {
    use super::*;

    #[test]
    fn test_annihilation_matrix() {
        let op = Operation::annihilation();
        let m = op.operator(&[3]).unwrap();
        assert!((m[0 * 3 + 1].re - 1.0).abs() < 1e-12);
        assert!((m[1 * 3 + 2].re - 2f64.sqrt()).abs() < 1e-12);
        assert!(m[0].norm() < 1e-12);
    }

    #[test]
    fn test_qubit_operation_rejects_bad_shape() {
        assert!(Operation::qubit(vec![Complex64::zero(); 9]).is_err());
    }

    #[test]
    fn test_signature_validation() {
        let op = Operation::annihilation();
        assert!(op.validate_targets(&[SystemKind::Bosonic]).is_ok());
        assert!(op.validate_targets(&[SystemKind::Qubit]).is_err());
        assert!(op
            .validate_targets(&[SystemKind::Bosonic, SystemKind::Bosonic])
            .is_err());
    }

    #[test]
    fn test_dynamic_dimensions_follow_occupation() {
        let op = Operation::creation();
        assert_eq!(op.compute_dimensions(&[2], &[vec![]]).as_slice(), &[4]);
    }
}
