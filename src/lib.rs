#![forbid(unsafe_code)]
#![deny(
    unreachable_pub,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    missing_docs
)]

//! Simulation of composite quantum systems built from independently
//! created subsystems (two-level systems, truncated oscillator modes,
//! opaque custom-dimension systems) that are combined into shared
//! tensor-product spaces on demand, measured, evolved by operators and
//! channels, reordered, resized, and split apart again as subsystems
//! disentangle.
//!
//! The engine tracks which subsystems currently share a tensor
//! factorization and keeps every subsystem's location descriptor
//! consistent while those factorizations are merged, permuted,
//! truncated and torn down.
//!
//! # Example
//! ```
//! use qompose::prelude::*;
//!
//! # fn main() -> StateResult<()> {
//! // Two qubits, both starting in |0>.
//! let a = System::qubit();
//! let b = System::qubit();
//!
//! // Put them under one composite system and tensor them together.
//! let env = Composite::of([Part::from(&a), Part::from(&b)]);
//! env.combine(&[a.clone(), b.clone()])?;
//!
//! // |00> measures to 0 on both subsystems, deterministically.
//! let outcomes = env.measure(&[a.clone(), b.clone()], true, true)?;
//! assert_eq!(outcomes[&a.borrow().id()], 0);
//! assert_eq!(outcomes[&b.borrow().id()], 0);
//! # Ok(())
//! # }
//! ```

/// Composite-system stores, the handle registry, and the public
/// orchestration surface.
pub mod composite;
/// Global settings and the injected randomness provider.
pub mod config;
/// Error types for composition and measurement.
pub mod errors;
/// Operation descriptors and a small library of standard operators.
pub mod operation;
/// Two-subsystem pair containers.
pub mod pair;
/// Pure planning helpers for reordering and partial tracing.
pub mod plan;
/// Tensor-product subspaces: one member list, one backing array.
pub mod product_state;
/// Rayon/serial iterator selection macros.
pub mod rayon_helper;
/// Measurement, channel and tensor algorithms over flat buffers.
pub mod state_ops;
/// Concrete subsystem kinds and their standalone behavior.
pub mod system;
/// Ids, representation levels and location descriptors.
pub mod types;
/// Mixed-radix index arithmetic for flat tensors.
pub mod utils;

pub use num_complex::Complex;
pub use rand;
pub use types::*;

/// Commonly used types and traits.
/// ```
/// use qompose::prelude::*;
/// ```
pub mod prelude {
    pub use super::*;
    pub use crate::composite::{Composite, CompositeStore, Part};
    pub use crate::config::Config;
    pub use crate::errors::{StateError, StateResult};
    pub use crate::operation::{Operation, OperationKind};
    pub use crate::pair::{Pair, PairRef};
    pub use crate::product_state::ProductState;
    pub use crate::system::{System, SystemKind, SystemRef};
}
