use num_traits::{Float, NumAssign};
use std::fmt::{Debug, Display};
use std::iter::{Product, Sum};
use std::sync::atomic::{AtomicU64, Ordering};

/// The float precision of the state arrays.
pub trait Precision:
    Default + NumAssign + Float + Sum + Send + Sync + Display + Product + Debug
{
}

impl Precision for f64 {}

impl Precision for f32 {}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_id() -> u64 {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Draw a fresh, never-recycled id.
            pub fn fresh() -> Self {
                Self(next_id())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Stable identity of one subsystem.
    SystemId
);
id_type!(
    /// Identity of a two-subsystem pair container.
    PairId
);
id_type!(
    /// Identity of one product state within a composite store.
    ProductId
);
id_type!(
    /// Identity of a composite handle; key into the store registry.
    CompositeId
);

/// How a state is currently represented. Levels are totally ordered:
/// `Label < Vector < Matrix`. `Label` means the subsystem is not yet part
/// of any tensor product and is described by a definite basis value.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Representation {
    /// A definite basis value, no array backing.
    Label,
    /// State vector of shape `(D, 1)`.
    Vector,
    /// Density matrix of shape `(D, D)`.
    Matrix,
}

/// Where a subsystem currently lives. Exactly one of these holds at any
/// time; the orchestration layer recomputes it after every structural
/// change rather than maintaining live back-pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    /// Not held by any joint array.
    Free,
    /// Tensored into its pair container's joint array at the given slot.
    InPair(usize),
    /// Tensored into a product state.
    InProduct {
        /// The owning product state.
        product: ProductId,
        /// Axis position within that product state's member order.
        position: usize,
    },
}

impl Location {
    /// True if the subsystem is held by a product state.
    pub fn in_product(&self) -> bool {
        matches!(self, Location::InProduct { .. })
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(Representation::Label < Representation::Vector);
        assert!(Representation::Vector < Representation::Matrix);
    }

    #[test]
    fn test_fresh_ids_unique() {
        let a = SystemId::fresh();
        let b = SystemId::fresh();
        assert_ne!(a, b);
    }
}
