//! Concrete subsystems: two-level systems, truncated oscillator modes
//! and opaque custom-dimension systems. The composition engine only
//! relies on the identity/dimension/level/location contract; everything
//! else here is the standalone behavior systems carry before and after
//! they participate in joint arrays.

use crate::composite::Composite;
use crate::config::Config;
use crate::errors::{StateError, StateResult};
use crate::operation::Operation;
use crate::pair::Pair;
use crate::state_ops::basis_vector;
use crate::state_ops::measurement_ops::{measure_matrix, measure_vector};
use crate::state_ops::operator_ops::{
    apply_kraus_matrix, apply_operator_matrix, apply_operator_vector,
};
use crate::state_ops::tensor_ops::{is_zero_array, normalize, resize_axis};
use crate::state_ops::transform_ops::{
    contract_matrix, expand_vector, highest_occupation_matrix, highest_occupation_vector,
};
use crate::types::{CompositeId, Location, Representation, SystemId};
use num_complex::Complex64;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Shared handle to a subsystem. The engine mutates representation
/// level, location and (for truncatable kinds) dimension through it.
pub type SystemRef = Rc<RefCell<System>>;

/// The kind of a subsystem.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum SystemKind {
    /// A two-level system of fixed dimension 2.
    Qubit,
    /// A truncated oscillator mode; its cutoff dimension is mutable
    /// through the resize contract.
    Bosonic,
    /// An opaque system of fixed caller-chosen dimension.
    Custom,
}

/// One quantum degree of freedom.
#[derive(Debug)]
pub struct System {
    id: SystemId,
    kind: SystemKind,
    dimension: usize,
    level: Representation,
    location: Location,
    value: Option<usize>,
    local: Option<Vec<Complex64>>,
    measured: bool,
    pub(crate) composite: Option<CompositeId>,
    pub(crate) pair: Option<Weak<RefCell<Pair>>>,
}

impl System {
    fn with_kind(kind: SystemKind, dimension: usize) -> SystemRef {
        Rc::new(RefCell::new(System {
            id: SystemId::fresh(),
            kind,
            dimension,
            level: Representation::Label,
            location: Location::Free,
            value: Some(0),
            local: None,
            measured: false,
            composite: None,
            pair: None,
        }))
    }

    /// A fresh two-level system in the basis state `|0>`.
    pub fn qubit() -> SystemRef {
        Self::with_kind(SystemKind::Qubit, 2)
    }

    /// A fresh oscillator mode truncated at `cutoff` levels, in the
    /// vacuum state.
    pub fn bosonic(cutoff: usize) -> SystemRef {
        Self::with_kind(SystemKind::Bosonic, cutoff.max(1))
    }

    /// A fresh custom system of the given dimension in basis state
    /// `|0>`.
    pub fn custom(dimension: usize) -> SystemRef {
        Self::with_kind(SystemKind::Custom, dimension.max(1))
    }

    /// Stable identity.
    pub fn id(&self) -> SystemId {
        self.id
    }

    /// The subsystem kind.
    pub fn kind(&self) -> SystemKind {
        self.kind
    }

    /// Current Hilbert-space dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Current representation level.
    pub fn level(&self) -> Representation {
        self.level
    }

    /// Current location descriptor.
    pub fn location(&self) -> Location {
        self.location
    }

    /// Definite basis value, when at `Label` level.
    pub fn value(&self) -> Option<usize> {
        self.value
    }

    /// True once a destructive measurement has consumed this system.
    pub fn is_measured(&self) -> bool {
        self.measured
    }

    /// The composite system this subsystem currently belongs to.
    pub fn composite(&self) -> Option<CompositeId> {
        self.composite
    }

    pub(crate) fn pair_ref(&self) -> Option<Rc<RefCell<Pair>>> {
        self.pair.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_level(&mut self, level: Representation) {
        self.level = level;
    }

    pub(crate) fn set_location(&mut self, location: Location) {
        self.location = location;
    }

    pub(crate) fn set_dimension(&mut self, dimension: usize) {
        self.dimension = dimension;
    }

    pub(crate) fn set_pair(&mut self, pair: Weak<RefCell<Pair>>) {
        self.pair = Some(pair);
    }

    /// Collapse bookkeeping shared by every measurement path: the system
    /// leaves whatever array held it and carries a definite basis value.
    pub(crate) fn collapse_to(&mut self, outcome: usize, destructive: bool) {
        self.level = Representation::Label;
        self.value = Some(outcome);
        self.local = None;
        self.location = Location::Free;
        if destructive {
            self.measured = true;
        }
    }

    /// Hand a detached subsystem its own standalone array, e.g. the
    /// reduced state captured for it when it leaves a joint array.
    pub(crate) fn set_local_array(&mut self, level: Representation, array: Vec<Complex64>) {
        self.local = Some(array);
        self.value = None;
        self.level = level;
        self.location = Location::Free;
    }

    /// Hand the standalone array over for Kronecker absorption, leaving
    /// the system without local state.
    pub(crate) fn take_local(&mut self) -> Option<Vec<Complex64>> {
        self.local.take()
    }

    pub(crate) fn local_array(&self) -> Option<Vec<Complex64>> {
        self.local.clone()
    }

    /// Opaque custom subsystems survive destructive generalized
    /// measurement; the composite layer undoes the measured mark after
    /// handing them their reduced state.
    pub(crate) fn clear_measured(&mut self) {
        self.measured = false;
    }

    /// Put this unlocated system into the given definite basis state.
    pub fn set_label(&mut self, value: usize) -> StateResult<()> {
        if self.location != Location::Free {
            return Err(StateError::precondition(
                "cannot assign a label to a subsystem inside a joint array",
            ));
        }
        if value >= self.dimension {
            return Err(StateError::precondition(format!(
                "basis value {} out of range for dimension {}",
                value, self.dimension
            )));
        }
        self.level = Representation::Label;
        self.value = Some(value);
        self.local = None;
        Ok(())
    }

    /// Put this unlocated system into the given state vector. The
    /// amplitudes are normalized on the way in.
    pub fn set_vector(&mut self, amplitudes: Vec<Complex64>) -> StateResult<()> {
        if self.location != Location::Free {
            return Err(StateError::precondition(
                "cannot assign a vector to a subsystem inside a joint array",
            ));
        }
        if amplitudes.len() != self.dimension {
            return Err(StateError::precondition(format!(
                "expected {} amplitudes, received {}",
                self.dimension,
                amplitudes.len()
            )));
        }
        let mut amplitudes = amplitudes;
        if is_zero_array(&amplitudes, 1e-12) {
            return Err(StateError::invalid_state("state vector is entirely zero"));
        }
        normalize(&mut amplitudes);
        self.level = Representation::Vector;
        self.value = None;
        self.local = Some(amplitudes);
        Ok(())
    }

    /// Promote the standalone representation one level: a label becomes
    /// a basis vector, a vector becomes a density matrix. No-op for a
    /// system inside a joint array (its owner promotes the joint array)
    /// or one already at `Matrix`.
    pub fn expand(&mut self) {
        if self.location != Location::Free {
            return;
        }
        match self.level {
            Representation::Label => {
                let v = basis_vector(self.dimension, self.value.unwrap_or(0));
                self.local = Some(v);
                self.value = None;
                self.level = Representation::Vector;
            }
            Representation::Vector => {
                if let Some(psi) = self.local.take() {
                    self.local = Some(expand_vector(&psi));
                    self.level = Representation::Matrix;
                }
            }
            Representation::Matrix => {}
        }
    }

    /// Best-effort demotion: a rank-1 density matrix becomes a vector,
    /// and a basis-aligned vector becomes a label. Failure leaves the
    /// representation unchanged.
    pub fn contract(&mut self, tol: f64) {
        if self.location != Location::Free {
            return;
        }
        if self.level == Representation::Matrix {
            if let Some(rho) = self.local.as_ref() {
                if let Some(psi) = contract_matrix(rho, self.dimension, tol) {
                    self.local = Some(psi);
                    self.level = Representation::Vector;
                }
            }
        }
        if self.level == Representation::Vector {
            if let Some(psi) = self.local.as_ref() {
                let above: Vec<usize> = (0..psi.len())
                    .filter(|&i| psi[i].norm_sqr() > tol)
                    .collect();
                if above.len() == 1 && (psi[above[0]].norm() - 1.0).abs() < tol {
                    self.value = Some(above[0]);
                    self.local = None;
                    self.level = Representation::Label;
                }
            }
        }
    }

    /// Resize a truncatable standalone system. Growing always succeeds;
    /// shrinking succeeds only when the occupation estimate fits under
    /// the new cutoff. Returns `false` without mutating otherwise.
    pub fn resize(&mut self, new_dimension: usize) -> bool {
        if self.kind != SystemKind::Bosonic
            || new_dimension == 0
            || self.location != Location::Free
        {
            return false;
        }
        if new_dimension == self.dimension {
            return true;
        }
        match self.level {
            Representation::Label => {
                if self.value.unwrap_or(0) >= new_dimension {
                    return false;
                }
                self.dimension = new_dimension;
                true
            }
            Representation::Vector => {
                let psi = match self.local.as_ref() {
                    Some(psi) => psi,
                    None => return false,
                };
                if new_dimension < self.dimension
                    && highest_occupation_vector(psi) >= new_dimension
                {
                    return false;
                }
                let resized = resize_axis(&[self.dimension], 0, new_dimension, psi);
                self.local = Some(resized);
                self.dimension = new_dimension;
                true
            }
            Representation::Matrix => {
                let rho = match self.local.as_ref() {
                    Some(rho) => rho,
                    None => return false,
                };
                if new_dimension < self.dimension
                    && highest_occupation_matrix(rho, self.dimension) >= new_dimension
                {
                    return false;
                }
                let rows = resize_axis(&[self.dimension, self.dimension], 0, new_dimension, rho);
                let both = resize_axis(&[new_dimension, self.dimension], 1, new_dimension, &rows);
                self.local = Some(both);
                self.dimension = new_dimension;
                true
            }
        }
    }

    /// The marginal array of this subsystem alone: its own amplitudes
    /// when standalone, the reduced array out of the joint state when it
    /// lives in a pair or a product state.
    pub fn trace_out(this: &SystemRef) -> StateResult<Vec<Complex64>> {
        let location = this.borrow().location;
        match location {
            Location::Free => {
                let s = this.borrow();
                match s.level {
                    Representation::Label => {
                        Ok(basis_vector(s.dimension, s.value.unwrap_or(0)))
                    }
                    _ => s.local.clone().ok_or_else(|| {
                        StateError::invalid_state("subsystem carries no local array")
                    }),
                }
            }
            Location::InPair(slot) => {
                let pair = this
                    .borrow()
                    .pair_ref()
                    .ok_or_else(|| StateError::invalid_state("pair container is gone"))?;
                let out = pair.borrow().trace_out_slot(slot);
                Ok(out)
            }
            Location::InProduct { .. } => {
                let id = this.borrow().composite.ok_or_else(|| {
                    StateError::invalid_state("subsystem in a product state without a composite")
                })?;
                Composite::with_id(id).trace_out(std::slice::from_ref(this))
            }
        }
    }

    /// Projectively measure a standalone system. Fails on a system that
    /// was already destructively measured.
    pub fn measure(&mut self, destructive: bool) -> StateResult<usize> {
        if self.measured {
            return Err(StateError::precondition(
                "subsystem was already destructively measured",
            ));
        }
        if self.location != Location::Free {
            return Err(StateError::precondition(
                "subsystem inside a joint array must be measured through its owner",
            ));
        }
        let outcome = match self.level {
            Representation::Label => self.value.unwrap_or(0),
            Representation::Vector => {
                let psi = self
                    .local
                    .as_ref()
                    .ok_or_else(|| StateError::invalid_state("missing state vector"))?;
                let mut rng = Config::fresh_rng();
                let (outcomes, _) = measure_vector(&[self.dimension], &[0], psi, &mut rng)?;
                outcomes[0]
            }
            Representation::Matrix => {
                let rho = self
                    .local
                    .as_ref()
                    .ok_or_else(|| StateError::invalid_state("missing density matrix"))?;
                let mut rng = Config::fresh_rng();
                let (outcomes, _) = measure_matrix(&[self.dimension], &[0], rho, &mut rng)?;
                outcomes[0]
            }
        };
        self.collapse_to(outcome, destructive);
        Ok(outcome)
    }

    /// Apply a Kraus channel to a standalone system. Completeness of the
    /// family is verified by the composite entry point; this method
    /// assumes it.
    pub fn apply_kraus(&mut self, operators: &[Vec<Complex64>]) -> StateResult<()> {
        if self.measured {
            return Err(StateError::precondition(
                "subsystem was already destructively measured",
            ));
        }
        if self.location != Location::Free {
            return Err(StateError::precondition(
                "subsystem inside a joint array takes channels through its owner",
            ));
        }
        let d = self.dimension;
        for op in operators {
            if op.len() != d * d {
                let side = (op.len() as f64).sqrt() as usize;
                return Err(StateError::ShapeMismatch {
                    expected: (d, d),
                    found: (side, side),
                });
            }
        }
        while self.level < Representation::Matrix {
            self.expand();
        }
        let rho = self
            .local
            .take()
            .ok_or_else(|| StateError::invalid_state("missing density matrix"))?;
        self.local = Some(apply_kraus_matrix(&[d], &[0], &rho, operators));
        if Config::current().auto_contract {
            self.contract(1e-6);
        }
        Ok(())
    }

    /// Apply an operation descriptor to a standalone system, resizing a
    /// truncatable target first when dynamic sizing is enabled.
    pub fn apply_operation(&mut self, operation: &Operation) -> StateResult<()> {
        if self.measured {
            return Err(StateError::precondition(
                "subsystem was already destructively measured",
            ));
        }
        if self.location != Location::Free {
            return Err(StateError::precondition(
                "subsystem inside a joint array takes operations through its owner",
            ));
        }
        operation.validate_targets(&[self.kind])?;

        if Config::current().dynamic_dimensions {
            let marginal = match self.level {
                Representation::Label => basis_vector(self.dimension, self.value.unwrap_or(0)),
                _ => self.local.clone().unwrap_or_default(),
            };
            let occupation = match (self.kind, self.level) {
                (SystemKind::Bosonic, Representation::Label) => self.value.unwrap_or(0),
                (SystemKind::Bosonic, Representation::Vector) => {
                    highest_occupation_vector(&marginal)
                }
                (SystemKind::Bosonic, Representation::Matrix) => {
                    highest_occupation_matrix(&marginal, self.dimension)
                }
                _ => self.dimension,
            };
            let dims = operation.compute_dimensions(&[occupation], &[marginal]);
            let _ = self.resize(dims[0]);
        }

        if self.level == Representation::Label {
            self.expand();
        }
        let d = self.dimension;
        let op = operation.operator(&[d])?;
        let state = self
            .local
            .take()
            .ok_or_else(|| StateError::invalid_state("missing state array"))?;
        let mut next = match self.level {
            Representation::Vector => apply_operator_vector(&[d], &[0], &state, &op),
            _ => apply_operator_matrix(&[d], &[0], &state, &op),
        };
        if is_zero_array(&next, 1e-12) {
            self.local = Some(next);
            return Err(StateError::invalid_state(
                "state is entirely zero after the operation; was the vacuum annihilated?",
            ));
        }
        if operation.renormalize() {
            normalize(&mut next);
        }
        self.local = Some(next);

        if self.kind == SystemKind::Bosonic {
            let occupation = match self.level {
                Representation::Vector => {
                    highest_occupation_vector(self.local.as_ref().unwrap())
                }
                _ => highest_occupation_matrix(self.local.as_ref().unwrap(), d),
            };
            let wanted = occupation.max(1) + 1;
            if wanted < self.dimension {
                let _ = self.resize(wanted);
            }
        }
        if Config::current().auto_contract {
            self.contract(1e-6);
        }
        Ok(())
    }
}
