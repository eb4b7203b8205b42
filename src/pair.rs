//! A container bundling exactly two correlated subsystems, e.g. the two
//! degrees of freedom of one carrier. The pair owns a joint array while
//! its members are tensored together at pair level; the composite layer
//! absorbs that array during `combine` and otherwise only consumes the
//! pair's measurement and channel entry points.

use crate::config::Config;
use crate::errors::{StateError, StateResult};
use crate::operation::Operation;
use crate::state_ops::measurement_ops::{measure_matrix, measure_vector};
use crate::state_ops::operator_ops::{
    apply_kraus_matrix, apply_operator_matrix, apply_operator_vector,
};
use crate::state_ops::tensor_ops::{
    is_zero_array, kron, normalize, resize_axis, trace_out_matrix, trace_out_vector,
};
use crate::state_ops::transform_ops::{
    contract_matrix, expand_vector, highest_occupation_matrix, highest_occupation_vector,
};
use crate::system::{SystemKind, SystemRef};
use crate::types::{CompositeId, Location, PairId, Representation, SystemId};
use num_complex::Complex64;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Shared handle to a pair container.
pub type PairRef = Rc<RefCell<Pair>>;

/// Two correlated subsystems and, optionally, their joint array.
#[derive(Debug)]
pub struct Pair {
    id: PairId,
    members: [SystemRef; 2],
    state: Option<Vec<Complex64>>,
    level: Representation,
    measured: bool,
    pub(crate) composite: Option<CompositeId>,
}

impl Pair {
    /// Bundle two free, unpaired subsystems into a pair.
    pub fn new(a: &SystemRef, b: &SystemRef) -> StateResult<PairRef> {
        if a.borrow().id() == b.borrow().id() {
            return Err(StateError::precondition(
                "a pair needs two distinct subsystems",
            ));
        }
        for s in [a, b] {
            let s = s.borrow();
            if s.location() != Location::Free
                || s.pair_ref().is_some()
                || s.is_measured()
            {
                return Err(StateError::precondition(
                    "pair members must be free, unpaired and unmeasured",
                ));
            }
        }
        let pair = Rc::new(RefCell::new(Pair {
            id: PairId::fresh(),
            members: [a.clone(), b.clone()],
            state: None,
            level: Representation::Label,
            measured: false,
            composite: None,
        }));
        a.borrow_mut().set_pair(Rc::downgrade(&pair));
        b.borrow_mut().set_pair(Rc::downgrade(&pair));
        Ok(pair)
    }

    /// Identity of this pair.
    pub fn id(&self) -> PairId {
        self.id
    }

    /// The two member handles in slot order.
    pub fn members(&self) -> [SystemRef; 2] {
        [self.members[0].clone(), self.members[1].clone()]
    }

    /// Representation level of the joint array, when one exists.
    pub fn level(&self) -> Representation {
        self.level
    }

    /// True while the two members share a pair-level joint array.
    pub fn is_combined(&self) -> bool {
        self.state.is_some()
    }

    /// True once the pair was destructively measured.
    pub fn is_measured(&self) -> bool {
        self.measured
    }

    pub(crate) fn set_measured(&mut self) {
        self.measured = true;
    }

    /// Slot of the given member, if it is one.
    pub fn slot_of(&self, id: SystemId) -> Option<usize> {
        self.members.iter().position(|m| m.borrow().id() == id)
    }

    fn dims(&self) -> [usize; 2] {
        [
            self.members[0].borrow().dimension(),
            self.members[1].borrow().dimension(),
        ]
    }

    /// Tensor the two members into one joint array (slot 0 most
    /// significant), raising both to the higher representation level
    /// first. No-op if already combined.
    pub fn combine(&mut self) -> StateResult<()> {
        if self.state.is_some() {
            return Ok(());
        }
        if self.measured {
            return Err(StateError::precondition("pair was already measured"));
        }
        let mut level = Representation::Vector;
        for m in self.members.iter() {
            level = level.max(m.borrow().level());
        }
        let mut arrays = Vec::with_capacity(2);
        for m in self.members.iter() {
            let mut m = m.borrow_mut();
            while m.level() < level {
                m.expand();
            }
            let d = m.dimension();
            let shape = match level {
                Representation::Matrix => (d, d),
                _ => (d, 1),
            };
            let array = m
                .take_local()
                .ok_or_else(|| StateError::invalid_state("pair member carries no array"))?;
            arrays.push((array, shape));
        }
        let (a, sa) = arrays.remove(0);
        let (b, sb) = arrays.remove(0);
        self.state = Some(kron(&a, sa, &b, sb));
        self.level = level;
        for (slot, m) in self.members.iter().enumerate() {
            let mut m = m.borrow_mut();
            m.set_location(Location::InPair(slot));
            m.set_level(level);
        }
        Ok(())
    }

    /// Promote the joint array (or, while uncombined, each member) one
    /// representation level.
    pub fn expand(&mut self) {
        match self.state.as_ref() {
            Some(state) => {
                if self.level == Representation::Vector {
                    self.state = Some(expand_vector(state));
                    self.level = Representation::Matrix;
                    for m in self.members.iter() {
                        m.borrow_mut().set_level(Representation::Matrix);
                    }
                }
            }
            None => {
                for m in self.members.iter() {
                    m.borrow_mut().expand();
                }
            }
        }
    }

    /// Best-effort demotion of the joint array back to vector form.
    pub fn contract(&mut self, tol: f64) {
        if self.level != Representation::Matrix {
            return;
        }
        if let Some(state) = self.state.as_ref() {
            let [d0, d1] = self.dims();
            if let Some(psi) = contract_matrix(state, d0 * d1, tol) {
                self.state = Some(psi);
                self.level = Representation::Vector;
                for m in self.members.iter() {
                    m.borrow_mut().set_level(Representation::Vector);
                }
            }
        }
    }

    /// Surrender the joint array for Kronecker absorption into a
    /// product state. Members keep their levels; the caller re-indexes
    /// their locations.
    pub(crate) fn take_state(&mut self) -> Option<Vec<Complex64>> {
        self.state.take()
    }

    /// The reduced array of one slot: populations in vector form, a
    /// density matrix in matrix form, the member's own array while
    /// uncombined.
    pub fn trace_out_slot(&self, slot: usize) -> Vec<Complex64> {
        match self.state.as_ref() {
            Some(state) => {
                let dims = self.dims();
                match self.level {
                    Representation::Matrix => trace_out_matrix(&dims, &[slot], state),
                    _ => trace_out_vector(&dims, &[slot], state),
                }
            }
            None => {
                let m = self.members[slot].borrow();
                match m.level() {
                    Representation::Label => crate::state_ops::basis_vector(
                        m.dimension(),
                        m.value().unwrap_or(0),
                    ),
                    _ => m.local_array().unwrap_or_default(),
                }
            }
        }
    }

    /// Projectively measure the given members. A partial measurement
    /// leaves the remaining member with the post-measurement array as
    /// its own standalone state.
    pub fn measure(
        &mut self,
        targets: &[SystemRef],
        destructive: bool,
    ) -> StateResult<HashMap<SystemId, usize>> {
        if self.measured {
            return Err(StateError::precondition("pair was already measured"));
        }
        let mut outcomes = HashMap::new();
        if targets.is_empty() {
            return Ok(outcomes);
        }
        if let Some(state) = self.state.take() {
            let dims = self.dims();
            let mut slots = Vec::with_capacity(targets.len());
            for t in targets {
                let slot = self
                    .slot_of(t.borrow().id())
                    .ok_or_else(|| StateError::precondition("target is not a pair member"))?;
                if slots.contains(&slot) {
                    return Err(StateError::precondition("duplicate measurement target"));
                }
                slots.push(slot);
            }
            let mut rng = Config::fresh_rng();
            let (outs, rest) = match self.level {
                Representation::Matrix => measure_matrix(&dims, &slots, &state, &mut rng)?,
                _ => measure_vector(&dims, &slots, &state, &mut rng)?,
            };
            for (&slot, &out) in slots.iter().zip(outs.iter()) {
                let mut m = self.members[slot].borrow_mut();
                outcomes.insert(m.id(), out);
                m.collapse_to(out, destructive);
            }
            if slots.len() == 1 {
                let partner = &self.members[1 - slots[0]];
                let level = self.level;
                partner.borrow_mut().set_local_array(level, rest);
            }
            self.level = Representation::Label;
        } else {
            for t in targets {
                if self.slot_of(t.borrow().id()).is_none() {
                    return Err(StateError::precondition("target is not a pair member"));
                }
                let out = t.borrow_mut().measure(destructive)?;
                outcomes.insert(t.borrow().id(), out);
            }
        }
        if destructive {
            self.measured = true;
        }
        Ok(outcomes)
    }

    /// Apply a Kraus channel to the given members through the pair's
    /// joint array, combining it first if needed. Completeness of the
    /// family is the composite entry point's business.
    pub fn apply_kraus(
        &mut self,
        operators: &[Vec<Complex64>],
        targets: &[SystemRef],
    ) -> StateResult<()> {
        self.combine()?;
        while self.level < Representation::Matrix {
            self.expand();
        }
        let dims = self.dims();
        let mut slots = Vec::with_capacity(targets.len());
        for t in targets {
            let slot = self
                .slot_of(t.borrow().id())
                .ok_or_else(|| StateError::precondition("target is not a pair member"))?;
            if slots.contains(&slot) {
                return Err(StateError::precondition("duplicate channel target"));
            }
            slots.push(slot);
        }
        let d: usize = slots.iter().map(|&s| dims[s]).product();
        for op in operators {
            if op.len() != d * d {
                let side = (op.len() as f64).sqrt() as usize;
                return Err(StateError::ShapeMismatch {
                    expected: (d, d),
                    found: (side, side),
                });
            }
        }
        let state = self
            .state
            .take()
            .ok_or_else(|| StateError::invalid_state("pair carries no joint array"))?;
        self.state = Some(apply_kraus_matrix(&dims, &slots, &state, operators));
        if Config::current().auto_contract {
            self.contract(1e-6);
        }
        Ok(())
    }

    /// Apply a single-target operation to one member. While uncombined
    /// this falls through to the member's standalone path; the operator
    /// is materialized at the member's current dimension.
    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        target: &SystemRef,
    ) -> StateResult<()> {
        if self.state.is_none() {
            return target.borrow_mut().apply_operation(operation);
        }
        let slot = self
            .slot_of(target.borrow().id())
            .ok_or_else(|| StateError::precondition("target is not a pair member"))?;
        operation.validate_targets(&[target.borrow().kind()])?;

        if Config::current().dynamic_dimensions
            && target.borrow().kind() == SystemKind::Bosonic
        {
            let marginal = self.trace_out_slot(slot);
            let occupation = match self.level {
                Representation::Matrix => {
                    highest_occupation_matrix(&marginal, self.dims()[slot])
                }
                _ => highest_occupation_vector(&marginal),
            };
            let wanted = operation.compute_dimensions(&[occupation], &[marginal]);
            let _ = self.resize_member(target, wanted[0]);
        }

        let dims = self.dims();
        let op = operation.operator(&[dims[slot]])?;
        let state = self
            .state
            .take()
            .ok_or_else(|| StateError::invalid_state("pair carries no joint array"))?;
        let mut next = match self.level {
            Representation::Matrix => apply_operator_matrix(&dims, &[slot], &state, &op),
            _ => apply_operator_vector(&dims, &[slot], &state, &op),
        };
        if is_zero_array(&next, 1e-12) {
            self.state = Some(next);
            return Err(StateError::invalid_state(
                "state is entirely zero after the operation; was the vacuum annihilated?",
            ));
        }
        if operation.renormalize() {
            normalize(&mut next);
        }
        self.state = Some(next);

        for slot in 0..2 {
            if self.members[slot].borrow().kind() == SystemKind::Bosonic {
                let marginal = self.trace_out_slot(slot);
                let occupation = match self.level {
                    Representation::Matrix => {
                        highest_occupation_matrix(&marginal, self.dims()[slot])
                    }
                    _ => highest_occupation_vector(&marginal),
                };
                let wanted = occupation.max(1) + 1;
                if wanted < self.dims()[slot] {
                    let member = self.members[slot].clone();
                    let _ = self.resize_member(&member, wanted);
                }
            }
        }
        if Config::current().auto_contract {
            self.contract(1e-6);
        }
        Ok(())
    }

    /// Resize one truncatable member's axis of the joint array; falls
    /// through to the member's own resize while uncombined. Shrinking is
    /// rejected when the occupation estimate does not fit.
    pub fn resize_member(&mut self, target: &SystemRef, new_dimension: usize) -> bool {
        if target.borrow().kind() != SystemKind::Bosonic || new_dimension == 0 {
            return false;
        }
        let slot = match self.slot_of(target.borrow().id()) {
            Some(slot) => slot,
            None => return false,
        };
        let state = match self.state.take() {
            Some(state) => state,
            None => return target.borrow_mut().resize(new_dimension),
        };
        let dims = self.dims();
        if new_dimension == dims[slot] {
            self.state = Some(state);
            return true;
        }
        if new_dimension < dims[slot] {
            let marginal = match self.level {
                Representation::Matrix => trace_out_matrix(&dims, &[slot], &state),
                _ => trace_out_vector(&dims, &[slot], &state),
            };
            let occupation = match self.level {
                Representation::Matrix => highest_occupation_matrix(&marginal, dims[slot]),
                _ => highest_occupation_vector(&marginal),
            };
            if occupation >= new_dimension {
                self.state = Some(state);
                return false;
            }
        }
        let resized = match self.level {
            Representation::Matrix => {
                let full = [dims[0], dims[1], dims[0], dims[1]];
                let rows = resize_axis(&full, slot, new_dimension, &state);
                let mut grown = full;
                grown[slot] = new_dimension;
                resize_axis(&grown, slot + 2, new_dimension, &rows)
            }
            _ => resize_axis(&dims, slot, new_dimension, &state),
        };
        self.state = Some(resized);
        target.borrow_mut().set_dimension(new_dimension);
        true
    }
}

#[cfg(test)]
mod pair_tests {
    use super::*;
    use crate::system::System;

    #[test]
    fn test_combine_forms_joint_vector() {
        let a = System::qubit();
        let b = System::bosonic(3);
        b.borrow_mut().set_label(1).unwrap();
        let pair = Pair::new(&a, &b).unwrap();
        pair.borrow_mut().combine().unwrap();
        let p = pair.borrow();
        assert!(p.is_combined());
        assert_eq!(p.level(), Representation::Vector);
        assert_eq!(a.borrow().location(), Location::InPair(0));
        assert_eq!(b.borrow().location(), Location::InPair(1));
        // |0> x |1> over dims [2, 3] puts the amplitude at index 1
        let marginal = p.trace_out_slot(1);
        assert!((marginal[1].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_measurement_frees_partner() {
        let a = System::qubit();
        let b = System::qubit();
        let pair = Pair::new(&a, &b).unwrap();
        pair.borrow_mut().combine().unwrap();
        let outcomes = pair.borrow_mut().measure(&[a.clone()], true).unwrap();
        assert_eq!(outcomes[&a.borrow().id()], 0);
        assert!(a.borrow().is_measured());
        assert_eq!(b.borrow().location(), Location::Free);
        let partner = System::trace_out(&b).unwrap();
        assert!((partner[0].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pair_rejects_double_membership() {
        let a = System::qubit();
        let b = System::qubit();
        let _pair = Pair::new(&a, &b).unwrap();
        let c = System::qubit();
        assert!(Pair::new(&a, &c).is_err());
    }

    #[test]
    fn test_resize_member_in_joint_state() {
        let a = System::bosonic(2);
        let b = System::qubit();
        let pair = Pair::new(&a, &b).unwrap();
        pair.borrow_mut().combine().unwrap();
        assert!(pair.borrow_mut().resize_member(&a, 4));
        assert_eq!(a.borrow().dimension(), 4);
        let marginal = pair.borrow().trace_out_slot(0);
        assert_eq!(marginal.len(), 4);
        assert!((marginal[0].re - 1.0).abs() < 1e-12);
        // occupied vacuum only, shrinking back is allowed
        assert!(pair.borrow_mut().resize_member(&a, 2));
    }
}
