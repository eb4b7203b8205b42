//! One tensor-product subspace: an ordered member list and one flat
//! backing array, in vector or matrix form. All structural operations
//! keep the array shape consistent with the member dimensions; index
//! resynchronization across the owning store is the composite layer's
//! job.

use crate::config::Config;
use crate::errors::{StateError, StateResult};
use crate::operation::Operation;
use crate::plan::{reorder_permutation, retain_axes};
use crate::state_ops::measurement_ops::{measure_matrix, measure_povm_matrix, measure_vector};
use crate::state_ops::operator_ops::{
    apply_kraus_matrix, apply_operator_matrix, apply_operator_vector,
};
use crate::state_ops::tensor_ops::{
    is_zero_array, normalize, permute_matrix, permute_vector, resize_axis, trace_out_matrix,
    trace_out_vector,
};
use crate::state_ops::transform_ops::{
    contract_matrix, expand_vector, highest_occupation_matrix, highest_occupation_vector,
};
use crate::system::{SystemKind, SystemRef};
use crate::types::{ProductId, Representation, SystemId};
use crate::utils::{total_dim, AxisVec};
use num_complex::Complex64;
use num_traits::One;
use std::collections::HashMap;

/// An ordered set of subsystems sharing one backing array.
#[derive(Debug)]
pub struct ProductState {
    id: ProductId,
    level: Representation,
    state: Vec<Complex64>,
    members: Vec<SystemRef>,
}

impl ProductState {
    pub(crate) fn from_parts(
        level: Representation,
        state: Vec<Complex64>,
        members: Vec<SystemRef>,
    ) -> Self {
        Self {
            id: ProductId::fresh(),
            level,
            state,
            members,
        }
    }

    /// Identity of this product state.
    pub fn id(&self) -> ProductId {
        self.id
    }

    /// Representation level of the backing array.
    pub fn level(&self) -> Representation {
        self.level
    }

    /// The members in tensor order.
    pub fn members(&self) -> &[SystemRef] {
        &self.members
    }

    /// The backing array, flat row-major.
    pub fn state(&self) -> &[Complex64] {
        &self.state
    }

    /// True once every member has been measured or moved out.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Serialized byte footprint of the backing array.
    pub fn size(&self) -> usize {
        self.state.len() * size_of::<Complex64>()
    }

    /// True if the given subsystem is a member.
    pub fn contains(&self, id: SystemId) -> bool {
        self.members.iter().any(|m| m.borrow().id() == id)
    }

    fn dims(&self) -> AxisVec {
        self.members.iter().map(|m| m.borrow().dimension()).collect()
    }

    fn member_ids(&self) -> Vec<SystemId> {
        self.members.iter().map(|m| m.borrow().id()).collect()
    }

    /// Axis positions of `targets`, in target order; errors on
    /// duplicates or non-members.
    fn positions_of(&self, targets: &[SystemRef]) -> StateResult<Vec<usize>> {
        let current = self.member_ids();
        let wanted: Vec<SystemId> = targets.iter().map(|t| t.borrow().id()).collect();
        retain_axes(&current, &wanted).map(|(kept, _)| kept)
    }

    /// Promote the backing array to density-matrix form and propagate
    /// the level to every member. No-op if already there.
    pub fn expand(&mut self) {
        if self.level < Representation::Matrix {
            self.state = expand_vector(&self.state);
            self.level = Representation::Matrix;
            for m in self.members.iter() {
                m.borrow_mut().set_level(Representation::Matrix);
            }
        }
    }

    /// Attempt to recover vector form from a rank-1 density matrix.
    /// Best-effort: a mixed state is silently left in matrix form.
    pub fn contract(&mut self, tol: f64) {
        if self.level != Representation::Matrix {
            return;
        }
        let d = total_dim(&self.dims());
        if let Some(psi) = contract_matrix(&self.state, d, tol) {
            self.state = psi;
            self.level = Representation::Vector;
            for m in self.members.iter() {
                m.borrow_mut().set_level(Representation::Vector);
            }
        }
    }

    /// Permute the member order to exactly `target` (which must be a
    /// permutation of the current members) and the backing array with
    /// it. The owning store resynchronizes indices afterwards.
    pub fn reorder(&mut self, target: &[SystemRef]) -> StateResult<()> {
        let current = self.member_ids();
        let wanted: Vec<SystemId> = target.iter().map(|t| t.borrow().id()).collect();
        let perm = reorder_permutation(&current, &wanted)?;
        let dims = self.dims();
        self.state = match self.level {
            Representation::Matrix => permute_matrix(&dims, &perm, &self.state),
            _ => permute_vector(&dims, &perm, &self.state),
        };
        self.members = target.to_vec();
        Ok(())
    }

    /// Projectively measure `targets` (order-independent members of
    /// this product state). Measured members collapse to `Label`,
    /// detach, and are removed from the member list; the backing array
    /// shrinks accordingly. Returns each target's sampled outcome.
    pub fn measure(
        &mut self,
        targets: &[SystemRef],
        destructive: bool,
    ) -> StateResult<HashMap<SystemId, usize>> {
        let positions = self.positions_of(targets)?;
        let dims = self.dims();
        let mut rng = Config::fresh_rng();
        let (outs, rest) = match self.level {
            Representation::Matrix => measure_matrix(&dims, &positions, &self.state, &mut rng)?,
            _ => measure_vector(&dims, &positions, &self.state, &mut rng)?,
        };

        let mut outcomes = HashMap::new();
        for (t, &out) in targets.iter().zip(outs.iter()) {
            let mut s = t.borrow_mut();
            outcomes.insert(s.id(), out);
            s.collapse_to(out, destructive);
        }
        let measured_ids: Vec<SystemId> = outcomes.keys().copied().collect();
        self.members.retain(|m| !measured_ids.contains(&m.borrow().id()));
        self.state = if self.members.is_empty() {
            vec![Complex64::one()]
        } else {
            rest
        };
        if Config::current().auto_contract && !self.members.is_empty() {
            self.contract(1e-6);
        }
        Ok(outcomes)
    }

    /// Generalized measurement with the given operators over `targets`.
    /// Forces matrix form first; the backing array becomes the
    /// renormalized post-measurement state of the sampled operator.
    /// Returns the sampled operator index. Destructive follow-up (the
    /// collapse of the measured members out of the array) is driven by
    /// the composite layer.
    pub fn measure_povm(
        &mut self,
        operators: &[Vec<Complex64>],
        targets: &[SystemRef],
    ) -> StateResult<usize> {
        while self.level < Representation::Matrix {
            self.expand();
        }
        let positions = self.positions_of(targets)?;
        let dims = self.dims();
        let d: usize = positions.iter().map(|&p| dims[p]).product();
        for op in operators {
            if op.len() != d * d {
                let side = (op.len() as f64).sqrt() as usize;
                return Err(StateError::ShapeMismatch {
                    expected: (d, d),
                    found: (side, side),
                });
            }
        }
        let mut rng = Config::fresh_rng();
        let (outcome, post) =
            measure_povm_matrix(&dims, &positions, operators, &self.state, &mut rng)?;
        self.state = post;
        if Config::current().auto_contract && !self.members.is_empty() {
            self.contract(1e-6);
        }
        Ok(outcome)
    }

    /// Apply a Kraus channel to `targets`. Forces matrix form first
    /// (looping the promotion, defensive against multi-step level
    /// enums). The completeness relation is verified by the composite
    /// entry point before delegation; a helper is available there.
    pub fn apply_kraus(
        &mut self,
        operators: &[Vec<Complex64>],
        targets: &[SystemRef],
    ) -> StateResult<()> {
        while self.level < Representation::Matrix {
            self.expand();
        }
        let positions = self.positions_of(targets)?;
        let dims = self.dims();
        let d: usize = positions.iter().map(|&p| dims[p]).product();
        for op in operators {
            if op.len() != d * d {
                let side = (op.len() as f64).sqrt() as usize;
                return Err(StateError::ShapeMismatch {
                    expected: (d, d),
                    found: (side, side),
                });
            }
        }
        self.state = apply_kraus_matrix(&dims, &positions, &self.state, operators);
        if Config::current().auto_contract {
            self.contract(1e-6);
        }
        Ok(())
    }

    /// Apply an operation descriptor to `targets`. The targets' current
    /// dimensions feed the operator builder (any dynamic resizing has
    /// already happened at the composite layer); afterwards truncatable
    /// members are shrunk to just above their occupation and the state
    /// is renormalized when the operation requests it.
    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        targets: &[SystemRef],
    ) -> StateResult<()> {
        if is_zero_array(&self.state, 1e-12) {
            return Err(StateError::invalid_state("the backing array is entirely zero"));
        }
        let kinds: Vec<SystemKind> = targets.iter().map(|t| t.borrow().kind()).collect();
        operation.validate_targets(&kinds)?;
        let positions = self.positions_of(targets)?;
        let dims = self.dims();
        let target_dims: AxisVec = positions.iter().map(|&p| dims[p]).collect();
        let op = operation.operator(&target_dims)?;

        let next = match self.level {
            Representation::Matrix => apply_operator_matrix(&dims, &positions, &self.state, &op),
            _ => apply_operator_vector(&dims, &positions, &self.state, &op),
        };
        if is_zero_array(&next, 1e-12) {
            self.state = next;
            return Err(StateError::invalid_state(
                "state is entirely zero after the operation; was the vacuum annihilated?",
            ));
        }
        self.state = next;
        if operation.renormalize() {
            normalize(&mut self.state);
        }

        // Drop unused high levels of truncatable members.
        for pos in 0..self.members.len() {
            if self.members[pos].borrow().kind() != SystemKind::Bosonic {
                continue;
            }
            let occupation = self.occupation_at(pos);
            let wanted = occupation.max(1) + 1;
            if wanted < self.members[pos].borrow().dimension() {
                self.resize_member_axis(pos, wanted);
            }
        }
        if Config::current().auto_contract {
            self.contract(1e-6);
        }
        Ok(())
    }

    /// The reduced array over `targets`, tensored in the order given:
    /// populations in vector form, a density matrix in matrix form.
    /// Does not mutate this product state.
    pub fn trace_out(&self, targets: &[SystemRef]) -> StateResult<Vec<Complex64>> {
        let positions = self.positions_of(targets)?;
        let dims = self.dims();
        Ok(match self.level {
            Representation::Matrix => trace_out_matrix(&dims, &positions, &self.state),
            _ => trace_out_vector(&dims, &positions, &self.state),
        })
    }

    fn occupation_at(&self, pos: usize) -> usize {
        let dims = self.dims();
        match self.level {
            Representation::Matrix => {
                let marginal = trace_out_matrix(&dims, &[pos], &self.state);
                highest_occupation_matrix(&marginal, dims[pos])
            }
            _ => {
                let marginal = trace_out_vector(&dims, &[pos], &self.state);
                highest_occupation_vector(&marginal)
            }
        }
    }

    /// Unchecked single-axis resize; shrink feasibility is the caller's
    /// business.
    fn resize_member_axis(&mut self, pos: usize, new_dim: usize) {
        let dims = self.dims();
        self.state = match self.level {
            Representation::Matrix => {
                let n = dims.len();
                let full: AxisVec = dims.iter().chain(dims.iter()).copied().collect();
                let rows = resize_axis(&full, pos, new_dim, &self.state);
                let mut grown = full;
                grown[pos] = new_dim;
                resize_axis(&grown, pos + n, new_dim, &rows)
            }
            _ => resize_axis(&dims, pos, new_dim, &self.state),
        };
        self.members[pos].borrow_mut().set_dimension(new_dim);
    }

    /// Grow or shrink one truncatable member's axis. Growing pads with
    /// zeros and always succeeds; shrinking is rejected (returning
    /// `false`, with nothing mutated) when the member's occupation
    /// estimate does not fit under the new cutoff.
    pub fn resize_fock(&mut self, new_dimension: usize, target: &SystemRef) -> StateResult<bool> {
        let pos = self
            .positions_of(std::slice::from_ref(target))?
            .pop()
            .expect("retain_axes returns one position per target");
        if new_dimension == 0 {
            return Ok(false);
        }
        let current = self.dims()[pos];
        if new_dimension == current {
            return Ok(true);
        }
        if new_dimension < current && self.occupation_at(pos) >= new_dimension {
            return Ok(false);
        }
        self.resize_member_axis(pos, new_dimension);
        Ok(true)
    }

    /// Surrender the backing array and member list for a merge,
    /// leaving this product state empty (scalar identity array) and
    /// eligible for pruning.
    pub(crate) fn take_for_merge(&mut self) -> (Vec<Complex64>, Vec<SystemRef>) {
        let state = std::mem::replace(&mut self.state, vec![Complex64::one()]);
        let members = std::mem::take(&mut self.members);
        (state, members)
    }
}
