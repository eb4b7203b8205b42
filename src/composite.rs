//! Composite systems: the store owning product states, the process-wide
//! registry of stores, and the public handle through which everything is
//! orchestrated.
//!
//! A handle is a copyable id aliasing exactly one store through the
//! registry. Creating a handle over parts that already belong to other
//! composite systems merges their stores into one and remaps every
//! participating id to the survivor, so the merge is observable through
//! every pre-existing handle. Every public operation follows one
//! pattern: locate the product states touching the involved subsystems,
//! merge them if more than one is touched, fix the tensor order,
//! delegate to the single resulting product state, then resynchronize
//! indices and prune emptied product states.

use crate::config::Config;
use crate::errors::{StateError, StateResult};
use crate::operation::Operation;
use crate::pair::PairRef;
use crate::product_state::ProductState;
use crate::state_ops::operator_ops::kraus_identity_check;
use crate::state_ops::tensor_ops::kron_all;
use crate::state_ops::transform_ops::{highest_occupation_matrix, highest_occupation_vector};
use crate::system::{SystemKind, SystemRef};
use crate::types::{CompositeId, Location, ProductId, Representation, SystemId};
use num_complex::Complex64;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const KRAUS_TOL: f64 = 1e-6;

thread_local! {
    static REGISTRY: RefCell<HashMap<CompositeId, Rc<RefCell<CompositeStore>>>> =
        RefCell::new(HashMap::new());
}

/// The backing store of one composite system: its product states, the
/// de-duplicated set of member subsystems, and the pair containers
/// participating. Owned by the registry; possibly aliased by several
/// handles.
#[derive(Debug)]
pub struct CompositeStore {
    id: CompositeId,
    product_states: Vec<ProductState>,
    members: Vec<SystemRef>,
    pairs: Vec<PairRef>,
}

impl CompositeStore {
    fn new(id: CompositeId) -> Self {
        Self {
            id,
            product_states: Vec::new(),
            members: Vec::new(),
            pairs: Vec::new(),
        }
    }

    /// The representative id of this store.
    pub fn id(&self) -> CompositeId {
        self.id
    }

    /// The product states currently held.
    pub fn product_states(&self) -> &[ProductState] {
        &self.product_states
    }

    /// Every subsystem attached to this composite system.
    pub fn members(&self) -> &[SystemRef] {
        &self.members
    }

    /// The pair containers participating.
    pub fn pairs(&self) -> &[PairRef] {
        &self.pairs
    }

    fn has_member(&self, id: SystemId) -> bool {
        self.members.iter().any(|m| m.borrow().id() == id)
    }

    fn add_member(&mut self, system: &SystemRef) {
        if !self.has_member(system.borrow().id()) {
            self.members.push(system.clone());
        }
    }

    fn add_pair(&mut self, pair: &PairRef) {
        if !self
            .pairs
            .iter()
            .any(|p| p.borrow().id() == pair.borrow().id())
        {
            self.pairs.push(pair.clone());
        }
    }

    fn take_contents(&mut self) -> (Vec<ProductState>, Vec<SystemRef>, Vec<PairRef>) {
        (
            std::mem::take(&mut self.product_states),
            std::mem::take(&mut self.members),
            std::mem::take(&mut self.pairs),
        )
    }

    /// Structural merge of another store's contents into this one; no
    /// array recomputation happens here.
    pub(crate) fn append_states(
        &mut self,
        products: Vec<ProductState>,
        members: Vec<SystemRef>,
        pairs: Vec<PairRef>,
    ) {
        self.product_states.extend(products);
        for m in members.iter() {
            self.add_member(m);
        }
        for p in pairs.iter() {
            self.add_pair(p);
        }
    }

    /// Prune every product state whose member list is empty.
    pub(crate) fn remove_empty_product_states(&mut self) {
        self.product_states.retain(|ps| !ps.is_empty());
    }

    /// Recompute every member's location descriptor and point every
    /// member and pair back at this store's representative handle.
    pub(crate) fn update_all_indices(&mut self) {
        for ps in self.product_states.iter() {
            let product = ps.id();
            for (position, m) in ps.members().iter().enumerate() {
                let mut m = m.borrow_mut();
                m.set_location(Location::InProduct { product, position });
            }
        }
        for m in self.members.iter() {
            m.borrow_mut().composite = Some(self.id);
        }
        for p in self.pairs.iter() {
            p.borrow_mut().composite = Some(self.id);
        }
    }

    fn ps_index_by_id(&self, id: ProductId) -> Option<usize> {
        self.product_states.iter().position(|ps| ps.id() == id)
    }

    fn ps_index_containing_all(&self, targets: &[SystemRef]) -> Option<usize> {
        self.product_states.iter().position(|ps| {
            targets.iter().all(|t| ps.contains(t.borrow().id()))
        })
    }

    /// Indices of product states touching any target, ordered by first
    /// appearance over the targets.
    fn ps_indices_touching(&self, targets: &[SystemRef]) -> Vec<usize> {
        let mut touched = Vec::new();
        for t in targets {
            let id = t.borrow().id();
            if let Some(i) = self.product_states.iter().position(|ps| ps.contains(id)) {
                if !touched.contains(&i) {
                    touched.push(i);
                }
            }
        }
        touched
    }
}

/// One ingredient of a composite system.
#[derive(Clone, Debug)]
pub enum Part {
    /// A single subsystem.
    System(SystemRef),
    /// A pair container and, implicitly, its two members.
    Pair(PairRef),
    /// An existing composite system to merge in.
    Composite(Composite),
}

impl From<&SystemRef> for Part {
    fn from(system: &SystemRef) -> Self {
        Part::System(system.clone())
    }
}

impl From<&PairRef> for Part {
    fn from(pair: &PairRef) -> Self {
        Part::Pair(pair.clone())
    }
}

impl From<Composite> for Part {
    fn from(composite: Composite) -> Self {
        Part::Composite(composite)
    }
}

impl From<&Composite> for Part {
    fn from(composite: &Composite) -> Self {
        Part::Composite(*composite)
    }
}

fn shape_for(level: Representation, d: usize) -> (usize, usize) {
    match level {
        Representation::Matrix => (d, d),
        _ => (d, 1),
    }
}

fn push_unique(list: &mut Vec<SystemRef>, system: &SystemRef) {
    let id = system.borrow().id();
    if !list.iter().any(|s| s.borrow().id() == id) {
        list.push(system.clone());
    }
}

fn union_with_members(
    store: &CompositeStore,
    touched: &[usize],
    targets: &[SystemRef],
) -> Vec<SystemRef> {
    let mut all: Vec<SystemRef> = Vec::new();
    for t in targets {
        push_unique(&mut all, t);
    }
    for &i in touched {
        for m in store.product_states[i].members() {
            push_unique(&mut all, m);
        }
    }
    all
}

/// A handle on one composite system. Copyable; many handles may alias
/// one backing store after composite systems were merged.
#[derive(Clone, Copy, Debug)]
pub struct Composite {
    id: CompositeId,
}

impl Composite {
    pub(crate) fn with_id(id: CompositeId) -> Self {
        Self { id }
    }

    /// Build a composite system from subsystems, pairs and existing
    /// composite systems. Parts that already belong to other composite
    /// systems pull those in; all participating stores merge into one,
    /// and every pre-existing handle observes the merged store from now
    /// on.
    pub fn of<I>(parts: I) -> Composite
    where
        I: IntoIterator<Item = Part>,
    {
        let id = CompositeId::fresh();
        let mut systems: Vec<SystemRef> = Vec::new();
        let mut pairs: Vec<PairRef> = Vec::new();
        let mut prior: Vec<CompositeId> = Vec::new();

        for part in parts {
            match part {
                Part::System(s) => {
                    if let Some(p) = s.borrow().pair_ref() {
                        if !pairs.iter().any(|q| q.borrow().id() == p.borrow().id()) {
                            pairs.push(p);
                        }
                    }
                    push_unique(&mut systems, &s);
                }
                Part::Pair(p) => {
                    if !pairs.iter().any(|q| q.borrow().id() == p.borrow().id()) {
                        pairs.push(p);
                    }
                }
                Part::Composite(c) => prior.push(c.id),
            }
        }
        let pair_members: Vec<SystemRef> = pairs
            .iter()
            .flat_map(|p| p.borrow().members())
            .collect();
        for m in pair_members.iter() {
            push_unique(&mut systems, m);
        }
        for s in systems.iter() {
            if let Some(cid) = s.borrow().composite() {
                prior.push(cid);
            }
        }
        for p in pairs.iter() {
            if let Some(cid) = p.borrow().composite {
                prior.push(cid);
            }
        }

        let mut stores: Vec<Rc<RefCell<CompositeStore>>> = Vec::new();
        REGISTRY.with(|r| {
            let r = r.borrow();
            for cid in prior.iter() {
                if let Some(store) = r.get(cid) {
                    if !stores.iter().any(|s| Rc::ptr_eq(s, store)) {
                        stores.push(store.clone());
                    }
                }
            }
        });

        let survivor = match stores.first() {
            Some(store) => store.clone(),
            None => Rc::new(RefCell::new(CompositeStore::new(id))),
        };
        let absorbed: Vec<Rc<RefCell<CompositeStore>>> = stores.into_iter().skip(1).collect();
        for other in absorbed.iter() {
            let (products, members, merged_pairs) = other.borrow_mut().take_contents();
            survivor
                .borrow_mut()
                .append_states(products, members, merged_pairs);
        }
        REGISTRY.with(|r| {
            let mut r = r.borrow_mut();
            for slot in r.values_mut() {
                if absorbed.iter().any(|a| Rc::ptr_eq(a, slot)) {
                    *slot = survivor.clone();
                }
            }
            r.insert(id, survivor.clone());
        });

        {
            let mut st = survivor.borrow_mut();
            st.id = id;
            for p in pairs.iter() {
                st.add_pair(p);
            }
            for s in systems.iter() {
                st.add_member(s);
            }
            st.update_all_indices();
        }
        Composite { id }
    }

    /// The id of this handle.
    pub fn id(&self) -> CompositeId {
        self.id
    }

    fn store(&self) -> StateResult<Rc<RefCell<CompositeStore>>> {
        REGISTRY
            .with(|r| r.borrow().get(&self.id).cloned())
            .ok_or_else(|| {
                StateError::precondition("composite handle is not registered (was it released?)")
            })
    }

    /// Run a closure over the backing store, e.g. for inspection.
    pub fn with_store<T>(&self, f: impl FnOnce(&CompositeStore) -> T) -> StateResult<T> {
        let store = self.store()?;
        let st = store.borrow();
        Ok(f(&st))
    }

    /// Drop this handle's registry entry. The backing store is freed
    /// once its last aliasing handle is released.
    pub fn release(self) {
        REGISTRY.with(|r| {
            r.borrow_mut().remove(&self.id);
        });
    }

    /// Merge the given subsystems (and every product state or pair
    /// state touching them) into one product state, tensoring
    /// left-to-right in processing order. A call whose targets already
    /// share one product state is a no-op.
    pub fn combine(&self, targets: &[SystemRef]) -> StateResult<()> {
        if targets.is_empty() {
            return Err(StateError::precondition("combine needs at least one subsystem"));
        }
        let store = self.store()?;
        {
            let st = store.borrow();
            if st.ps_index_containing_all(targets).is_some() {
                return Ok(());
            }
            for t in targets {
                let t = t.borrow();
                if !st.has_member(t.id()) {
                    return Err(StateError::precondition(
                        "subsystem is not part of this composite system",
                    ));
                }
                if t.is_measured() {
                    return Err(StateError::precondition(
                        "cannot combine a destructively measured subsystem",
                    ));
                }
            }
        }

        // Raise everything touched to the highest level among the
        // targets; never downgrade.
        let mut level = Representation::Vector;
        for t in targets {
            level = level.max(t.borrow().level());
        }

        let mut st = store.borrow_mut();
        let touched = st.ps_indices_touching(targets);
        for &i in touched.iter() {
            while st.product_states[i].level() < level {
                st.product_states[i].expand();
            }
        }

        let mut arrays: Vec<(Vec<Complex64>, (usize, usize))> = Vec::new();
        let mut order: Vec<SystemRef> = Vec::new();
        for &i in touched.iter() {
            let d: usize = st.product_states[i]
                .members()
                .iter()
                .map(|m| m.borrow().dimension())
                .product();
            let (state, members) = st.product_states[i].take_for_merge();
            arrays.push((state, shape_for(level, d)));
            order.extend(members);
        }
        for t in targets {
            if order.iter().any(|m| m.borrow().id() == t.borrow().id()) {
                continue;
            }
            let location = t.borrow().location();
            match location {
                Location::InProduct { .. } => {}
                Location::InPair(_) => {
                    let pair = t.borrow().pair_ref().ok_or_else(|| {
                        StateError::invalid_state("pair container is gone")
                    })?;
                    let mut p = pair.borrow_mut();
                    while p.level() < level {
                        p.expand();
                    }
                    let members = p.members();
                    let d = members[0].borrow().dimension() * members[1].borrow().dimension();
                    let state = p.take_state().ok_or_else(|| {
                        StateError::invalid_state("pair lost its joint array")
                    })?;
                    arrays.push((state, shape_for(level, d)));
                    order.extend(members);
                }
                Location::Free => {
                    let mut s = t.borrow_mut();
                    while s.level() < level {
                        s.expand();
                    }
                    let d = s.dimension();
                    let state = s.take_local().ok_or_else(|| {
                        StateError::invalid_state("subsystem carries no array to absorb")
                    })?;
                    arrays.push((state, shape_for(level, d)));
                    drop(s);
                    order.push(t.clone());
                }
            }
        }

        let (state, _) = kron_all(arrays);
        st.product_states
            .push(ProductState::from_parts(level, state, order));
        st.remove_empty_product_states();
        st.update_all_indices();
        Ok(())
    }

    /// Bring the named subsystems to the front of their shared product
    /// state in the given order (combining them first if needed);
    /// unnamed members keep their relative order.
    pub fn reorder(&self, ordered: &[SystemRef]) -> StateResult<()> {
        if ordered.is_empty() {
            return Ok(());
        }
        let store = self.store()?;
        let combined = store.borrow().ps_index_containing_all(ordered).is_some();
        if !combined {
            self.combine(ordered)?;
        }
        let mut st = store.borrow_mut();
        let idx = st.ps_index_containing_all(ordered).ok_or_else(|| {
            StateError::invalid_state("combine did not produce a shared product state")
        })?;
        let ordered_ids: Vec<SystemId> = ordered.iter().map(|s| s.borrow().id()).collect();
        let mut new_order: Vec<SystemRef> = ordered.to_vec();
        for m in st.product_states[idx].members().to_vec() {
            if !ordered_ids.contains(&m.borrow().id()) {
                new_order.push(m);
            }
        }
        st.product_states[idx].reorder(&new_order)?;
        st.update_all_indices();
        Ok(())
    }

    /// Promote every product state touching the given subsystems to
    /// matrix form.
    pub fn expand(&self, targets: &[SystemRef]) -> StateResult<()> {
        let store = self.store()?;
        let mut st = store.borrow_mut();
        for i in st.ps_indices_touching(targets) {
            st.product_states[i].expand();
        }
        Ok(())
    }

    /// Attempt vector-form recovery on every product state touching the
    /// given subsystems. Best-effort, never fails.
    pub fn contract(&self, targets: &[SystemRef], tol: f64) -> StateResult<()> {
        let store = self.store()?;
        let mut st = store.borrow_mut();
        for i in st.ps_indices_touching(targets) {
            st.product_states[i].contract(tol);
        }
        Ok(())
    }

    /// Projectively measure the given subsystems wherever they live.
    /// With `separate_measurement` false, pair partners of the targets
    /// collapse along with them. Returns every sampled outcome keyed by
    /// subsystem identity.
    pub fn measure(
        &self,
        targets: &[SystemRef],
        separate_measurement: bool,
        destructive: bool,
    ) -> StateResult<HashMap<SystemId, usize>> {
        let store = self.store()?;
        let mut list: Vec<SystemRef> = Vec::new();
        for t in targets {
            push_unique(&mut list, t);
        }
        if !separate_measurement {
            let mut partners: Vec<SystemRef> = Vec::new();
            for t in list.iter() {
                if let Some(p) = t.borrow().pair_ref() {
                    for m in p.borrow().members() {
                        partners.push(m);
                    }
                }
            }
            for m in partners.iter() {
                push_unique(&mut list, m);
            }
        }

        let mut outcomes: HashMap<SystemId, usize> = HashMap::new();
        let mut pair_groups: Vec<(PairRef, Vec<SystemRef>)> = Vec::new();
        let mut product_groups: Vec<(ProductId, Vec<SystemRef>)> = Vec::new();
        for s in list.iter() {
            let location = s.borrow().location();
            match location {
                Location::Free => {
                    if !s.borrow().is_measured() {
                        let out = s.borrow_mut().measure(destructive)?;
                        outcomes.insert(s.borrow().id(), out);
                    }
                }
                Location::InPair(_) => {
                    let pair = s.borrow().pair_ref().ok_or_else(|| {
                        StateError::invalid_state("pair container is gone")
                    })?;
                    let pid = pair.borrow().id();
                    match pair_groups.iter_mut().find(|(p, _)| p.borrow().id() == pid) {
                        Some((_, group)) => group.push(s.clone()),
                        None => pair_groups.push((pair, vec![s.clone()])),
                    }
                }
                Location::InProduct { product, .. } => {
                    match product_groups.iter_mut().find(|(p, _)| *p == product) {
                        Some((_, group)) => group.push(s.clone()),
                        None => product_groups.push((product, vec![s.clone()])),
                    }
                }
            }
        }

        for (pair, group) in pair_groups.into_iter() {
            outcomes.extend(pair.borrow_mut().measure(&group, destructive)?);
        }
        {
            let mut st = store.borrow_mut();
            for (pid, group) in product_groups.into_iter() {
                let idx = st.ps_index_by_id(pid).ok_or_else(|| {
                    StateError::invalid_state("product state disappeared mid-measurement")
                })?;
                outcomes.extend(st.product_states[idx].measure(&group, destructive)?);
            }
            st.remove_empty_product_states();
            st.update_all_indices();
        }

        if destructive {
            for s in list.iter() {
                let pair = s.borrow().pair_ref();
                if let Some(p) = pair {
                    p.borrow_mut().set_measured();
                }
            }
        }
        Ok(outcomes)
    }

    /// Generalized measurement of the given subsystems with the given
    /// operators (each `(D, D)` over the targets' joint dimension).
    /// Returns the sampled operator index plus the outcomes of any
    /// subsystems that had to be resolved outside the product state
    /// during a destructive measurement.
    pub fn measure_povm(
        &self,
        operators: &[Vec<Complex64>],
        targets: &[SystemRef],
        destructive: bool,
    ) -> StateResult<(usize, HashMap<SystemId, usize>)> {
        let d: usize = targets.iter().map(|t| t.borrow().dimension()).product();
        for op in operators {
            if op.len() != d * d {
                let side = (op.len() as f64).sqrt() as usize;
                return Err(StateError::ShapeMismatch {
                    expected: (d, d),
                    found: (side, side),
                });
            }
        }

        let store = self.store()?;
        let touched = {
            let st = store.borrow();
            let touched = st.ps_indices_touching(targets);
            if touched.len() > 1 {
                Some(union_with_members(&st, &touched, targets))
            } else if touched.is_empty() {
                Some(targets.to_vec())
            } else {
                None
            }
        };
        if let Some(all) = touched {
            self.combine(&all)?;
        }
        self.reorder(targets)?;

        let outcome = {
            let mut st = store.borrow_mut();
            let idx = st.ps_index_containing_all(targets).ok_or_else(|| {
                StateError::invalid_state("no shared product state after combining")
            })?;
            st.product_states[idx].measure_povm(operators, targets)?
        };

        let mut resolved: HashMap<SystemId, usize> = HashMap::new();
        if destructive {
            // Opaque custom subsystems cannot be destroyed; capture
            // their reduced state out of the post-measurement array
            // before the collapse, and hand it back afterwards.
            let captures: Vec<(SystemRef, Vec<Complex64>)> = {
                let st = store.borrow();
                let idx = st.ps_index_containing_all(targets).ok_or_else(|| {
                    StateError::invalid_state("no shared product state after combining")
                })?;
                let mut captures = Vec::new();
                for t in targets {
                    if t.borrow().kind() == SystemKind::Custom {
                        let reduced =
                            st.product_states[idx].trace_out(std::slice::from_ref(t))?;
                        captures.push((t.clone(), reduced));
                    }
                }
                captures
            };

            let target_ids: Vec<SystemId> = targets.iter().map(|t| t.borrow().id()).collect();
            let collapsed = self.measure(targets, true, true)?;
            for (id, out) in collapsed.into_iter() {
                if !target_ids.contains(&id) {
                    resolved.insert(id, out);
                }
            }
            for (t, reduced) in captures.into_iter() {
                let mut s = t.borrow_mut();
                s.set_local_array(Representation::Matrix, reduced);
                s.clear_measured();
            }
        }
        Ok((outcome, resolved))
    }

    /// Apply a Kraus channel to the given (pairwise distinct)
    /// subsystems. With `identity_check` the completeness relation is
    /// verified first and a non-trace-preserving family is rejected
    /// before anything is touched. Subsystems still unentangled from
    /// everything else take the channel in their narrower scope instead
    /// of forcing a merge.
    pub fn apply_kraus(
        &self,
        operators: &[Vec<Complex64>],
        targets: &[SystemRef],
        identity_check: bool,
    ) -> StateResult<()> {
        let mut seen: Vec<SystemId> = Vec::new();
        for t in targets {
            let id = t.borrow().id();
            if seen.contains(&id) {
                return Err(StateError::precondition(
                    "channel targets must be pairwise distinct",
                ));
            }
            seen.push(id);
        }
        let d: usize = targets.iter().map(|t| t.borrow().dimension()).product();
        for op in operators {
            if op.len() != d * d {
                let side = (op.len() as f64).sqrt() as usize;
                return Err(StateError::ShapeMismatch {
                    expected: (d, d),
                    found: (side, side),
                });
            }
        }
        if identity_check && !kraus_identity_check(operators, d, KRAUS_TOL) {
            return Err(StateError::InvalidChannel(
                "Kraus operators do not sum to the identity".to_string(),
            ));
        }

        let store = self.store()?;
        let touched = {
            let st = store.borrow();
            let touched = st.ps_indices_touching(targets);
            if touched.len() > 1 {
                Some(union_with_members(&st, &touched, targets))
            } else {
                None
            }
        };
        match touched {
            Some(all) => {
                self.combine(&all)?;
                self.reorder(targets)?;
            }
            None => {
                let touched_count = store.borrow().ps_indices_touching(targets).len();
                if touched_count == 0 {
                    // Narrow-scope shortcut: unentangled targets take
                    // the channel without growing any tensor product.
                    if targets.len() == 1 {
                        let location = targets[0].borrow().location();
                        match location {
                            Location::Free => {
                                return targets[0].borrow_mut().apply_kraus(operators);
                            }
                            Location::InPair(_) => {
                                let pair = targets[0].borrow().pair_ref().ok_or_else(|| {
                                    StateError::invalid_state("pair container is gone")
                                })?;
                                return pair.borrow_mut().apply_kraus(operators, targets);
                            }
                            Location::InProduct { .. } => {}
                        }
                    } else if targets.len() == 2 {
                        let pa = targets[0].borrow().pair_ref();
                        let pb = targets[1].borrow().pair_ref();
                        if let (Some(pa), Some(pb)) = (pa, pb) {
                            if Rc::ptr_eq(&pa, &pb) {
                                return pa.borrow_mut().apply_kraus(operators, targets);
                            }
                        }
                    }
                    self.combine(targets)?;
                }
                self.reorder(targets)?;
            }
        }

        let mut st = store.borrow_mut();
        let idx = st.ps_index_containing_all(targets).ok_or_else(|| {
            StateError::invalid_state("no shared product state after combining")
        })?;
        st.product_states[idx].apply_kraus(operators, targets)
    }

    /// The reduced array over the given subsystems, tensored in the
    /// order given. Merges their product states first if they are
    /// spread over several; fails if none of them is in one.
    pub fn trace_out(&self, targets: &[SystemRef]) -> StateResult<Vec<Complex64>> {
        let store = self.store()?;
        let touched = {
            let st = store.borrow();
            let touched = st.ps_indices_touching(targets);
            if touched.is_empty() {
                return Err(StateError::precondition(
                    "no product state holds the requested subsystems",
                ));
            }
            if touched.len() > 1 {
                Some(union_with_members(&st, &touched, targets))
            } else {
                None
            }
        };
        if let Some(all) = touched {
            self.combine(&all)?;
        }
        if targets.len() > 1 {
            self.reorder(targets)?;
        }
        let st = store.borrow();
        let idx = st.ps_index_containing_all(targets).ok_or_else(|| {
            StateError::invalid_state("no shared product state after combining")
        })?;
        st.product_states[idx].trace_out(targets)
    }

    /// Resize a truncatable member. Standalone subsystems resize in
    /// place; one living in a product state is brought to the front of
    /// it and resized there. Returns `false` (mutating nothing) when a
    /// shrink would truncate occupied population.
    pub fn resize_fock(&self, new_dimension: usize, target: &SystemRef) -> StateResult<bool> {
        if target.borrow().kind() != SystemKind::Bosonic {
            return Err(StateError::precondition(
                "only truncatable oscillator subsystems can be resized",
            ));
        }
        let store = self.store()?;
        if !store.borrow().has_member(target.borrow().id()) {
            return Err(StateError::precondition(
                "subsystem is not part of this composite system",
            ));
        }
        let location = target.borrow().location();
        match location {
            Location::Free => Ok(target.borrow_mut().resize(new_dimension)),
            Location::InPair(_) => {
                let pair = target
                    .borrow()
                    .pair_ref()
                    .ok_or_else(|| StateError::invalid_state("pair container is gone"))?;
                let resized = pair.borrow_mut().resize_member(target, new_dimension);
                Ok(resized)
            }
            Location::InProduct { .. } => {
                self.reorder(std::slice::from_ref(target))?;
                let mut st = store.borrow_mut();
                let idx = st
                    .ps_index_containing_all(std::slice::from_ref(target))
                    .ok_or_else(|| {
                        StateError::invalid_state("product state disappeared mid-resize")
                    })?;
                st.product_states[idx].resize_fock(new_dimension, target)
            }
        }
    }

    /// Apply an operation descriptor to the given subsystems. A single
    /// standalone target is served directly; otherwise every touched
    /// product state is merged into one holding all targets, truncatable
    /// targets are resized to the dimensions the descriptor requests
    /// (when dynamic sizing is enabled), and the operator is applied
    /// there.
    pub fn apply_operation(
        &self,
        operation: &Operation,
        targets: &[SystemRef],
    ) -> StateResult<()> {
        let kinds: Vec<SystemKind> = targets.iter().map(|t| t.borrow().kind()).collect();
        operation.validate_targets(&kinds)?;
        if targets.len() == 1 {
            let location = targets[0].borrow().location();
            match location {
                Location::Free => return targets[0].borrow_mut().apply_operation(operation),
                Location::InPair(_) => {
                    let pair = targets[0]
                        .borrow()
                        .pair_ref()
                        .ok_or_else(|| StateError::invalid_state("pair container is gone"))?;
                    let result = pair.borrow_mut().apply_operation(operation, &targets[0]);
                    return result;
                }
                Location::InProduct { .. } => {}
            }
        }

        let store = self.store()?;
        let merge = {
            let st = store.borrow();
            let touched = st.ps_indices_touching(targets);
            let holds_all = st.ps_index_containing_all(targets).is_some();
            if touched.len() > 1 || (touched.len() == 1 && !holds_all) {
                Some(union_with_members(&st, &touched, targets))
            } else if touched.is_empty() {
                Some(targets.to_vec())
            } else {
                None
            }
        };
        if let Some(all) = merge {
            self.combine(&all)?;
        }

        if Config::current().dynamic_dimensions {
            let (occupations, marginals) = {
                let st = store.borrow();
                let idx = st.ps_index_containing_all(targets).ok_or_else(|| {
                    StateError::invalid_state("no shared product state after combining")
                })?;
                let ps = &st.product_states[idx];
                let mut occupations = Vec::with_capacity(targets.len());
                let mut marginals = Vec::with_capacity(targets.len());
                for t in targets {
                    let marginal = ps.trace_out(std::slice::from_ref(t))?;
                    let occ = match (t.borrow().kind(), ps.level()) {
                        (SystemKind::Bosonic, Representation::Matrix) => {
                            highest_occupation_matrix(&marginal, t.borrow().dimension())
                        }
                        (SystemKind::Bosonic, _) => highest_occupation_vector(&marginal),
                        _ => t.borrow().dimension(),
                    };
                    occupations.push(occ);
                    marginals.push(marginal);
                }
                (occupations, marginals)
            };
            let dims = operation.compute_dimensions(&occupations, &marginals);
            for (t, &dim) in targets.iter().zip(dims.iter()) {
                if t.borrow().kind() == SystemKind::Bosonic
                    && t.borrow().dimension() != dim
                {
                    let _ = self.resize_fock(dim, t)?;
                }
            }
        }

        let mut st = store.borrow_mut();
        let idx = st.ps_index_containing_all(targets).ok_or_else(|| {
            StateError::invalid_state("no shared product state after combining")
        })?;
        st.product_states[idx].apply_operation(operation, targets)
    }
}
