use qompose::prelude::*;

#[test]
fn test_resize_grow_then_shrink_round_trip() -> StateResult<()> {
    let mode = System::bosonic(3);
    mode.borrow_mut().set_label(1)?;
    let q = System::qubit();
    let env = Composite::of([Part::from(&mode), Part::from(&q)]);
    env.combine(&[mode.clone(), q.clone()])?;
    let before = env.with_store(|st| st.product_states()[0].state().to_vec())?;

    assert!(env.resize_fock(5, &mode)?);
    assert_eq!(mode.borrow().dimension(), 5);
    env.with_store(|st| assert_eq!(st.product_states()[0].state().len(), 10))?;

    assert!(env.resize_fock(3, &mode)?);
    assert_eq!(mode.borrow().dimension(), 3);
    env.with_store(|st| {
        let after = st.product_states()[0].state();
        assert_eq!(after.len(), before.len());
        for (x, y) in after.iter().zip(before.iter()) {
            assert!((x - y).norm() < 1e-12);
        }
    })?;
    Ok(())
}

#[test]
fn test_resize_rejects_truncating_occupied_population() -> StateResult<()> {
    // A 3-level mode actually occupying level 2 refuses to shrink to 2.
    let mode = System::bosonic(3);
    mode.borrow_mut().set_label(2)?;
    let q = System::qubit();
    let env = Composite::of([Part::from(&mode), Part::from(&q)]);
    env.combine(&[mode.clone(), q.clone()])?;
    let before = env.with_store(|st| st.product_states()[0].state().to_vec())?;

    assert!(!env.resize_fock(2, &mode)?);
    assert_eq!(mode.borrow().dimension(), 3);
    env.with_store(|st| {
        assert_eq!(st.product_states()[0].state(), before.as_slice());
    })?;
    Ok(())
}

#[test]
fn test_resize_standalone_delegates_to_system() -> StateResult<()> {
    let mode = System::bosonic(2);
    let env = Composite::of([Part::from(&mode)]);
    assert!(env.resize_fock(4, &mode)?);
    assert_eq!(mode.borrow().dimension(), 4);
    assert_eq!(mode.borrow().location(), Location::Free);
    Ok(())
}

#[test]
fn test_resize_rejects_non_truncatable_kinds() {
    let q = System::qubit();
    let env = Composite::of([Part::from(&q)]);
    assert!(env.resize_fock(4, &q).is_err());

    let stranger = System::bosonic(2);
    assert!(env.resize_fock(4, &stranger).is_err());
}

#[test]
fn test_resize_brings_target_to_front() -> StateResult<()> {
    let q = System::qubit();
    let mode = System::bosonic(2);
    let env = Composite::of([Part::from(&q), Part::from(&mode)]);
    env.combine(&[q.clone(), mode.clone()])?;

    assert!(env.resize_fock(3, &mode)?);
    env.with_store(|st| {
        let ps = &st.product_states()[0];
        assert_eq!(ps.members()[0].borrow().id(), mode.borrow().id());
        assert_eq!(ps.state().len(), 6);
    })?;
    Ok(())
}

#[test]
fn test_dynamic_dimensions_grow_with_occupation() -> StateResult<()> {
    Config::set_dynamic_dimensions(true);
    let mode = System::bosonic(2);
    let q = System::qubit();
    let env = Composite::of([Part::from(&mode), Part::from(&q)]);
    env.combine(&[mode.clone(), q.clone()])?;

    // First raise: vacuum occupation 0, the descriptor asks for 2 levels.
    env.apply_operation(&Operation::creation(), &[mode.clone()])?;
    // Second raise: occupation 1, the descriptor asks for 3 levels.
    env.apply_operation(&Operation::creation(), &[mode.clone()])?;
    assert_eq!(mode.borrow().dimension(), 3);
    let reduced = env.trace_out(&[mode.clone()])?;
    assert!((reduced[2].re - 1.0).abs() < 1e-10);

    Config::set_dynamic_dimensions(false);
    Ok(())
}

#[test]
fn test_operation_shrinks_unused_levels() -> StateResult<()> {
    // A wide mode in a low state is trimmed after an operation touches
    // the product state.
    let mode = System::bosonic(6);
    let q = System::qubit();
    let env = Composite::of([Part::from(&mode), Part::from(&q)]);
    env.combine(&[mode.clone(), q.clone()])?;

    env.apply_operation(&Operation::phase_shift(0.3), &[mode.clone()])?;
    assert_eq!(mode.borrow().dimension(), 2);
    env.with_store(|st| assert_eq!(st.product_states()[0].state().len(), 4))?;
    Ok(())
}

#[test]
fn test_auto_contract_recovers_vector_after_kraus() -> StateResult<()> {
    Config::set_auto_contract(true);
    let a = System::qubit();
    let b = System::qubit();
    a.borrow_mut().set_label(1)?;
    let env = Composite::of([Part::from(&a), Part::from(&b)]);
    env.combine(&[a.clone(), b.clone()])?;

    // A pure unitary channel keeps the state rank-1, so the automatic
    // contraction brings it back to vector form.
    let x_channel = vec![qompose::state_ops::from_reals(&[0.0, 1.0, 1.0, 0.0])];
    env.apply_kraus(&x_channel, &[a.clone()], true)?;
    env.with_store(|st| {
        assert_eq!(st.product_states()[0].level(), Representation::Vector);
    })?;
    assert_eq!(a.borrow().level(), Representation::Vector);

    let outcomes = env.measure(&[a.clone()], true, true)?;
    assert_eq!(outcomes[&a.borrow().id()], 0);
    Config::set_auto_contract(false);
    Ok(())
}

#[test]
fn test_expand_and_contract_surface() -> StateResult<()> {
    let a = System::qubit();
    let b = System::qubit();
    let env = Composite::of([Part::from(&a), Part::from(&b)]);
    env.combine(&[a.clone(), b.clone()])?;

    env.expand(&[a.clone()])?;
    env.with_store(|st| {
        assert_eq!(st.product_states()[0].level(), Representation::Matrix);
        assert_eq!(st.product_states()[0].state().len(), 16);
    })?;
    assert_eq!(b.borrow().level(), Representation::Matrix);

    env.contract(&[a.clone()], 1e-6)?;
    env.with_store(|st| {
        assert_eq!(st.product_states()[0].level(), Representation::Vector);
        assert_eq!(st.product_states()[0].state().len(), 4);
    })?;
    Ok(())
}
