use num_complex::Complex64;
use qompose::prelude::*;
use qompose::state_ops::from_reals;

fn amplitude_damping(gamma: f64) -> Vec<Vec<Complex64>> {
    let k0 = from_reals(&[1.0, 0.0, 0.0, (1.0 - gamma).sqrt()]);
    let k1 = from_reals(&[0.0, gamma.sqrt(), 0.0, 0.0]);
    vec![k0, k1]
}

#[test]
fn test_kraus_identity_check_rejects_bad_family() -> StateResult<()> {
    let a = System::qubit();
    let b = System::qubit();
    let env = Composite::of([Part::from(&a), Part::from(&b)]);
    env.combine(&[a.clone(), b.clone()])?;
    let before = env.with_store(|st| st.product_states()[0].state().to_vec())?;

    // A single projector is not trace preserving.
    let bad = vec![from_reals(&[1.0, 0.0, 0.0, 0.0])];
    let err = env.apply_kraus(&bad, &[a.clone()], true).unwrap_err();
    assert!(matches!(err, StateError::InvalidChannel(_)));

    // Nothing was mutated.
    env.with_store(|st| {
        assert_eq!(st.product_states()[0].state(), before.as_slice());
    })?;
    Ok(())
}

#[test]
fn test_kraus_shape_mismatch_reports_shapes() {
    let a = System::qubit();
    let env = Composite::of([Part::from(&a)]);
    let wrong = vec![from_reals(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0])];
    let err = env.apply_kraus(&wrong, &[a], true).unwrap_err();
    match err {
        StateError::ShapeMismatch { expected, found } => {
            assert_eq!(expected, (2, 2));
            assert_eq!(found, (3, 3));
        }
        other => panic!("expected a shape mismatch, got {:?}", other),
    }
}

#[test]
fn test_kraus_requires_distinct_targets() {
    let a = System::qubit();
    let env = Composite::of([Part::from(&a)]);
    let eye = vec![from_reals(&[1.0, 0.0, 0.0, 1.0])];
    let err = env.apply_kraus(&eye, &[a.clone(), a], true).unwrap_err();
    assert!(matches!(err, StateError::Precondition(_)));
}

#[test]
fn test_amplitude_damping_in_product_state() -> StateResult<()> {
    // |11> with full damping on the first qubit becomes |01>.
    let a = System::qubit();
    let b = System::qubit();
    a.borrow_mut().set_label(1)?;
    b.borrow_mut().set_label(1)?;
    let env = Composite::of([Part::from(&a), Part::from(&b)]);
    env.combine(&[a.clone(), b.clone()])?;

    env.apply_kraus(&amplitude_damping(1.0), &[a.clone()], true)?;
    let reduced_a = env.trace_out(&[a.clone()])?;
    let reduced_b = env.trace_out(&[b.clone()])?;
    // matrix form after the channel: diagonals carry the populations
    assert!((reduced_a[0].re - 1.0).abs() < 1e-10);
    assert!(reduced_a[3].norm() < 1e-10);
    assert!((reduced_b[3].re - 1.0).abs() < 1e-10);
    Ok(())
}

#[test]
fn test_kraus_standalone_shortcut_avoids_tensor_growth() -> StateResult<()> {
    let a = System::qubit();
    a.borrow_mut().set_label(1)?;
    let b = System::qubit();
    let env = Composite::of([Part::from(&a), Part::from(&b)]);

    env.apply_kraus(&amplitude_damping(1.0), &[a.clone()], true)?;
    // no product state was created for the standalone target
    env.with_store(|st| assert_eq!(st.product_states().len(), 0))?;
    assert_eq!(a.borrow().level(), Representation::Matrix);
    let local = System::trace_out(&a)?;
    assert!((local[0].re - 1.0).abs() < 1e-10);
    Ok(())
}

#[test]
fn test_kraus_pair_shortcut() -> StateResult<()> {
    let mode = System::bosonic(2);
    let pol = System::qubit();
    let pair = Pair::new(&mode, &pol)?;
    pair.borrow_mut().combine()?;
    let env = Composite::of([Part::from(&pair)]);

    let d4 = {
        // identity channel over both pair members
        let mut eye = vec![Complex64::new(0.0, 0.0); 16];
        for i in 0..4 {
            eye[i * 4 + i] = Complex64::new(1.0, 0.0);
        }
        vec![eye]
    };
    env.apply_kraus(&d4, &[mode.clone(), pol.clone()], true)?;
    // the channel ran inside the pair, not in a product state
    env.with_store(|st| assert_eq!(st.product_states().len(), 0))?;
    assert!(pair.borrow().is_combined());
    Ok(())
}

#[test]
fn test_povm_on_basis_state() -> StateResult<()> {
    let a = System::qubit();
    a.borrow_mut().set_label(1)?;
    let b = System::qubit();
    let env = Composite::of([Part::from(&a), Part::from(&b)]);
    env.combine(&[a.clone(), b.clone()])?;

    let p0 = from_reals(&[1.0, 0.0, 0.0, 0.0]);
    let p1 = from_reals(&[0.0, 0.0, 0.0, 1.0]);
    let (outcome, resolved) = env.measure_povm(&[p0, p1], &[a.clone()], false)?;
    assert_eq!(outcome, 1);
    assert!(resolved.is_empty());
    // non-destructive: the target is still part of the product state
    env.with_store(|st| assert!(st.product_states()[0].contains(a.borrow().id())))?;
    Ok(())
}

#[test]
fn test_povm_destructive_detaches_targets() -> StateResult<()> {
    let a = System::qubit();
    let b = System::qubit();
    let env = Composite::of([Part::from(&a), Part::from(&b)]);
    env.combine(&[a.clone(), b.clone()])?;

    let p0 = from_reals(&[1.0, 0.0, 0.0, 0.0]);
    let p1 = from_reals(&[0.0, 0.0, 0.0, 1.0]);
    let (outcome, _) = env.measure_povm(&[p0, p1], &[a.clone()], true)?;
    assert_eq!(outcome, 0);
    assert!(a.borrow().is_measured());
    env.with_store(|st| {
        assert_eq!(st.product_states().len(), 1);
        assert!(!st.product_states()[0].contains(a.borrow().id()));
    })?;
    Ok(())
}

#[test]
fn test_povm_rejects_wrong_operator_shape() {
    let a = System::qubit();
    let b = System::qubit();
    let env = Composite::of([Part::from(&a), Part::from(&b)]);
    let too_big = vec![from_reals(&[0.0; 16])];
    let err = env.measure_povm(&too_big, &[a], false).unwrap_err();
    assert!(matches!(err, StateError::ShapeMismatch { .. }));
}

#[test]
fn test_povm_destructive_preserves_custom_systems() -> StateResult<()> {
    let c = System::custom(2);
    let q = System::qubit();
    let env = Composite::of([Part::from(&c), Part::from(&q)]);
    env.combine(&[c.clone(), q.clone()])?;

    let p0 = from_reals(&[1.0, 0.0, 0.0, 0.0]);
    let p1 = from_reals(&[0.0, 0.0, 0.0, 1.0]);
    let (outcome, _) = env.measure_povm(&[p0, p1], &[c.clone()], true)?;
    assert_eq!(outcome, 0);
    // the opaque system survives with its reduced state
    assert!(!c.borrow().is_measured());
    assert_eq!(c.borrow().level(), Representation::Matrix);
    let local = System::trace_out(&c)?;
    assert!((local[0].re - 1.0).abs() < 1e-10);
    Ok(())
}

#[test]
fn test_composite_operation_merges_product_states() -> StateResult<()> {
    // CNOT over two separate subsystems combines them first.
    let a = System::qubit();
    let b = System::qubit();
    a.borrow_mut().set_label(1)?;
    let env = Composite::of([Part::from(&a), Part::from(&b)]);

    let cnot = Operation::composite_fixed(
        &[SystemKind::Qubit, SystemKind::Qubit],
        &[2, 2],
        from_reals(&[
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0, //
            0.0, 0.0, 1.0, 0.0,
        ]),
    )?;
    env.apply_operation(&cnot, &[a.clone(), b.clone()])?;

    let outcomes = env.measure(&[a.clone(), b.clone()], true, true)?;
    assert_eq!(outcomes[&a.borrow().id()], 1);
    assert_eq!(outcomes[&b.borrow().id()], 1);
    Ok(())
}

#[test]
fn test_identity_operation_leaves_array_unchanged() -> StateResult<()> {
    let a = System::qubit();
    let b = System::qubit();
    let env = Composite::of([Part::from(&a), Part::from(&b)]);
    env.combine(&[a.clone(), b.clone()])?;
    let before = env.with_store(|st| st.product_states()[0].state().to_vec())?;

    let eye = Operation::composite_fixed(
        &[SystemKind::Qubit, SystemKind::Qubit],
        &[2, 2],
        from_reals(&[
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ]),
    )?;
    env.apply_operation(&eye, &[a.clone(), b.clone()])?;
    env.with_store(|st| {
        let after = st.product_states()[0].state();
        for (x, y) in after.iter().zip(before.iter()) {
            assert!((x - y).norm() < 1e-12);
        }
    })?;
    Ok(())
}

#[test]
fn test_operation_signature_is_checked() {
    let a = System::qubit();
    let env = Composite::of([Part::from(&a)]);
    let err = env
        .apply_operation(&Operation::annihilation(), &[a])
        .unwrap_err();
    assert!(matches!(err, StateError::Precondition(_)));
}

#[test]
fn test_vacuum_annihilation_in_product_state_fails() -> StateResult<()> {
    let mode = System::bosonic(3);
    let q = System::qubit();
    let env = Composite::of([Part::from(&mode), Part::from(&q)]);
    env.combine(&[mode.clone(), q.clone()])?;
    let err = env
        .apply_operation(&Operation::annihilation(), &[mode])
        .unwrap_err();
    assert!(matches!(err, StateError::InvalidState(_)));
    Ok(())
}
