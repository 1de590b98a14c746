use approx::assert_abs_diff_eq;
use coalescent_em::{
    balance_hidden_states, thin_data, Error, InferenceSession, Observation, ParameterModel,
    SessionOptions, SessionState, Target, SPAN_CUTOFF,
};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const N: usize = 5;
const THETA: f64 = 0.01;
const RHO: f64 = 0.2;

/// Alternating monomorphic stretches and single segregating sites.
fn simulate(rng: &mut StdRng, segments: usize) -> Vec<Observation> {
    let mut rows = Vec::with_capacity(2 * segments);
    for _ in 0..segments {
        rows.push(Observation::new(rng.random_range(20..200), 0, 0, 0));
        let n_b = rng.random_range(0..=(N as u32 - 2));
        let a = rng.random_range(0..=1);
        let b = if n_b == 0 { 0 } else { rng.random_range(0..n_b) };
        rows.push(Observation::new(1, a, b, n_b));
    }
    rows
}

fn history() -> Vec<Vec<f64>> {
    vec![vec![1.4, 0.6, 1.1], vec![0.7, 0.9, 1.1], vec![0.4, 0.8, 1.]]
}

fn session(
    observations: Vec<Vec<Observation>>,
    options: SessionOptions,
) -> anyhow::Result<InferenceSession> {
    let hidden_states = balance_hidden_states(&ParameterModel::constant(1.)?, 6)?;
    Ok(InferenceSession::new(
        N,
        observations,
        hidden_states,
        THETA,
        RHO,
        options,
    )?)
}

#[test]
fn q_gradient_matches_loglik_gradient() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let data = vec![simulate(&mut rng, 25), simulate(&mut rng, 20)];
    let values = history();
    let targets = [Target::new(0, 0), Target::new(0, 1), Target::new(1, 0)];

    let mut with_targets = session(data.clone(), SessionOptions::default())?;
    with_targets.set_params(ParameterModel::build(&values, Some(&targets))?)?;
    with_targets.e_step(false)?;
    let q = with_targets.q()?;
    assert_eq!(q.len(), 2);
    assert_eq!(with_targets.targets(), &targets);

    let mut plain = session(data, SessionOptions::default())?;
    let h = 1e-5;
    for (pos, target) in targets.iter().enumerate() {
        let mut loglik_at = |delta: f64| -> anyhow::Result<f64> {
            let mut v = values.clone();
            v[target.block][target.index] += delta;
            plain.set_params(ParameterModel::build(&v, None)?)?;
            Ok(plain.loglik()?.iter().sum())
        };
        let fd = (loglik_at(h)? - loglik_at(-h)?) / (2. * h);
        let ad: f64 = q.iter().map(|q| q.tangents()[pos]).sum();
        assert_abs_diff_eq!(ad, fd, epsilon = 1e-3 * (1. + fd.abs()));
    }
    Ok(())
}

#[test]
fn plain_parameters_carry_no_jacobian() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(1);
    let mut s = session(vec![simulate(&mut rng, 10)], SessionOptions::default())?;
    s.set_params(ParameterModel::build(&history(), None)?)?;
    s.e_step(false)?;
    assert!(s.q()?[0].jacobian().is_none());
    assert!(s.transition()?.jacobian().is_none());
    assert!(s.regularizer()?.jacobian().is_none());

    s.set_params(ParameterModel::build(&history(), Some(&[Target::new(2, 0)]))?)?;
    let transition = s.transition()?;
    let jac = transition.jacobian().expect("one target");
    assert_eq!(jac.len(), 1);
    assert_eq!((jac[0].nrows(), jac[0].ncols()), (5, 5));
    for probs in s.emission_probs()?.values() {
        assert_eq!(probs.nrows(), 5);
        assert!(probs.jacobian().is_some());
    }
    Ok(())
}

#[test]
fn span_cutoff_keeps_loglik() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut middle = simulate(&mut rng, 10);
    middle.push(Observation::new(3 * SPAN_CUTOFF, -1, 0, 0));
    middle.extend(simulate(&mut rng, 10));
    let mut tail = simulate(&mut rng, 10);
    tail.push(Observation::new(5 * SPAN_CUTOFF, -1, 0, 0));
    let data = vec![middle, tail];

    let mut full = session(data.clone(), SessionOptions::default())?;
    let mut cut = session(
        data,
        SessionOptions {
            span_cutoff: true,
            ..Default::default()
        },
    )?;
    full.set_params(ParameterModel::build(&history(), None)?)?;
    cut.set_params(ParameterModel::build(&history(), None)?)?;
    let (a, b) = (full.loglik()?, cut.loglik()?);
    for (a, b) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
    }

    // the truncated sites no longer count towards the transition sums
    full.e_step(false)?;
    cut.e_step(false)?;
    let mass = |m: &faer::Mat<f64>| -> f64 {
        (0..m.nrows())
            .flat_map(|i| (0..m.ncols()).map(move |j| (i, j)))
            .map(|(i, j)| m[(i, j)])
            .sum()
    };
    let (full_xi, cut_xi) = (full.xisums()?, cut.xisums()?);
    assert_abs_diff_eq!(
        mass(full_xi[1]) - mass(cut_xi[1]),
        (4 * SPAN_CUTOFF) as f64,
        epsilon = 1e-6
    );
    Ok(())
}

#[test]
fn cancellation_from_another_thread() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(3);
    let mut s = session(vec![simulate(&mut rng, 5)], SessionOptions::default())?;
    let token = s.cancellation_token();
    std::thread::spawn(move || token.cancel())
        .join()
        .expect("cancel thread");
    let err = s.set_params(ParameterModel::constant(1.)?).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(s.state(), SessionState::Created);
    s.set_params(ParameterModel::constant(1.)?)?;
    assert_eq!(s.state(), SessionState::ParametersSet);
    Ok(())
}

#[test]
fn wrong_state_is_reported() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(5);
    let s = session(vec![simulate(&mut rng, 5)], SessionOptions::default())?;
    let err = s.gammas().unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            operation: "gammas",
            state: SessionState::Created
        }
    ));
    assert!(!err.is_input_error());
    Ok(())
}

#[test]
fn flat_buffers_feed_a_session() -> anyhow::Result<()> {
    let flat: Vec<i64> = vec![100, 0, 0, 0, 1, 1, 1, 3, 80, 0, 0, 3, 1, 2, 1, 3, 40, -1, 0, 0];
    let rows = Observation::from_flat(&flat)?;
    let thinned = thin_data(&rows, 25, 0)?;
    let mut s = session(vec![rows, thinned], SessionOptions::default())?;
    s.set_params(ParameterModel::constant(1.)?)?;
    s.e_step(false)?;
    let loglik = s.loglik()?;
    assert!(loglik.iter().all(|l| l.is_finite() && *l < 0.));

    assert!(matches!(
        Observation::from_flat(&flat[..7]),
        Err(Error::InvalidLayout { .. })
    ));
    Ok(())
}

#[test]
fn chromosome_scale_spans_run_per_row() -> anyhow::Result<()> {
    let span = 1u64 << 62;
    let rows = vec![Observation::new(span, 0, 0, 0), Observation::new(1, 1, 0, 0)];
    let mut s = session(
        vec![rows],
        SessionOptions {
            save_gamma: true,
            ..Default::default()
        },
    )?;
    s.set_params(ParameterModel::constant(1.)?)?;
    s.e_step(false)?;
    let loglik = s.loglik()?;
    assert!(loglik[0].is_finite() && loglik[0] < 0.);

    let occupancy: f64 = s.gamma_sums()?[0].values().flatten().sum();
    assert_abs_diff_eq!(occupancy / (span as f64 + 1.), 1., epsilon = 1e-9);
    let gammas = s.gammas()?;
    assert_eq!((gammas[0].nrows(), gammas[0].ncols()), (5, 2));

    let overflow = vec![Observation::new(u64::MAX - 1, 0, 0, 0), Observation::new(2, 1, 0, 0)];
    let err = session(vec![overflow], SessionOptions::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidObservation { row: 1, .. })
    ));
    Ok(())
}

#[test]
fn tiny_sizes_keep_the_likelihood_finite() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    // balanced for size 1, so the upper states get no mass at size 1e-3
    let hidden_states = balance_hidden_states(&ParameterModel::constant(1.)?, 8)?;
    let mut s: InferenceSession = InferenceSession::new(
        N,
        vec![simulate(&mut rng, 15)],
        hidden_states,
        THETA,
        RHO,
        SessionOptions::default(),
    )?;
    s.set_params(ParameterModel::constant(1e-3)?)?;
    assert!(s.loglik()?.iter().all(|l| l.is_finite()));

    let pi = s.pi()?;
    assert_eq!(pi.get(pi.nrows() - 1, 0), 0.);
    let t = s.transition()?;
    for i in 0..t.nrows() {
        let row: f64 = (0..t.ncols()).map(|j| t.get(i, j)).sum();
        assert_abs_diff_eq!(row, 1., epsilon = 1e-9);
    }
    let emission = s.emission()?;
    for i in 0..emission.nrows() {
        for j in 0..emission.ncols() {
            assert!(emission.get(i, j).is_finite());
        }
    }

    s.e_step(false)?;
    assert!(s.q()?.iter().all(|q| q.value().is_finite()));
    Ok(())
}
