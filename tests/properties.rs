use coalescent_em::{
    balance_hidden_states, thin_data, total_span, validate_hidden_states, validate_observation,
    Observation, ParameterModel, T_MAX,
};
use proptest::prelude::*;

fn observation() -> impl Strategy<Value = Observation> {
    (1u64..60, -1i8..=2, 0u32..5).prop_flat_map(|(span, a, n_b)| {
        // keep a == 2 away from the unfolded class b == n_b
        let max_b = if a == 2 { n_b.saturating_sub(1) } else { n_b };
        (Just(span), Just(a), 0..=max_b, Just(n_b)).prop_map(|(span, a, b, n_b)| {
            if a == 2 && n_b == 0 {
                Observation::new(span, 0, 0, 0)
            } else {
                Observation::new(span, a, b, n_b)
            }
        })
    })
}

/// One `(a, b, n_b, row span)` entry per site.
fn sites(rows: &[Observation]) -> Vec<(i8, u32, u32, u64)> {
    rows.iter()
        .flat_map(|obs| (0..obs.span).map(move |_| (obs.a, obs.b, obs.n_b, obs.span)))
        .collect()
}

proptest! {
    #[test]
    fn thinning_keeps_one_site_per_window(
        rows in prop::collection::vec(observation(), 1..40),
        period in 1u64..25,
        offset in 0u64..80,
    ) {
        prop_assert!(validate_observation(&rows).is_ok());
        let thinned = thin_data(&rows, period, offset).unwrap();
        prop_assert_eq!(total_span(&thinned).unwrap(), total_span(&rows).unwrap());
        prop_assert!(validate_observation(&thinned).is_ok());

        let shift = offset % period;
        let before = sites(&rows);
        let after = sites(&thinned);
        for (p, (&(a, b, n_b, _), &(ta, tb, tn_b, t_span))) in before.iter().zip(after.iter()).enumerate() {
            if (shift + p as u64 + 1) % period == 0 {
                let kept = if a == 2 && b == n_b { (0, 0, n_b) } else { (a, b, n_b) };
                prop_assert_eq!((ta, tb, tn_b), kept, "window edge at site {}", p);
                prop_assert_eq!(t_span, 1);
            } else {
                let folded = if a == 2 { 0 } else { a };
                prop_assert_eq!((ta, tb, tn_b), (folded, 0, 0), "interior site {}", p);
            }
        }
    }

    #[test]
    fn balanced_states_have_equal_mass(size in 0.2f64..5., states in 2usize..12) {
        let model = ParameterModel::constant(size).unwrap();
        let hs = balance_hidden_states(&model, states).unwrap();
        prop_assert!(validate_hidden_states(&hs).is_ok());
        prop_assert_eq!(hs.len(), states);
        prop_assert_eq!(hs[0], 0.);
        prop_assert_eq!(hs[states - 1], T_MAX);
        for (m, t) in hs.iter().enumerate().take(states - 1).skip(1) {
            let level = 1. - m as f64 / states as f64;
            prop_assert!(((-t / size).exp() - level).abs() < 1e-8);
        }
    }

    #[test]
    fn validation_matches_row_rules(
        rows in prop::collection::vec((0u64..4, -2i8..=3, 0u32..6, 0u32..6), 1..20),
    ) {
        let obs: Vec<Observation> = rows
            .iter()
            .map(|&(span, a, b, n_b)| Observation::new(span, a, b, n_b))
            .collect();
        let valid = obs.iter().all(|o| {
            o.span > 0 && (-1..=2).contains(&o.a) && o.b <= o.n_b && !(o.a == 2 && o.b == o.n_b)
        });
        prop_assert_eq!(validate_observation(&obs).is_ok(), valid);
    }
}
