//! Scheduling-independence and monotonicity-adjacent properties.
//!
//! The driver is deterministic by default; a seeded shuffle of the
//! worklist pop order exists precisely so these tests can vary scheduling
//! and check the final state does not.

use hmlang_infer::{analyze, InferConfig};
use proptest::prelude::*;

/// Error-free programs whose printed root types come from fixed-order
/// sources, so string equality is the right confluence check.
const PROGRAMS: &[&str] = &[
    "5",
    "{ x -> x }",
    "(pair 3 \"abc\")",
    "f = { x -> x }; (pair (f 3) (f \"abc\"))",
    "{ x -> (if x x 0) }",
    "{ p -> (if p p.x 0) }",
    "map = { f xs -> (pair (f xs.0) (f xs.1)) }; (map { q -> (pair q 1) } (pair 2 3))",
    "fact = { n -> (if (eq0 n) 1 (* n (fact (dec n)))) }; (fact 3)",
];

#[test]
fn shuffled_worklists_agree() {
    for src in PROGRAMS {
        let base = analyze(src, InferConfig::default()).expect("analysis");
        assert!(base.errors.is_empty(), "{src}: {:?}", base.errors);
        for seed in 0..8u64 {
            let cfg = InferConfig {
                shuffle_seed: Some(seed),
                ..InferConfig::default()
            };
            let got = analyze(src, cfg).expect("analysis");
            assert_eq!(got.hm, base.hm, "hm diverged at seed {seed} for {src}");
            assert_eq!(got.flow, base.flow, "flow diverged at seed {seed} for {src}");
            assert!(got.errors.is_empty());
        }
    }
}

#[test]
fn per_iteration_progress_audit() {
    // `paranoid` re-checks after every pop that anything still able to
    // progress is queued; a scheduling bug trips the debug assertion.
    let cfg = InferConfig {
        paranoid: true,
        ..InferConfig::default()
    };
    for src in &PROGRAMS[..6] {
        analyze(src, cfg.clone()).expect("analysis");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn confluent_under_random_seeds(seed in any::<u64>()) {
        let src = "map = { f xs -> (pair (f xs.0) (f xs.1)) }; \
                   (map { q -> (pair q 1) } (pair 2 3))";
        let base = analyze(src, InferConfig::default()).unwrap();
        let cfg = InferConfig { shuffle_seed: Some(seed), ..InferConfig::default() };
        let got = analyze(src, cfg).unwrap();
        prop_assert_eq!(got.hm, base.hm);
        prop_assert_eq!(got.flow, base.flow);
    }

    /// The nil guard commutes with struct width extension: however many
    /// fields the guarded branch demands, and in whatever order, the
    /// parameter ends up the same nilable open record with every field
    /// present and no nil-load errors.
    #[test]
    fn notnil_commutes_with_field_addition(
        labels in prop::collection::vec(
            prop_oneof![Just("x"), Just("y"), Just("z")], 1..4),
    ) {
        let mut body = format!("p.{}", labels[0]);
        for l in &labels[1..] {
            body = format!("(pair {body} p.{l})");
        }
        let src = format!("{{ p -> (if p {body} 0) }}");
        let a = analyze(&src, InferConfig::default()).unwrap();
        prop_assert!(a.errors.is_empty(), "errors: {:?}", a.errors);
        // The parameter is a nilable record carrying every accessed field.
        prop_assert!(a.hm.contains("}?"), "hm: {}", a.hm);
        for l in &labels {
            prop_assert!(a.hm.contains(&format!("{l}=")), "hm: {}", a.hm);
        }
    }
}
