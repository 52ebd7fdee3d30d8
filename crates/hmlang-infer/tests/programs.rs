//! Whole-program scenarios: literal source in, printed root scheme and
//! flow signature out.

use hmlang_infer::{analyze, Analysis, InferConfig};

fn run(src: &str) -> Analysis {
    analyze(src, InferConfig::default()).expect("analysis")
}

#[test]
fn constant_int() {
    let a = run("5");
    assert_eq!(a.hm, "5");
    assert_eq!(a.flow, "5");
    assert!(a.errors.is_empty());
}

#[test]
fn constant_string() {
    let a = run("\"abc\"");
    assert_eq!(a.hm, "\"abc\"");
    assert_eq!(a.flow, "\"abc\"");
}

#[test]
fn nil_literal() {
    let a = run("0");
    assert_eq!(a.hm, "A?");
    assert_eq!(a.flow, "nil");
}

#[test]
fn identity_function() {
    let a = run("{ x -> x }");
    assert_eq!(a.hm, "{ A -> A }");
    assert_eq!(a.flow, "{ Scalar -> Scalar }");
    assert!(a.errors.is_empty());
}

#[test]
fn pair_of_constants() {
    let a = run("(pair 3 \"abc\")");
    assert_eq!(a.hm, "@{ 0=3, 1=\"abc\" }");
    assert!(a.flow.contains("@{0=3, 1=\"abc\"}"), "flow: {}", a.flow);
    assert!(a.errors.is_empty());
}

#[test]
fn triple_of_constants() {
    let a = run("(triple 1 2 3)");
    assert_eq!(a.hm, "@{ 0=1, 1=2, 2=3 }");
    assert!(a.flow.contains("0=1"), "flow: {}", a.flow);
}

#[test]
fn let_polymorphism_reinstantiates() {
    // `f` must be copied per use: int at one site, string at the other.
    let a = run("f = { x -> x }; (pair (f 3) (f \"abc\"))");
    assert_eq!(a.hm, "@{ 0=3, 1=\"abc\" }");
    assert!(a.flow.contains("0=3"), "flow: {}", a.flow);
    assert!(a.flow.contains("1=\"abc\""), "flow: {}", a.flow);
    assert!(a.errors.is_empty());
}

#[test]
fn if_unifies_arms_and_keeps_nil() {
    let a = run("{ x -> (if x x 0) }");
    assert_eq!(a.hm, "{ A? -> A? }");
    assert_eq!(a.flow, "{ Scalar -> Scalar }");
    assert!(a.errors.is_empty());
}

#[test]
fn nil_guarded_field_load() {
    // The parser narrows `p` inside the then-branch, so the load is clean
    // and the parameter stays a nilable open record.
    let a = run("{ p -> (if p p.x 0) }");
    assert_eq!(a.hm, "{ @{ x=A?, ... }? -> A? }");
    assert!(a.errors.is_empty(), "errors: {:?}", a.errors);
}

#[test]
fn unguarded_field_load_through_nil_errs() {
    let a = run("{ p -> (pair p.x (if p 1 2)) }");
    assert!(
        a.errors.iter().any(|e| e.contains("May be nil when loading field x")),
        "errors: {:?}",
        a.errors
    );
}

#[test]
fn apply_lift_refines_polymorphic_return() {
    // Without the lift both pair components degrade to Scalar; with it the
    // call-site types stay integral.
    let a = run(
        "map = { f xs -> (pair (f xs.0) (f xs.1)) }; \
         (map { q -> (pair q 1) } (pair 2 3))",
    );
    assert!(a.flow.contains("int64"), "flow: {}", a.flow);
    assert!(!a.flow.contains("Scalar"), "flow: {}", a.flow);
    assert!(a.errors.is_empty(), "errors: {:?}", a.errors);
}

#[test]
fn struct_literal_and_field() {
    let a = run("@{ x = 3, y = \"s\" }.x");
    assert_eq!(a.hm, "3");
    assert_eq!(a.flow, "3");
    assert!(a.errors.is_empty());
}

#[test]
fn missing_field_is_reported() {
    let a = run("(pair 1 2).x");
    assert!(
        a.errors.iter().any(|e| e.contains("Missing field x")),
        "errors: {:?}",
        a.errors
    );
    assert!(a.hm.contains("Missing field x"), "hm: {}", a.hm);
}

#[test]
fn incompatible_bases_keep_both_sides() {
    let a = run("(+ 1 \"abc\")");
    assert!(
        a.errors.iter().any(|e| e.contains("Cannot unify")),
        "errors: {:?}",
        a.errors
    );
}

#[test]
fn arity_mismatch_is_reported() {
    let a = run("({ x -> x } 1 2)");
    assert!(
        a.errors.iter().any(|e| e.contains("Bad argument count")),
        "errors: {:?}",
        a.errors
    );
}

#[test]
fn recursive_function_converges() {
    let a = run("fact = { n -> (if (eq0 n) 1 (* n (fact (dec n)))) }; (fact 3)");
    assert_eq!(a.hm, "int64");
    assert_eq!(a.flow, "int64");
    assert!(a.errors.is_empty(), "errors: {:?}", a.errors);
}

#[test]
fn primitives_compute_constants() {
    assert_eq!(run("(* 6 7)").flow, "42");
    assert_eq!(run("(+ 2 3)").flow, "5");
    assert_eq!(run("(dec 1)").flow, "nil");
    assert_eq!(run("(str 12)").flow, "\"12\"");
    assert_eq!(run("(eq 3 3)").flow, "1");
    assert_eq!(run("(eq 3 4)").flow, "nil");
    assert_eq!(run("(eq0 0)").flow, "1");
    assert_eq!(run("(isempty \"\")").flow, "1");
    assert_eq!(run("(isempty \"a\")").flow, "nil");
}

#[test]
fn if_with_known_predicate_takes_one_arm() {
    // eq0 of a non-zero constant is false, so only the else arm flows.
    let a = run("(if (eq0 1) 2 3)");
    assert_eq!(a.flow, "3");
    // A known-true predicate takes the then arm.
    let a = run("(if (eq0 0) 2 3)");
    assert_eq!(a.flow, "2");
}

#[test]
fn factor_returns_float() {
    let a = run("(factor 1.5)");
    assert_eq!(a.hm, "flt64");
    assert_eq!(a.flow, "flt64");
}

#[test]
fn shadowing_a_primitive() {
    let a = run("pair = { x -> x }; (pair 5)");
    assert_eq!(a.hm, "5");
    assert_eq!(a.flow, "5");
}

#[test]
fn hm_only_mode() {
    let cfg = InferConfig {
        do_gcp: false,
        ..InferConfig::default()
    };
    let a = analyze("{ x -> x }", cfg).expect("analysis");
    assert_eq!(a.hm, "{ A -> A }");
}

#[test]
fn gcp_only_mode() {
    let cfg = InferConfig {
        do_hm: false,
        ..InferConfig::default()
    };
    let a = analyze("(pair 3 \"abc\")", cfg).expect("analysis");
    assert!(a.flow.contains("0=3"), "flow: {}", a.flow);
}

#[test]
fn comments_and_whitespace() {
    let a = run("// header\n ( pair // inline\n 3 \"abc\" )");
    assert_eq!(a.hm, "@{ 0=3, 1=\"abc\" }");
}

#[test]
fn deterministic_across_runs() {
    let src = "map = { f xs -> (pair (f xs.0) (f xs.1)) }; \
               (map { q -> (pair q 1) } (pair 2 3))";
    let a = run(src);
    let b = run(src);
    assert_eq!(a.hm, b.hm);
    assert_eq!(a.flow, b.flow);
    assert_eq!(a.errors, b.errors);
}
