//! Combined Hindley-Milner type inference and global constant propagation
//! for a small functional language with records, first-class functions,
//! let-polymorphism, and nil-checked pointers.
//!
//! The two analyses run interleaved as one monotone fixed-point
//! computation over the syntax tree: HM discovers polymorphic structural
//! types through in-place unification of a type-variable graph, GCP
//! discovers the concrete lattice flow of every expression, and each side
//! informs the other -- the `if` rule prunes dead arms using GCP
//! knowledge, and the apply-lift tightens flow returns using HM
//! polymorphism.
//!
//! Entry point: [`analyze`], or [`parse`](parse::parse) plus
//! [`Infer`](driver::Infer) for finer control.

pub mod ast;
pub mod driver;
pub mod lift;
pub mod parse;
pub mod prim;
pub mod tvar;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use driver::{Infer, InferConfig, InferError};
pub use parse::{parse, ParseError};

/// Everything the analysis produces for a program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// The root's printed HM scheme.
    pub hm: String,
    /// The root's printed flow signature.
    pub flow: String,
    /// Collected analysis errors (empty for a clean program).
    pub errors: Vec<String>,
}

/// Top-level failure: either the parser rejected the input or the driver
/// stopped.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Infer(#[from] InferError),
}

/// Parse and fully analyze a program.
pub fn analyze(src: &str, cfg: InferConfig) -> Result<Analysis, AnalyzeError> {
    let prog = parse(src)?;
    let mut infer = Infer::new(prog, cfg);
    infer.run()?;
    Ok(Analysis {
        hm: infer.root_hm(),
        flow: infer.root_flow_sig(),
        errors: infer.errors(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_serde_roundtrip() {
        let a = analyze("(pair 3 \"abc\")", InferConfig::default()).unwrap();
        let json = serde_json::to_string(&a).unwrap();
        let back: Analysis = serde_json::from_str(&json).unwrap();
        assert_eq!(a.hm, back.hm);
        assert_eq!(a.flow, back.flow);
        assert_eq!(a.errors, back.errors);
    }

    #[test]
    fn undefined_names_are_parse_errors() {
        assert!(matches!(
            analyze("nosuch", InferConfig::default()),
            Err(AnalyzeError::Parse(ParseError::Undefined { .. }))
        ));
    }
}
