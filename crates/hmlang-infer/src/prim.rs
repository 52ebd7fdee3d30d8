//! Primitive bindings: synthesized lambdas with custom transfer functions.
//!
//! Every primitive is a first-class function value pre-bound at every scope
//! (shadowable by a local let). The parser instantiates a fresh node per
//! unshadowed occurrence, so each use site carries its own fidx and keeps
//! its own argument flows. The HM signature is built once at prep; the GCP
//! side is the `prim_apply` transfer over the met argument flows.

use smallvec::SmallVec;

use hmlang_core::bits::BitsAlias;
use hmlang_core::flow::{Flow, FltB, IntB, Obj, StrB, Tmp};

use crate::ast::{NodeId, SynKind};
use crate::driver::Infer;
use crate::tvar::TvId;

/// The primitive set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prim {
    /// `∀a b. (a, b) -> @{0:a, 1:b}`
    Pair,
    /// `∀a b c. (a, b, c) -> @{0:a, 1:b, 2:c}`
    Triple,
    /// `∀a. (a?, a', a') -> a'` with arm pruning driven by the predicate's
    /// flow; see the `hm` rule.
    If,
    /// `∀a. (a, a) -> int1`
    Eq,
    /// `int? -> int1`
    Eq0,
    /// `str -> int1`
    IsEmpty,
    Mul,
    Add,
    Dec,
    /// `int -> str`
    Str,
    /// `flt -> flt`
    Factor,
    /// Internal: `∀a. a? -> a`, synthesized around nil-guarded branches.
    NotNil,
}

impl Prim {
    /// The surface name, or `None` for internal primitives.
    pub fn lookup(name: &str) -> Option<Prim> {
        Some(match name {
            "pair" => Prim::Pair,
            "triple" => Prim::Triple,
            "if" => Prim::If,
            "eq" => Prim::Eq,
            "eq0" => Prim::Eq0,
            "isempty" => Prim::IsEmpty,
            "*" => Prim::Mul,
            "+" => Prim::Add,
            "dec" => Prim::Dec,
            "str" => Prim::Str,
            "factor" => Prim::Factor,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Prim::Pair => "pair",
            Prim::Triple => "triple",
            Prim::If => "if",
            Prim::Eq => "eq",
            Prim::Eq0 => "eq0",
            Prim::IsEmpty => "isempty",
            Prim::Mul => "*",
            Prim::Add => "+",
            Prim::Dec => "dec",
            Prim::Str => "str",
            Prim::Factor => "factor",
            Prim::NotNil => "notnil",
        }
    }
}

impl Infer {
    /// Build the HM signature for a primitive occurrence: the parameter
    /// type variables and the return variable.
    pub(crate) fn prim_sig(&mut self, prim: Prim) -> (SmallVec<[TvId; 3]>, TvId) {
        match prim {
            Prim::Pair => {
                let a = self.new_leaf();
                let b = self.new_leaf();
                let alias = self.pair_alias;
                let ret = self.new_struct(
                    BitsAlias::of(alias),
                    &[("0".to_string(), a), ("1".to_string(), b)],
                    false,
                );
                (SmallVec::from_slice(&[a, b]), ret)
            }
            Prim::Triple => {
                let a = self.new_leaf();
                let b = self.new_leaf();
                let c = self.new_leaf();
                let alias = self.triple_alias;
                let ret = self.new_struct(
                    BitsAlias::of(alias),
                    &[
                        ("0".to_string(), a),
                        ("1".to_string(), b),
                        ("2".to_string(), c),
                    ],
                    false,
                );
                (SmallVec::from_slice(&[a, b, c]), ret)
            }
            Prim::If => {
                // The predicate admits any nilable value; the arms bind to
                // the result lazily in the hm rule.
                let p = self.new_leaf();
                let pred = self.new_nilable(p);
                let arm1 = self.new_leaf();
                let arm2 = self.new_leaf();
                let ret = self.new_leaf();
                (SmallVec::from_slice(&[pred, arm1, arm2]), ret)
            }
            Prim::Eq => {
                let a = self.new_leaf();
                let ret = self.new_base(Flow::bool_all());
                (SmallVec::from_slice(&[a, a]), ret)
            }
            Prim::Eq0 => {
                let a = self.new_base(Flow::Int(IntB::All));
                let ret = self.new_base(Flow::bool_all());
                (SmallVec::from_slice(&[a]), ret)
            }
            Prim::IsEmpty => {
                let a = self.new_base(Flow::str_all());
                let ret = self.new_base(Flow::bool_all());
                (SmallVec::from_slice(&[a]), ret)
            }
            Prim::Mul | Prim::Add => {
                let a = self.new_base(Flow::Int(IntB::All));
                let b = self.new_base(Flow::Int(IntB::All));
                let ret = self.new_base(Flow::Int(IntB::All));
                (SmallVec::from_slice(&[a, b]), ret)
            }
            Prim::Dec => {
                let a = self.new_base(Flow::Int(IntB::All));
                let ret = self.new_base(Flow::Int(IntB::All));
                (SmallVec::from_slice(&[a]), ret)
            }
            Prim::Str => {
                let a = self.new_base(Flow::Int(IntB::All));
                let ret = self.new_base(Flow::str_all());
                (SmallVec::from_slice(&[a]), ret)
            }
            Prim::Factor => {
                let a = self.new_base(Flow::Flt(FltB::All));
                let ret = self.new_base(Flow::Flt(FltB::All));
                (SmallVec::from_slice(&[a]), ret)
            }
            Prim::NotNil => {
                let a = self.new_leaf();
                let arg = self.new_nilable(a);
                (SmallVec::from_slice(&[arg]), a)
            }
        }
    }

    /// GCP transfer: the primitive's return flow over its current argument
    /// flows. `work` gates the memory store of the record constructors.
    pub(crate) fn prim_apply(&mut self, n: NodeId, prim: Prim, work: bool) -> Flow {
        let ptypes: Vec<Flow> = match &self.prog.node(n).kind {
            SynKind::Prim { ptypes, .. } => ptypes.iter().cloned().collect(),
            _ => return Flow::Scalar,
        };
        let p = |i: usize| ptypes.get(i).cloned().unwrap_or(Flow::All);
        match prim {
            Prim::Pair => self.make_rec(self.pair_alias, &[p(0), p(1)], work),
            Prim::Triple => self.make_rec(self.triple_alias, &[p(0), p(1), p(2)], work),

            Prim::If => {
                let pred = p(0);
                if pred.above_center() {
                    Flow::Any
                } else if pred.must_nil() {
                    p(2)
                } else if !pred.may_nil() {
                    p(1)
                } else {
                    p(1).meet(&p(2))
                }
            }

            Prim::Eq => {
                let (a, b) = (p(0), p(1));
                if a.above_center() || b.above_center() {
                    Flow::Int(IntB::XBool)
                } else if is_con(&a) && is_con(&b) {
                    Flow::int(i64::from(a == b))
                } else {
                    Flow::bool_all()
                }
            }

            Prim::Eq0 => {
                let a = p(0);
                if a.above_center() {
                    Flow::Int(IntB::XBool)
                } else if a.must_nil() {
                    Flow::int(1)
                } else if !a.may_nil() {
                    Flow::int(0)
                } else {
                    Flow::bool_all()
                }
            }

            Prim::IsEmpty => match p(0) {
                f if f.above_center() => Flow::Int(IntB::XBool),
                Flow::Str(StrB {
                    con: Some(s),
                    nil: false,
                    ..
                }) => Flow::int(i64::from(s.is_empty())),
                _ => Flow::bool_all(),
            },

            Prim::Mul => int_binop(&p(0), &p(1), |a, b| a.checked_mul(b)),
            Prim::Add => int_binop(&p(0), &p(1), |a, b| a.checked_add(b)),

            Prim::Dec => {
                let a = p(0);
                if a.above_center() {
                    Flow::Int(IntB::Any)
                } else {
                    match a.int_con() {
                        Some(c) => Flow::int(c.wrapping_sub(1)),
                        None => Flow::Int(IntB::All),
                    }
                }
            }

            Prim::Str => {
                let a = p(0);
                if a.above_center() {
                    Flow::Str(StrB {
                        above: true,
                        con: None,
                        nil: false,
                    })
                } else {
                    match a.int_con() {
                        Some(c) => Flow::str_con(&c.to_string()),
                        None => Flow::str_all(),
                    }
                }
            }

            Prim::Factor => {
                let a = p(0);
                if a.above_center() {
                    Flow::Flt(FltB::Any)
                } else {
                    Flow::Flt(FltB::All)
                }
            }

            Prim::NotNil => p(0).not_nil(),
        }
    }

    /// Record constructor flow: a memory pointer over the field tuple,
    /// stored at the primitive's class alias.
    fn make_rec(&mut self, alias: u32, fields: &[Flow], work: bool) -> Flow {
        let mut obj = Obj::default();
        for (i, f) in fields.iter().enumerate() {
            obj.fields.insert(i.to_string(), f.clone());
        }
        let objf = Flow::Obj(obj);
        if work {
            self.mem_store(alias, &objf);
        }
        Flow::MemPtr(Tmp {
            above: false,
            aliases: BitsAlias::of(alias),
            obj: Box::new(objf),
        })
    }
}

fn is_con(f: &Flow) -> bool {
    matches!(
        f,
        Flow::Nil
            | Flow::Int(IntB::Con(_))
            | Flow::Flt(FltB::Con(_))
            | Flow::Str(StrB { con: Some(_), nil: false, .. })
    )
}

fn int_binop(a: &Flow, b: &Flow, op: impl Fn(i64, i64) -> Option<i64>) -> Flow {
    if a.above_center() || b.above_center() {
        return Flow::Int(IntB::Any);
    }
    match (a.int_con(), b.int_con()) {
        (Some(x), Some(y)) => match op(x, y) {
            Some(v) => Flow::int(v),
            None => Flow::Int(IntB::All),
        },
        _ => Flow::Int(IntB::All),
    }
}
