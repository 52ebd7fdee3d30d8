//! The constant-propagation flow lattice.
//!
//! [`Flow`] is the immutable lattice of values the analysis propagates:
//! `Any`/`All` at the extremes, the scalar band (`XScalar`/`Scalar`), nil,
//! integer/float/string bases with constants, function pointers, memory
//! pointers, and the struct object type stored in memory. Values start high
//! (optimistic) and only fall.
//!
//! Above-center values carry an explicit polarity (`above`/`X*` forms);
//! `join` is defined as `dual . meet . dual` so only `meet` is primitive.
//! The laws the engine depends on -- `meet` commutative/idempotent/monotone,
//! `dual` involutive, `isa` agreeing with `meet` -- are pinned by the tests
//! at the bottom of this module.

use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bits::{BitsAlias, BitsFun};

/// A flow-lattice value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flow {
    /// Top of the whole lattice.
    Any,
    /// Bottom of the whole lattice.
    All,
    /// Top of the scalar band: some not-yet-known scalar.
    XScalar,
    /// Bottom of the scalar band: any scalar at all.
    Scalar,
    /// Above-center nil (a choice of nil).
    XNil,
    /// Exactly nil.
    Nil,
    Int(IntB),
    Flt(FltB),
    Str(StrB),
    FunPtr(Tfp),
    MemPtr(Tmp),
    /// A struct object. Lives in memory (and under `MemPtr` expansions),
    /// never directly in a scalar position.
    Obj(Obj),
}

/// Integer base band: `~int64 > ~int1 > constants > int1 > int64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntB {
    Any,
    XBool,
    Con(i64),
    Bool,
    All,
}

/// Float base band. Constants store raw bits so the type is `Eq + Hash`
/// despite `f64`'s NaN problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FltB {
    Any,
    Con(u64),
    All,
}

/// String base: polarity flag, optional constant, nil flag.
///
/// A constant with `above` set is the dual of a constant-or-nil; it only
/// arises through `dual` and falls away at the first meet with a low value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrB {
    pub above: bool,
    pub con: Option<String>,
    pub nil: bool,
}

/// Function pointer: a set of fidxs plus the return flow.
///
/// Bit 0 in `fidxs` means the pointer may be nil; bit 1 means "any function
/// whatsoever".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tfp {
    pub above: bool,
    pub fidxs: BitsFun,
    pub nargs: u8,
    pub ret: Box<Flow>,
}

/// Memory pointer: a set of aliases plus the pointed-at object.
///
/// Bit 0 in `aliases` means the pointer may be nil. The object is also
/// stored in the session memory keyed by alias; the inline copy keeps
/// pointer values printable and liftable without a memory in hand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tmp {
    pub above: bool,
    pub aliases: BitsAlias,
    pub obj: Box<Flow>,
}

/// Struct object: insertion-ordered fields plus an open flag.
///
/// Open means width is still above center: absent fields default to `Any`.
/// Closed structs default absent fields to `All`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Obj {
    pub fields: IndexMap<String, Flow>,
    pub open: bool,
}

impl Hash for Obj {
    // `IndexMap`'s `Eq` is order-independent, so the hash must be too:
    // XOR per-entry hashes rather than hashing the map in iteration order.
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut combined: u64 = 0;
        for (k, v) in &self.fields {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            (k, v).hash(&mut h);
            combined ^= h.finish();
        }
        combined.hash(state);
        self.open.hash(state);
    }
}

impl Flow {
    /// Integer constant. Zero is canonically nil.
    pub fn int(c: i64) -> Flow {
        if c == 0 {
            Flow::Nil
        } else {
            Flow::Int(IntB::Con(c))
        }
    }

    /// Float constant. Zero is canonically nil.
    pub fn flt(c: f64) -> Flow {
        if c == 0.0 {
            Flow::Nil
        } else {
            Flow::Flt(FltB::Con(c.to_bits()))
        }
    }

    /// String constant.
    pub fn str_con(s: &str) -> Flow {
        Flow::Str(StrB {
            above: false,
            con: Some(s.to_string()),
            nil: false,
        })
    }

    /// The `str` base class.
    pub fn str_all() -> Flow {
        Flow::Str(StrB {
            above: false,
            con: None,
            nil: false,
        })
    }

    /// The `int1` range.
    pub fn bool_all() -> Flow {
        Flow::Int(IntB::Bool)
    }

    pub fn fun_ptr(fidx: u32, nargs: u8, ret: Flow) -> Flow {
        Flow::FunPtr(Tfp {
            above: false,
            fidxs: BitsFun::of(fidx),
            nargs,
            ret: Box::new(ret),
        })
    }

    pub fn mem_ptr(alias: u32, obj: Flow) -> Flow {
        Flow::MemPtr(Tmp {
            above: false,
            aliases: BitsAlias::of(alias),
            obj: Box::new(obj),
        })
    }

    /// The unknown object: closed, no tracked fields, every load scalars.
    pub fn obj_unknown() -> Flow {
        Flow::Obj(Obj {
            fields: IndexMap::new(),
            open: false,
        })
    }

    /// The above-center object: open with no fields yet, every load stays
    /// high. Fresh memory slots start here.
    pub fn obj_any() -> Flow {
        Flow::Obj(Obj {
            fields: IndexMap::new(),
            open: true,
        })
    }

    // -----------------------------------------------------------------------
    // Lattice operations
    // -----------------------------------------------------------------------

    /// Greatest lower bound. Monotone, commutative, idempotent.
    pub fn meet(&self, that: &Flow) -> Flow {
        use Flow::*;
        if self == that {
            return self.clone();
        }
        match (self, that) {
            (Any, x) | (x, Any) => x.clone(),
            (All, _) | (_, All) => All,

            // Objects only relate to objects.
            (Obj(a), Obj(b)) => Obj(meet_obj(a, b)),
            (Obj(_), _) | (_, Obj(_)) => All,

            (Scalar, _) | (_, Scalar) => Scalar,
            (XScalar, x) | (x, XScalar) => x.clone(),

            (Nil, XNil) | (XNil, Nil) => Nil,
            (Nil, x) | (x, Nil) => meet_with_nil(x),
            // A high nil stays high against another high choice that also
            // admits nil; otherwise it behaves like nil.
            (XNil, x) | (x, XNil) => {
                if x.above_center() && x.may_nil() {
                    XNil
                } else {
                    meet_with_nil(x)
                }
            }

            (Int(a), Int(b)) => Int(meet_int(*a, *b)),
            (Flt(a), Flt(b)) => Flt(meet_flt(*a, *b)),
            (Str(a), Str(b)) => Str(meet_str(a, b)),
            (FunPtr(a), FunPtr(b)) => meet_tfp(a, b),
            (MemPtr(a), MemPtr(b)) => MemPtr(meet_tmp(a, b)),

            // Mixed scalar kinds fall to the scalar bottom.
            _ => Scalar,
        }
    }

    /// Least upper bound, defined through the dual.
    pub fn join(&self, that: &Flow) -> Flow {
        self.dual().meet(&that.dual()).dual()
    }

    /// Lattice mirror. Involutive.
    pub fn dual(&self) -> Flow {
        use Flow::*;
        match self {
            Any => All,
            All => Any,
            XScalar => Scalar,
            Scalar => XScalar,
            XNil => Nil,
            Nil => XNil,
            Int(b) => Int(dual_int(*b)),
            Flt(b) => Flt(dual_flt(*b)),
            Str(s) => Str(StrB {
                above: !s.above,
                con: s.con.clone(),
                nil: s.nil,
            }),
            FunPtr(t) => FunPtr(Tfp {
                above: !t.above,
                fidxs: t.fidxs.clone(),
                nargs: t.nargs,
                ret: Box::new(t.ret.dual()),
            }),
            MemPtr(t) => MemPtr(Tmp {
                above: !t.above,
                aliases: t.aliases.clone(),
                obj: Box::new(t.obj.dual()),
            }),
            Obj(o) => Obj(crate::flow::Obj {
                fields: o.fields.iter().map(|(k, v)| (k.clone(), v.dual())).collect(),
                open: !o.open,
            }),
        }
    }

    /// `self` is at or below `that`.
    pub fn isa(&self, that: &Flow) -> bool {
        self.meet(that) == *self
    }

    /// Provably nil (or zero; zero constants canonicalize to nil).
    pub fn must_nil(&self) -> bool {
        matches!(self, Flow::Nil | Flow::XNil)
    }

    /// Could this value be nil (or zero)? Above-center values answer for
    /// their eventual low form.
    pub fn may_nil(&self) -> bool {
        match self {
            Flow::Any | Flow::XScalar | Flow::Scalar | Flow::All => true,
            Flow::Nil | Flow::XNil => true,
            Flow::Int(b) => !matches!(b, IntB::Con(_)),
            Flow::Flt(b) => !matches!(b, FltB::Con(_)),
            Flow::Str(s) => s.nil,
            Flow::FunPtr(t) => t.fidxs.test(0),
            Flow::MemPtr(t) => t.aliases.test(0),
            Flow::Obj(_) => false,
        }
    }

    /// Strictly above the lattice center.
    pub fn above_center(&self) -> bool {
        match self {
            Flow::Any | Flow::XScalar | Flow::XNil => true,
            Flow::Int(b) => matches!(b, IntB::Any | IntB::XBool),
            Flow::Flt(b) => matches!(b, FltB::Any),
            Flow::Str(s) => s.above,
            Flow::FunPtr(t) => t.above,
            Flow::MemPtr(t) => t.above,
            Flow::Obj(o) => o.open && o.fields.values().all(|f| f.above_center()),
            Flow::All | Flow::Scalar | Flow::Nil => false,
        }
    }

    /// Constants widen to their base class; pointers widen their payload.
    /// Used when a value escapes to unknown external callers.
    pub fn widen(&self) -> Flow {
        match self {
            Flow::Any | Flow::XScalar => Flow::Scalar,
            Flow::XNil => Flow::Nil,
            Flow::Int(_) => Flow::Int(IntB::All),
            Flow::Flt(_) => Flow::Flt(FltB::All),
            Flow::Str(s) => Flow::Str(StrB {
                above: false,
                con: None,
                nil: s.nil,
            }),
            Flow::FunPtr(t) => Flow::FunPtr(Tfp {
                above: false,
                fidxs: t.fidxs.clone(),
                nargs: t.nargs,
                ret: Box::new(t.ret.widen()),
            }),
            Flow::MemPtr(t) => Flow::MemPtr(Tmp {
                above: false,
                aliases: t.aliases.clone(),
                obj: Box::new(t.obj.widen()),
            }),
            Flow::Obj(o) => Flow::Obj(Obj {
                fields: o
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.widen()))
                    .collect(),
                open: o.open,
            }),
            _ => self.clone(),
        }
    }

    /// Fold nil in: `self meet nil`.
    pub fn meet_nil(&self) -> Flow {
        self.meet(&Flow::Nil)
    }

    /// The non-nil portion, where representable.
    pub fn not_nil(&self) -> Flow {
        match self {
            Flow::Nil => Flow::XNil,
            Flow::Str(s) => Flow::Str(StrB {
                above: s.above,
                con: s.con.clone(),
                nil: false,
            }),
            Flow::FunPtr(t) => Flow::FunPtr(Tfp {
                above: t.above,
                fidxs: t.fidxs.clear(0),
                nargs: t.nargs,
                ret: t.ret.clone(),
            }),
            Flow::MemPtr(t) => Flow::MemPtr(Tmp {
                above: t.above,
                aliases: t.aliases.clear(0),
                obj: t.obj.clone(),
            }),
            _ => self.clone(),
        }
    }

    /// Is this a function pointer below center?
    pub fn as_fun(&self) -> Option<&Tfp> {
        match self {
            Flow::FunPtr(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_mem(&self) -> Option<&Tmp> {
        match self {
            Flow::MemPtr(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<&Obj> {
        match self {
            Flow::Obj(o) => Some(o),
            _ => None,
        }
    }

    /// Integer view of a value, treating nil as zero.
    pub fn int_con(&self) -> Option<i64> {
        match self {
            Flow::Int(IntB::Con(c)) => Some(*c),
            Flow::Nil | Flow::XNil => Some(0),
            _ => None,
        }
    }
}

impl Obj {
    /// Field load. Absent fields default per the open flag.
    pub fn field(&self, label: &str) -> Flow {
        match self.fields.get(label) {
            Some(f) => f.clone(),
            None if self.open => Flow::Any,
            None => Flow::All,
        }
    }
}

/// Meet of nil (either polarity) with `x`. Integer and float bands absorb
/// nil as zero; strings and pointers record it explicitly. An above-center
/// choice that already includes nil collapses to nil; one that does not
/// falls below center with nil folded in.
fn meet_with_nil(x: &Flow) -> Flow {
    match x {
        Flow::Nil | Flow::XNil => Flow::Nil,
        Flow::Int(b) => match b {
            IntB::Any | IntB::XBool => Flow::Nil,
            IntB::Con(c) if is_bit(*c) => Flow::Int(IntB::Bool),
            IntB::Con(_) => Flow::Int(IntB::All),
            IntB::Bool => Flow::Int(IntB::Bool),
            IntB::All => Flow::Int(IntB::All),
        },
        Flow::Flt(b) => match b {
            FltB::Any => Flow::Nil,
            FltB::Con(_) | FltB::All => Flow::Flt(FltB::All),
        },
        Flow::Str(s) => {
            if s.above && s.nil {
                Flow::Nil
            } else {
                Flow::Str(StrB {
                    above: false,
                    con: s.con.clone(),
                    nil: true,
                })
            }
        }
        Flow::FunPtr(t) => {
            if t.above && t.fidxs.test(0) {
                Flow::Nil
            } else {
                Flow::FunPtr(Tfp {
                    above: false,
                    fidxs: t.fidxs.set(0),
                    nargs: t.nargs,
                    ret: t.ret.clone(),
                })
            }
        }
        Flow::MemPtr(t) => {
            if t.above && t.aliases.test(0) {
                Flow::Nil
            } else {
                Flow::MemPtr(Tmp {
                    above: false,
                    aliases: t.aliases.set(0),
                    obj: t.obj.clone(),
                })
            }
        }
        Flow::Obj(_) => Flow::All,
        // Any/All/Scalar/XScalar are handled before the nil arms.
        Flow::Any | Flow::All | Flow::Scalar | Flow::XScalar => x.meet(&Flow::Nil),
    }
}

fn meet_int(a: IntB, b: IntB) -> IntB {
    use IntB::*;
    if a == b {
        return a;
    }
    match (a, b) {
        (Any, x) | (x, Any) => x,
        (All, _) | (_, All) => All,
        (Con(x), Con(y)) => {
            if is_bit(x) && is_bit(y) {
                Bool
            } else {
                All
            }
        }
        (Bool, Con(c)) | (Con(c), Bool) => {
            if is_bit(c) {
                Bool
            } else {
                All
            }
        }
        (XBool, Con(c)) | (Con(c), XBool) => {
            if is_bit(c) {
                Con(c)
            } else {
                All
            }
        }
        (XBool, Bool) | (Bool, XBool) => Bool,
        (XBool, XBool) | (Bool, Bool) => unreachable!("handled by equality"),
    }
}

fn is_bit(c: i64) -> bool {
    c == 0 || c == 1
}

fn dual_int(b: IntB) -> IntB {
    use IntB::*;
    match b {
        Any => All,
        All => Any,
        XBool => Bool,
        Bool => XBool,
        Con(c) => Con(c),
    }
}

fn meet_flt(a: FltB, b: FltB) -> FltB {
    use FltB::*;
    if a == b {
        return a;
    }
    match (a, b) {
        (Any, x) | (x, Any) => x,
        _ => All,
    }
}

fn dual_flt(b: FltB) -> FltB {
    match b {
        FltB::Any => FltB::All,
        FltB::All => FltB::Any,
        FltB::Con(c) => FltB::Con(c),
    }
}

fn meet_str(a: &StrB, b: &StrB) -> StrB {
    match (a.above, b.above) {
        (false, false) => StrB {
            above: false,
            con: if a.con == b.con { a.con.clone() } else { None },
            nil: a.nil || b.nil,
        },
        (true, true) => {
            if a.con == b.con {
                StrB {
                    above: true,
                    con: a.con.clone(),
                    nil: a.nil && b.nil,
                }
            } else if a.con.is_none() || b.con.is_none() {
                StrB {
                    above: true,
                    con: a.con.clone().or_else(|| b.con.clone()),
                    nil: a.nil && b.nil,
                }
            } else {
                // Two distinct above-center constants fall below center.
                StrB {
                    above: false,
                    con: None,
                    nil: false,
                }
            }
        }
        (true, false) => b.clone(),
        (false, true) => a.clone(),
    }
}

fn meet_tfp(a: &Tfp, b: &Tfp) -> Flow {
    match (a.above, b.above) {
        (false, false) => {
            if a.nargs != b.nargs {
                return Flow::Scalar;
            }
            Flow::FunPtr(Tfp {
                above: false,
                fidxs: a.fidxs.meet(&b.fidxs),
                nargs: a.nargs,
                ret: Box::new(a.ret.meet(&b.ret)),
            })
        }
        (true, true) => {
            let inter = a.fidxs.and(&b.fidxs);
            if !inter.is_empty() && a.nargs == b.nargs {
                Flow::FunPtr(Tfp {
                    above: true,
                    fidxs: inter,
                    nargs: a.nargs,
                    ret: Box::new(a.ret.join(&b.ret)),
                })
            } else if a.nargs == b.nargs {
                Flow::FunPtr(Tfp {
                    above: false,
                    fidxs: a.fidxs.meet(&b.fidxs),
                    nargs: a.nargs,
                    ret: Box::new(a.ret.meet(&b.ret)),
                })
            } else {
                Flow::Scalar
            }
        }
        (true, false) => Flow::FunPtr(b.clone()),
        (false, true) => Flow::FunPtr(a.clone()),
    }
}

fn meet_tmp(a: &Tmp, b: &Tmp) -> Tmp {
    match (a.above, b.above) {
        (false, false) => Tmp {
            above: false,
            aliases: a.aliases.meet(&b.aliases),
            obj: Box::new(a.obj.meet(&b.obj)),
        },
        (true, true) => {
            let inter = a.aliases.and(&b.aliases);
            if !inter.is_empty() {
                Tmp {
                    above: true,
                    aliases: inter,
                    obj: Box::new(a.obj.join(&b.obj)),
                }
            } else {
                Tmp {
                    above: false,
                    aliases: a.aliases.meet(&b.aliases),
                    obj: Box::new(a.obj.meet(&b.obj)),
                }
            }
        }
        (true, false) => b.clone(),
        (false, true) => a.clone(),
    }
}

fn meet_obj(a: &Obj, b: &Obj) -> Obj {
    let open = a.open && b.open;
    let mut fields: IndexMap<String, Flow> = IndexMap::new();
    for k in a.fields.keys().chain(b.fields.keys()) {
        if fields.contains_key(k) {
            continue;
        }
        let av = obj_field_or_default(a, k);
        let bv = obj_field_or_default(b, k);
        fields.insert(k.clone(), av.meet(&bv));
    }
    // Canonical form: fields equal to the width default are implicit.
    let dflt = if open { Flow::Any } else { Flow::All };
    fields.retain(|_, v| *v != dflt);
    Obj { fields, open }
}

fn obj_field_or_default(o: &Obj, k: &str) -> Flow {
    match o.fields.get(k) {
        Some(f) => f.clone(),
        None if o.open => Flow::Any,
        None => Flow::All,
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Any => write!(f, "any"),
            Flow::All => write!(f, "all"),
            Flow::XScalar => write!(f, "~Scalar"),
            Flow::Scalar => write!(f, "Scalar"),
            Flow::XNil => write!(f, "~nil"),
            Flow::Nil => write!(f, "nil"),
            Flow::Int(IntB::Any) => write!(f, "~int64"),
            Flow::Int(IntB::XBool) => write!(f, "~int1"),
            Flow::Int(IntB::Con(c)) => write!(f, "{}", c),
            Flow::Int(IntB::Bool) => write!(f, "int1"),
            Flow::Int(IntB::All) => write!(f, "int64"),
            Flow::Flt(FltB::Any) => write!(f, "~flt64"),
            Flow::Flt(FltB::Con(b)) => write!(f, "{:?}", f64::from_bits(*b)),
            Flow::Flt(FltB::All) => write!(f, "flt64"),
            Flow::Str(s) => {
                if s.above {
                    write!(f, "~")?;
                }
                match &s.con {
                    Some(c) => write!(f, "\"{}\"", c)?,
                    None => write!(f, "str")?,
                }
                if s.nil {
                    write!(f, "?")?;
                }
                Ok(())
            }
            Flow::FunPtr(t) => {
                if t.above {
                    write!(f, "~")?;
                }
                write!(f, "[")?;
                for (n, i) in t.fidxs.iter().filter(|&i| i != 0).enumerate() {
                    if n > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", i)?;
                }
                write!(f, "]{{ -> {} }}", t.ret)?;
                if t.fidxs.test(0) {
                    write!(f, "?")?;
                }
                Ok(())
            }
            Flow::MemPtr(t) => {
                if t.above {
                    write!(f, "~")?;
                }
                write!(f, "*[")?;
                for (n, i) in t.aliases.iter().filter(|&i| i != 0).enumerate() {
                    if n > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", i)?;
                }
                write!(f, "]{}", t.obj)?;
                if t.aliases.test(0) {
                    write!(f, "?")?;
                }
                Ok(())
            }
            Flow::Obj(o) => {
                write!(f, "@{{")?;
                for (n, (k, v)) in o.fields.iter().enumerate() {
                    if n > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", k, v)?;
                }
                if o.open {
                    if !o.fields.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair_obj() -> Flow {
        let mut fields = IndexMap::new();
        fields.insert("0".to_string(), Flow::int(3));
        fields.insert("1".to_string(), Flow::str_con("abc"));
        Flow::Obj(Obj {
            fields,
            open: false,
        })
    }

    #[test]
    fn meet_with_extremes() {
        let x = Flow::int(7);
        assert_eq!(Flow::Any.meet(&x), x);
        assert_eq!(Flow::All.meet(&x), Flow::All);
        assert_eq!(Flow::XScalar.meet(&x), x);
        assert_eq!(Flow::Scalar.meet(&x), Flow::Scalar);
    }

    #[test]
    fn int_constants_meet_to_band() {
        assert_eq!(Flow::int(3).meet(&Flow::int(3)), Flow::int(3));
        assert_eq!(Flow::int(3).meet(&Flow::int(4)), Flow::Int(IntB::All));
        assert_eq!(Flow::int(0).meet(&Flow::int(1)), Flow::Int(IntB::Bool));
    }

    #[test]
    fn nil_folds_into_bases() {
        // 0 is an integer, so nil vanishes into the int band.
        assert_eq!(Flow::Nil.meet(&Flow::Int(IntB::All)), Flow::Int(IntB::All));
        assert_eq!(Flow::Nil.meet(&Flow::int(3)), Flow::Int(IntB::All));
        assert_eq!(Flow::Nil.meet(&Flow::int(0)), Flow::int(0));
        // Strings and pointers keep an explicit nil.
        let s = Flow::Nil.meet(&Flow::str_con("abc"));
        assert_eq!(
            s,
            Flow::Str(StrB {
                above: false,
                con: Some("abc".into()),
                nil: true
            })
        );
        let p = Flow::Nil.meet(&Flow::mem_ptr(4, pair_obj()));
        assert!(p.may_nil());
    }

    #[test]
    fn join_of_constants_rises() {
        assert_eq!(Flow::int(2).join(&Flow::int(2)), Flow::int(2));
        assert_eq!(Flow::int(2).join(&Flow::int(3)), Flow::Int(IntB::Any));
        assert_eq!(Flow::int(0).join(&Flow::int(1)), Flow::Int(IntB::XBool));
        assert_eq!(
            Flow::str_con("a").join(&Flow::str_all()),
            Flow::str_con("a")
        );
    }

    #[test]
    fn join_tightens_scalar() {
        // The lift depends on join pulling a Scalar up to a base.
        assert_eq!(Flow::Scalar.join(&Flow::int(3)), Flow::int(3));
        assert_eq!(Flow::Scalar.join(&Flow::Int(IntB::All)), Flow::Int(IntB::All));
    }

    #[test]
    fn isa_agrees_with_meet() {
        assert!(Flow::int(3).isa(&Flow::Int(IntB::All)));
        assert!(Flow::Int(IntB::All).isa(&Flow::Scalar));
        assert!(!Flow::Scalar.isa(&Flow::Int(IntB::All)));
        assert!(Flow::All.isa(&Flow::int(3)));
        assert!(Flow::int(3).isa(&Flow::Any));
    }

    #[test]
    fn must_and_may_nil() {
        assert!(Flow::Nil.must_nil());
        assert!(Flow::int(0).must_nil());
        assert!(!Flow::int(3).must_nil());
        assert!(Flow::Int(IntB::All).may_nil());
        assert!(!Flow::int(3).may_nil());
        assert!(!Flow::str_con("x").may_nil());
        assert!(Flow::str_con("x").meet_nil().may_nil());
    }

    #[test]
    fn widen_drops_constants() {
        assert_eq!(Flow::int(3).widen(), Flow::Int(IntB::All));
        assert_eq!(Flow::str_con("abc").widen(), Flow::str_all());
        let p = Flow::mem_ptr(4, pair_obj()).widen();
        let obj = p.as_mem().unwrap().obj.as_obj().unwrap().clone();
        assert_eq!(obj.fields["0"], Flow::Int(IntB::All));
    }

    #[test]
    fn fun_ptr_meet_unions_fidxs() {
        let a = Flow::fun_ptr(2, 1, Flow::int(3));
        let b = Flow::fun_ptr(3, 1, Flow::int(4));
        match a.meet(&b) {
            Flow::FunPtr(t) => {
                assert!(t.fidxs.test(2) && t.fidxs.test(3));
                assert_eq!(*t.ret, Flow::Int(IntB::All));
            }
            other => panic!("expected FunPtr, got {other}"),
        }
        // Arity mismatch falls out of the function band entirely.
        let c = Flow::fun_ptr(4, 2, Flow::int(1));
        assert_eq!(a.meet(&c), Flow::Scalar);
    }

    #[test]
    fn obj_meet_respects_open() {
        let mut f1 = IndexMap::new();
        f1.insert("x".to_string(), Flow::int(1));
        let open = Flow::Obj(Obj {
            fields: f1,
            open: true,
        });
        let mut f2 = IndexMap::new();
        f2.insert("x".to_string(), Flow::int(1));
        f2.insert("y".to_string(), Flow::int(2));
        let closed = Flow::Obj(Obj {
            fields: f2,
            open: false,
        });
        match open.meet(&closed) {
            Flow::Obj(o) => {
                assert!(!o.open);
                assert_eq!(o.fields["x"], Flow::int(1));
                // y was defaulted Any on the open side.
                assert_eq!(o.fields["y"], Flow::int(2));
            }
            other => panic!("expected Obj, got {other}"),
        }
    }

    #[test]
    fn display_forms() {
        assert_eq!(format!("{}", Flow::int(5)), "5");
        assert_eq!(format!("{}", Flow::Int(IntB::All)), "int64");
        assert_eq!(format!("{}", Flow::str_con("abc")), "\"abc\"");
        assert_eq!(format!("{}", pair_obj()), "@{0=3, 1=\"abc\"}");
        let p = Flow::mem_ptr(4, pair_obj()).meet_nil();
        assert_eq!(format!("{}", p), "*[4]@{0=3, 1=\"abc\"}?");
    }

    fn arb_flow() -> impl Strategy<Value = Flow> {
        prop_oneof![
            Just(Flow::Any),
            Just(Flow::All),
            Just(Flow::XScalar),
            Just(Flow::Scalar),
            Just(Flow::XNil),
            Just(Flow::Nil),
            (-2i64..3).prop_map(Flow::int),
            Just(Flow::Int(IntB::All)),
            Just(Flow::Int(IntB::Any)),
            Just(Flow::Int(IntB::Bool)),
            Just(Flow::Flt(FltB::All)),
            prop_oneof![Just("a"), Just("b")].prop_map(Flow::str_con),
            Just(Flow::str_all()),
            (2u32..5, 0u8..3).prop_map(|(fx, n)| Flow::fun_ptr(fx, n, Flow::Scalar)),
            (2u32..5).prop_map(|a| Flow::mem_ptr(a, Flow::obj_unknown())),
        ]
    }

    proptest! {
        #[test]
        fn meet_commutative(a in arb_flow(), b in arb_flow()) {
            prop_assert_eq!(a.meet(&b), b.meet(&a));
        }

        #[test]
        fn meet_idempotent(a in arb_flow()) {
            prop_assert_eq!(a.meet(&a), a);
        }

        #[test]
        fn dual_involutive(a in arb_flow()) {
            prop_assert_eq!(a.dual().dual(), a);
        }

        #[test]
        fn meet_is_lower_bound(a in arb_flow(), b in arb_flow()) {
            let m = a.meet(&b);
            prop_assert!(m.isa(&a));
            prop_assert!(m.isa(&b));
        }

        #[test]
        fn join_is_upper_bound(a in arb_flow(), b in arb_flow()) {
            let j = a.join(&b);
            prop_assert!(a.isa(&j));
            prop_assert!(b.isa(&j));
        }
    }
}
