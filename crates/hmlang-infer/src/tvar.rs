//! The type-variable graph: union-find with structural parts.
//!
//! A [`Tvar`] is a node of a shared mutable DAG. Classification is by which
//! channels are occupied: nothing at all is a *leaf*; `flow` makes a *base*;
//! `fidxs` a *function* (with `" x"`/`" y"`/`" z"` parameter slots and a
//! `"ret"` slot in `args`); `aliases` a *struct* (record field labels in
//! `args`); a lone `"?"` slot is a *nilable*. Channels may co-exist -- that
//! is an error state, kept monotone: unification never fails, it records.
//!
//! All mutation routes through `find()`. A forwarded node keeps only its
//! forward pointer; deps migrate to the representative before the forward
//! is installed.

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use hmlang_core::bits::{BitsAlias, BitsFun};
use hmlang_core::flow::Flow;

use crate::ast::{NodeId, SynKind, VStack};
use crate::driver::Infer;

/// Handle into the type-variable arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TvId(pub u32);

impl TvId {
    /// Sentinel for nodes not yet prepped.
    pub const NONE: TvId = TvId(u32::MAX);
}

impl fmt::Display for TvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// Function return slot label.
pub const ARG_RET: &str = "ret";
/// Nilable wrapper slot label.
pub const ARG_NIL: &str = "?";

/// Parameter slot label for position `i`. The leading space keeps the
/// reserved labels disjoint from record field names.
pub fn arg_label(i: usize) -> String {
    match i {
        0 => " x".to_string(),
        1 => " y".to_string(),
        2 => " z".to_string(),
        n => format!(" x{n}"),
    }
}

/// A type-variable node.
#[derive(Debug, Clone, Default)]
pub struct Tvar {
    /// Union-find forward pointer; a forwarded node has nothing else.
    pub fwd: Option<TvId>,
    /// Ordered label-to-child mapping.
    pub args: Option<IndexMap<String, TvId>>,
    /// Base channel.
    pub flow: Option<Flow>,
    /// Secondary base kept when two incompatible bases merged.
    pub eflow: Option<Flow>,
    /// Function channel.
    pub fidxs: Option<BitsFun>,
    /// Struct channel.
    pub aliases: Option<BitsAlias>,
    /// Structs only: width still extensible.
    pub open: bool,
    /// Attached analysis error, first one wins.
    pub err: Option<String>,
    /// Syntax nodes to revisit when this class changes.
    pub deps: Vec<NodeId>,
}

impl Infer {
    pub(crate) fn tv(&self, t: TvId) -> &Tvar {
        &self.tvs[t.0 as usize]
    }

    pub(crate) fn tv_mut(&mut self, t: TvId) -> &mut Tvar {
        &mut self.tvs[t.0 as usize]
    }

    fn alloc(&mut self, tv: Tvar) -> TvId {
        let id = TvId(self.tvs.len() as u32);
        self.tvs.push(tv);
        id
    }

    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    pub(crate) fn new_leaf(&mut self) -> TvId {
        self.alloc(Tvar::default())
    }

    pub(crate) fn new_base(&mut self, flow: Flow) -> TvId {
        self.alloc(Tvar {
            flow: Some(flow),
            ..Tvar::default()
        })
    }

    pub(crate) fn new_nilable(&mut self, inner: TvId) -> TvId {
        let mut args = IndexMap::new();
        args.insert(ARG_NIL.to_string(), inner);
        self.alloc(Tvar {
            args: Some(args),
            ..Tvar::default()
        })
    }

    pub(crate) fn new_fun(&mut self, fidxs: BitsFun, params: &[TvId], ret: TvId) -> TvId {
        let mut args = IndexMap::new();
        for (i, &p) in params.iter().enumerate() {
            args.insert(arg_label(i), p);
        }
        args.insert(ARG_RET.to_string(), ret);
        self.alloc(Tvar {
            args: Some(args),
            fidxs: Some(fidxs),
            ..Tvar::default()
        })
    }

    pub(crate) fn new_struct(
        &mut self,
        aliases: BitsAlias,
        fields: &[(String, TvId)],
        open: bool,
    ) -> TvId {
        let mut args = IndexMap::new();
        for (k, v) in fields {
            args.insert(k.clone(), *v);
        }
        self.alloc(Tvar {
            args: Some(args),
            aliases: Some(aliases),
            open,
            ..Tvar::default()
        })
    }

    /// An open struct with a single known field; what a field load demands
    /// of an unresolved record.
    pub(crate) fn new_struct_open_for(&mut self, label: &str, fld: TvId) -> TvId {
        self.new_struct(BitsAlias::empty(), &[(label.to_string(), fld)], true)
    }

    // -----------------------------------------------------------------------
    // Find
    // -----------------------------------------------------------------------

    /// Representative of `t`'s class, path-compressing and canonicalizing
    /// nilable-of-non-leaf in place.
    pub(crate) fn find(&mut self, t: TvId) -> TvId {
        let r = self.find_fwd(t);
        self.nil_canon(r);
        r
    }

    fn find_fwd(&mut self, t: TvId) -> TvId {
        let mut r = t;
        while let Some(n) = self.tvs[r.0 as usize].fwd {
            r = n;
        }
        // Compress the chain.
        let mut c = t;
        while let Some(n) = self.tvs[c.0 as usize].fwd {
            if n != r {
                self.tvs[c.0 as usize].fwd = Some(r);
            }
            c = n;
        }
        r
    }

    /// Read-only find for asserts and printing: follows the chain without
    /// the nilable canonicalization.
    pub(crate) fn debug_find(&self, t: TvId) -> TvId {
        let mut r = t;
        while let Some(n) = self.tvs[r.0 as usize].fwd {
            r = n;
        }
        r
    }

    /// A `?` wrapper over a non-leaf dissolves: nil folds into the child's
    /// base channels, the child's structure lifts in, deps merge. The child
    /// itself is untouched -- other users keep its non-nil reading.
    fn nil_canon(&mut self, t: TvId) {
        if !self.tv_is_nilable(t) {
            return;
        }
        let inner = match self.tv_arg(t, ARG_NIL) {
            Some(i) => self.find_fwd(i),
            None => return,
        };
        if inner == t || self.tv_is_leaf(inner) {
            return;
        }
        self.nil_canon(inner);
        let src = self.tvs[inner.0 as usize].clone();
        let dst = self.tv_mut(t);
        dst.args = src.args;
        dst.flow = src.flow.map(|f| f.meet_nil());
        dst.eflow = src.eflow.map(|f| f.meet_nil());
        dst.fidxs = src.fidxs.map(|f| f.set(0));
        dst.aliases = src.aliases.map(|a| a.set(0));
        dst.open = src.open;
        if dst.err.is_none() {
            dst.err = src.err;
        }
        for d in src.deps {
            if !dst.deps.contains(&d) {
                dst.deps.push(d);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Classification (callers pass representatives)
    // -----------------------------------------------------------------------

    pub(crate) fn tv_is_leaf(&self, t: TvId) -> bool {
        let tv = self.tv(t);
        tv.args.is_none() && tv.flow.is_none() && tv.fidxs.is_none() && tv.aliases.is_none()
    }

    pub(crate) fn tv_is_base(&self, t: TvId) -> bool {
        let tv = self.tv(t);
        tv.flow.is_some() && tv.fidxs.is_none() && tv.aliases.is_none() && tv.args.is_none()
    }

    pub(crate) fn tv_is_fun(&self, t: TvId) -> bool {
        self.tv(t).fidxs.is_some()
    }

    pub(crate) fn tv_is_struct(&self, t: TvId) -> bool {
        self.tv(t).aliases.is_some()
    }

    pub(crate) fn tv_is_nilable(&self, t: TvId) -> bool {
        let tv = self.tv(t);
        tv.flow.is_none()
            && tv.fidxs.is_none()
            && tv.aliases.is_none()
            && tv
                .args
                .as_ref()
                .is_some_and(|a| a.len() == 1 && a.contains_key(ARG_NIL))
    }

    pub(crate) fn tv_is_open(&self, t: TvId) -> bool {
        self.tv(t).open
    }

    /// Does this class admit nil?
    pub(crate) fn tv_has_nil(&self, t: TvId) -> bool {
        let tv = self.tv(t);
        self.tv_is_nilable(t)
            || tv.aliases.as_ref().is_some_and(|a| a.test(0))
            || tv.fidxs.as_ref().is_some_and(|f| f.test(0))
            || tv.flow.as_ref().is_some_and(|f| f.may_nil())
    }

    /// More than one structural channel occupied.
    pub(crate) fn tv_is_err2(&self, t: TvId) -> bool {
        let tv = self.tv(t);
        let n = usize::from(tv.flow.is_some())
            + usize::from(tv.fidxs.is_some())
            + usize::from(tv.aliases.is_some());
        n > 1 || tv.eflow.is_some()
    }

    pub(crate) fn tv_arg(&self, t: TvId, key: &str) -> Option<TvId> {
        self.tv(t).args.as_ref().and_then(|a| a.get(key).copied())
    }

    pub(crate) fn tv_arg_keys(&self, t: TvId) -> Vec<String> {
        self.tv(t)
            .args
            .as_ref()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of parameter slots on a function class.
    pub(crate) fn tv_nparams(&self, t: TvId) -> usize {
        self.tv(t)
            .args
            .as_ref()
            .map(|a| a.keys().filter(|k| k.starts_with(' ')).count())
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Deps
    // -----------------------------------------------------------------------

    /// Register `n` for revisit when `t`'s class changes.
    pub(crate) fn push_dep(&mut self, t: TvId, n: NodeId) {
        let t = self.find_fwd(t);
        let deps = &mut self.tv_mut(t).deps;
        if !deps.contains(&n) {
            deps.push(n);
        }
    }

    /// Register `n` on every node reachable from `t`. A polymorphic use
    /// must re-instantiate when its binder's type grows at any depth, not
    /// only at the representative.
    pub(crate) fn push_dep_rec(&mut self, t: TvId, n: NodeId) {
        let mut seen: HashSet<TvId> = HashSet::new();
        let mut stack = vec![t];
        while let Some(x) = stack.pop() {
            let x = self.find_fwd(x);
            if !seen.insert(x) {
                continue;
            }
            self.push_dep(x, n);
            if let Some(args) = self.tv(x).args.as_ref() {
                stack.extend(args.values().copied());
            }
        }
    }

    /// Enqueue every dep of `t`; a lambda dep also enqueues its applies.
    pub(crate) fn add_deps_work(&mut self, t: TvId) {
        let deps = self.tv(t).deps.clone();
        for d in deps {
            self.work.push(d);
            if let SynKind::Lambda { applys, .. } | SynKind::Prim { applys, .. } =
                &self.prog.node(d).kind
            {
                let aps = applys.clone();
                for a in aps {
                    self.work.push(a);
                }
            }
        }
    }

    /// Attach an error; the first message wins and later identical calls
    /// are no-progress.
    pub(crate) fn set_err(&mut self, t: TvId, msg: &str, work: bool) -> bool {
        let t = self.find_fwd(t);
        if self.tv(t).err.is_some() {
            return false;
        }
        if !work {
            return true;
        }
        self.tv_mut(t).err = Some(msg.to_string());
        self.add_deps_work(t);
        true
    }

    pub(crate) fn add_fld(&mut self, t: TvId, key: &str, v: TvId) {
        let args = self.tv_mut(t).args.get_or_insert_with(IndexMap::new);
        args.insert(key.to_string(), v);
        self.add_deps_work(t);
    }

    fn del_fld(&mut self, t: TvId, key: &str) {
        if let Some(args) = self.tv_mut(t).args.as_mut() {
            args.shift_remove(key);
        }
        self.add_deps_work(t);
    }

    // -----------------------------------------------------------------------
    // Union
    // -----------------------------------------------------------------------

    /// Forward `from` into `to`, migrating deps first.
    fn union(&mut self, from: TvId, to: TvId) -> bool {
        debug_assert_ne!(from, to);
        let deps = std::mem::take(&mut self.tv_mut(from).deps);
        for d in deps {
            let tod = &mut self.tv_mut(to).deps;
            if !tod.contains(&d) {
                tod.push(d);
            }
        }
        *self.tv_mut(from) = Tvar {
            fwd: Some(to),
            ..Tvar::default()
        };
        self.add_deps_work(to);
        true
    }

    /// Merge `from`'s channels into `to` ahead of a union. Children for
    /// common keys are expected to be already unified.
    fn merge_channels(&mut self, from: TvId, to: TvId) {
        let src = self.tvs[from.0 as usize].clone();
        // Missing args move over.
        if let Some(sargs) = &src.args {
            let dst_args = self.tv_mut(to).args.get_or_insert_with(IndexMap::new);
            for (k, v) in sargs {
                dst_args.entry(k.clone()).or_insert(*v);
            }
        }
        let (f, ef) = merge_bases(
            self.tv(to).flow.clone(),
            self.tv(to).eflow.clone(),
            src.flow,
            src.eflow,
        );
        let both_struct = self.tv(to).aliases.is_some() && src.aliases.is_some();
        let dst = self.tv_mut(to);
        dst.flow = f;
        dst.eflow = ef;
        dst.fidxs = match (dst.fidxs.take(), src.fidxs) {
            (Some(a), Some(b)) => Some(a.meet(&b)),
            (a, b) => a.or(b),
        };
        dst.aliases = match (dst.aliases.take(), src.aliases) {
            (Some(a), Some(b)) => Some(a.meet(&b)),
            (a, b) => a.or(b),
        };
        dst.open = if both_struct {
            dst.open && src.open
        } else {
            dst.open || src.open
        };
        if dst.err.is_none() {
            dst.err = src.err;
        }
    }

    // -----------------------------------------------------------------------
    // Unify
    // -----------------------------------------------------------------------

    /// Structural in-place merge of two classes. With `work` false, reports
    /// whether progress would happen without touching anything. Monotone:
    /// re-unifying the same pair is no-progress.
    pub(crate) fn unify(&mut self, a: TvId, b: TvId, work: bool) -> bool {
        let (fa, fb) = (self.find(a), self.find(b));
        if fa == fb {
            return false;
        }
        self.dups.clear();
        self._unify(fa, fb, work)
    }

    fn _unify(&mut self, a: TvId, b: TvId, work: bool) -> bool {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return false;
        }
        // Any distinct pair of representatives will union, which is
        // progress; the test mode can answer immediately.
        if !work {
            return true;
        }

        let (la, lb) = (self.tv_is_leaf(a), self.tv_is_leaf(b));
        if la || lb {
            let (lose, win) = if la && lb {
                if a.0 < b.0 {
                    (b, a)
                } else {
                    (a, b)
                }
            } else if la {
                (a, b)
            } else {
                (b, a)
            };
            self.merge_channels(lose, win);
            return self.union(lose, win);
        }

        let (na, nb) = (self.tv_is_nilable(a), self.tv_is_nilable(b));
        if na != nb {
            let (nil_t, that) = if na { (a, b) } else { (b, a) };
            return self.unify_nil(nil_t, that);
        }

        if self.tv_is_base(a) && self.tv_is_base(b) {
            let (lose, win) = if a.0 < b.0 { (b, a) } else { (a, b) };
            self.merge_channels(lose, win);
            return self.union(lose, win);
        }

        // Cycle guard: re-entry closes the loop without further work; the
        // outermost frame installs the union.
        if !self.dups.insert((a, b)) {
            return false;
        }

        if self.tv_is_struct(a) && self.tv_is_struct(b) {
            self.unify_flds(a, b);
        } else {
            self.unify_common_args(a, b);
        }

        // Children may have forwarded the parents (cyclic types).
        let a2 = self.find(a);
        let b2 = self.find(b);
        if a2 == b2 {
            return true;
        }
        let (lose, win) = if a2.0 < b2.0 { (b2, a2) } else { (a2, b2) };
        self.merge_channels(lose, win);
        self.union(lose, win)
    }

    /// Struct field reconciliation: a field missing on an open side is
    /// added; missing on a closed side it is deleted from the other and
    /// recorded as an error.
    fn unify_flds(&mut self, a: TvId, b: TvId) {
        for k in self.tv_arg_keys(a) {
            let (a, b) = (self.find(a), self.find(b));
            if a == b {
                return;
            }
            let ac = match self.tv_arg(a, &k) {
                Some(c) => c,
                None => continue,
            };
            match self.tv_arg(b, &k) {
                Some(bc) => {
                    self._unify(ac, bc, true);
                }
                None => {
                    if self.tv_is_open(b) {
                        self.add_fld(b, &k, ac);
                    } else {
                        self.del_fld(a, &k);
                        self.set_err(a, &format!("Missing field {k}"), true);
                    }
                }
            }
        }
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return;
        }
        for k in self.tv_arg_keys(b) {
            let (a, b) = (self.find(a), self.find(b));
            if a == b {
                return;
            }
            if self.tv_arg(a, &k).is_some() {
                continue;
            }
            let bc = match self.tv_arg(b, &k) {
                Some(c) => c,
                None => continue,
            };
            if self.tv_is_open(a) {
                self.add_fld(a, &k, bc);
            } else {
                self.del_fld(b, &k);
                self.set_err(b, &format!("Missing field {k}"), true);
            }
        }
    }

    /// Functions, nilables and error mixes: unify on common keys only; an
    /// arity mismatch is recorded, never fails.
    fn unify_common_args(&mut self, a: TvId, b: TvId) {
        let akeys = self.tv_arg_keys(a);
        let bkeys = self.tv_arg_keys(b);
        if self.tv_is_fun(a)
            && self.tv_is_fun(b)
            && (akeys.len() != bkeys.len() || akeys.iter().any(|k| !bkeys.contains(k)))
        {
            self.set_err(a, "Bad argument count", true);
        }
        for k in akeys {
            let (a, b) = (self.find(a), self.find(b));
            if a == b {
                return;
            }
            if let (Some(ac), Some(bc)) = (self.tv_arg(a, &k), self.tv_arg(b, &k)) {
                self._unify(ac, bc, true);
            }
        }
    }

    /// Nilable against a structured non-nil class: the non-nil side is
    /// copied, nil-stripped, unified with the wrapper's inner; the class
    /// itself gains nil and absorbs the wrapper.
    fn unify_nil(&mut self, nil_t: TvId, that: TvId) -> bool {
        let inner = match self.tv_arg(nil_t, ARG_NIL) {
            Some(i) => i,
            None => return false,
        };
        let src = self.tvs[that.0 as usize].clone();
        let copy = self.alloc(Tvar {
            fwd: None,
            args: src.args.clone(),
            flow: src.flow.clone().map(|f| f.not_nil()),
            eflow: src.eflow.clone(),
            fidxs: src.fidxs.clone().map(|f| f.clear(0)),
            aliases: src.aliases.clone().map(|a| a.clear(0)),
            open: src.open,
            err: src.err.clone(),
            deps: Vec::new(),
        });
        self._unify(inner, copy, true);
        // `that` admits nil now.
        let that = self.find(that);
        let dst = self.tv_mut(that);
        dst.flow = dst.flow.take().map(|f| f.meet_nil());
        dst.eflow = dst.eflow.take().map(|f| f.meet_nil());
        dst.fidxs = dst.fidxs.take().map(|f| f.set(0));
        dst.aliases = dst.aliases.take().map(|a| a.set(0));
        let nil_t = self.find_fwd(nil_t);
        if nil_t != that {
            // The wrapper's structure is fully absorbed; only its error and
            // deps carry over.
            let e = self.tv_mut(nil_t).err.take();
            if e.is_some() && self.tv(that).err.is_none() {
                self.tv_mut(that).err = e;
            }
            self.union(nil_t, that);
        }
        self.add_deps_work(that);
        true
    }

    // -----------------------------------------------------------------------
    // Fresh instantiation
    // -----------------------------------------------------------------------

    /// Unify a fresh (alpha-renamed) copy of `lhs` with `rhs`. Leaves of
    /// `lhs` reachable from an enclosing binder in `nongen` are shared, not
    /// copied. Cycles copy as cycles.
    pub(crate) fn fresh_unify(
        &mut self,
        lhs: TvId,
        rhs: TvId,
        nongen: &Option<Rc<VStack>>,
        work: bool,
    ) -> bool {
        self.vars.clear();
        self._fresh_unify(lhs, rhs, nongen, work)
    }

    fn _fresh_unify(
        &mut self,
        lhs: TvId,
        rhs: TvId,
        nongen: &Option<Rc<VStack>>,
        work: bool,
    ) -> bool {
        let lhs = self.find(lhs);
        let rhs = self.find(rhs);
        if lhs == rhs {
            return false;
        }
        if let Some(&prior) = self.vars.get(&lhs) {
            // Already instantiated this polymorphic node: plain unify.
            return self.unify(prior, rhs, work);
        }
        if self.nongen_in(lhs, nongen) {
            self.vars.insert(lhs, rhs);
            return self.unify(lhs, rhs, work);
        }
        if self.tv_is_leaf(lhs) {
            // A fresh copy of a generic leaf is a fresh leaf: nothing to
            // learn about rhs.
            self.vars.insert(lhs, rhs);
            return false;
        }
        if self.tv_is_leaf(rhs) {
            if !work {
                return true;
            }
            let copy = self.fresh_copy(lhs, nongen);
            return self.unify(rhs, copy, true);
        }
        self.vars.insert(lhs, rhs);
        let mut progress = self.fresh_merge_channels(lhs, rhs, work);
        if !work && progress {
            return true;
        }
        let both_struct = self.tv_is_struct(lhs) && self.tv_is_struct(rhs);
        for k in self.tv_arg_keys(lhs) {
            let l = self.find(lhs);
            let lc = match self.tv_arg(l, &k) {
                Some(c) => c,
                None => continue,
            };
            let r = self.find(rhs);
            match self.tv_arg(r, &k) {
                Some(rc) => progress |= self._fresh_unify(lc, rc, nongen, work),
                None => {
                    if !work {
                        return true;
                    }
                    if self.tv_is_open(r) || self.tv_is_fun(r) {
                        let c = self.fresh_copy(lc, nongen);
                        let r = self.find(rhs);
                        self.add_fld(r, &k, c);
                    } else {
                        self.set_err(r, &format!("Missing field {k}"), true);
                    }
                    progress = true;
                }
            }
        }
        let l = self.find(lhs);
        if both_struct && !self.tv_is_open(l) {
            let lkeys = self.tv_arg_keys(l);
            let r = self.find(rhs);
            for k in self.tv_arg_keys(r) {
                if lkeys.contains(&k) {
                    continue;
                }
                if !work {
                    return true;
                }
                let r = self.find(rhs);
                self.del_fld(r, &k);
                self.set_err(r, &format!("Missing field {k}"), true);
                progress = true;
            }
        }
        progress
    }

    /// Meet `lhs`'s non-arg channels into `rhs`.
    fn fresh_merge_channels(&mut self, lhs: TvId, rhs: TvId, work: bool) -> bool {
        let src = self.tvs[lhs.0 as usize].clone();
        let (f, ef) = merge_bases(
            self.tv(rhs).flow.clone(),
            self.tv(rhs).eflow.clone(),
            src.flow.clone(),
            src.eflow.clone(),
        );
        let fidxs = match (self.tv(rhs).fidxs.clone(), src.fidxs.clone()) {
            (Some(a), Some(b)) => Some(a.meet(&b)),
            (a, b) => a.or(b),
        };
        let aliases = match (self.tv(rhs).aliases.clone(), src.aliases.clone()) {
            (Some(a), Some(b)) => Some(a.meet(&b)),
            (a, b) => a.or(b),
        };
        let both_struct = self.tv(rhs).aliases.is_some() && src.aliases.is_some();
        let open = if both_struct {
            self.tv(rhs).open && src.open
        } else {
            self.tv(rhs).open || src.open
        };
        let dst = self.tv(rhs);
        let changed = dst.flow != f
            || dst.eflow != ef
            || dst.fidxs != fidxs
            || dst.aliases != aliases
            || dst.open != open;
        if !changed {
            return false;
        }
        if !work {
            return true;
        }
        let dst = self.tv_mut(rhs);
        dst.flow = f;
        dst.eflow = ef;
        dst.fidxs = fidxs;
        dst.aliases = aliases;
        dst.open = open;
        self.add_deps_work(rhs);
        true
    }

    /// Deep copy with sharing of nongen-captured nodes; the `vars` map is
    /// seeded before recursion so cycles copy as cycles.
    fn fresh_copy(&mut self, t: TvId, nongen: &Option<Rc<VStack>>) -> TvId {
        let t = self.find(t);
        if let Some(&c) = self.vars.get(&t) {
            return c;
        }
        if self.nongen_in(t, nongen) {
            self.vars.insert(t, t);
            return t;
        }
        let src = self.tvs[t.0 as usize].clone();
        let id = self.alloc(Tvar {
            fwd: None,
            args: src.args.as_ref().map(|_| IndexMap::new()),
            flow: src.flow.clone(),
            eflow: src.eflow.clone(),
            fidxs: src.fidxs.clone(),
            aliases: src.aliases.clone(),
            open: src.open,
            err: src.err.clone(),
            deps: Vec::new(),
        });
        self.vars.insert(t, id);
        if let Some(args) = src.args {
            for (k, v) in args {
                let c = self.fresh_copy(v, nongen);
                if let Some(a) = self.tv_mut(id).args.as_mut() {
                    a.insert(k, c);
                }
            }
        }
        id
    }

    /// Occurs-in-enclosing-binder check.
    fn nongen_in(&mut self, t: TvId, nongen: &Option<Rc<VStack>>) -> bool {
        for btv in VStack::iter(nongen) {
            self.odups.clear();
            let hay = self.find(btv);
            if self.occurs_in(hay, t) {
                return true;
            }
        }
        false
    }

    fn occurs_in(&mut self, hay: TvId, needle: TvId) -> bool {
        let hay = self.find_fwd(hay);
        if hay == needle {
            return true;
        }
        if !self.odups.insert(hay) {
            return false;
        }
        let children: Vec<TvId> = self
            .tv(hay)
            .args
            .as_ref()
            .map(|a| a.values().copied().collect())
            .unwrap_or_default();
        children.into_iter().any(|c| self.occurs_in(c, needle))
    }

    // -----------------------------------------------------------------------
    // Cycle-aware equality
    // -----------------------------------------------------------------------

    /// Structural equality modulo find, assuming equality at cycle
    /// re-entries unless a disagreement is found elsewhere.
    pub(crate) fn cycle_equals(&mut self, a: TvId, b: TvId) -> bool {
        self.cdups.clear();
        self._cycle_equals(a, b)
    }

    fn _cycle_equals(&mut self, a: TvId, b: TvId) -> bool {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return true;
        }
        let (ta, tb) = (self.tv(a), self.tv(b));
        if ta.flow != tb.flow
            || ta.eflow != tb.eflow
            || ta.fidxs != tb.fidxs
            || ta.aliases != tb.aliases
            || ta.open != tb.open
        {
            return false;
        }
        // Two distinct leaves are distinct variables.
        if self.tv_is_leaf(a) || self.tv_is_leaf(b) {
            return false;
        }
        let akeys = self.tv_arg_keys(a);
        if akeys != self.tv_arg_keys(b) {
            return false;
        }
        if !self.cdups.insert((a, b)) {
            return true;
        }
        for k in akeys {
            if let (Some(ac), Some(bc)) = (self.tv_arg(a, &k), self.tv_arg(b, &k)) {
                if !self._cycle_equals(ac, bc) {
                    return false;
                }
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Printing
    // -----------------------------------------------------------------------

    /// Print the scheme rooted at `t`: fresh leaves name `A..Z` then
    /// `V{id}`; errors render in place.
    pub(crate) fn scheme_of(&mut self, t: TvId) -> String {
        let mut out = String::new();
        let mut names = indexmap::IndexMap::new();
        let mut on_stack = HashSet::new();
        self.p_tv(t, &mut out, &mut names, &mut on_stack);
        out
    }

    fn leaf_name(names: &mut indexmap::IndexMap<TvId, String>, t: TvId) -> String {
        if let Some(n) = names.get(&t) {
            return n.clone();
        }
        let i = names.len();
        let name = if i < 26 {
            ((b'A' + i as u8) as char).to_string()
        } else {
            format!("V{}", t.0)
        };
        names.insert(t, name.clone());
        name
    }

    fn p_tv(
        &mut self,
        t: TvId,
        out: &mut String,
        names: &mut indexmap::IndexMap<TvId, String>,
        on_stack: &mut HashSet<TvId>,
    ) {
        let t = self.find(t);
        let tv = self.tv(t).clone();
        if let Some(e) = &tv.err {
            out.push_str(e);
            return;
        }
        if let Some(ef) = &tv.eflow {
            let f = tv
                .flow
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "_".to_string());
            out.push_str(&format!("Cannot unify {f} and {ef}"));
            return;
        }
        if self.tv_is_err2(t) {
            let mut kinds: Vec<String> = Vec::new();
            if let Some(f) = &tv.flow {
                kinds.push(f.to_string());
            }
            if tv.fidxs.is_some() {
                kinds.push("{ function }".to_string());
            }
            if tv.aliases.is_some() {
                kinds.push("@{ struct }".to_string());
            }
            out.push_str(&format!("Cannot unify {} and {}", kinds[0], kinds[1]));
            return;
        }
        if !on_stack.insert(t) {
            // Cyclic back-reference prints as a variable.
            out.push_str(&Self::leaf_name(names, t));
            return;
        }
        if self.tv_is_leaf(t) {
            out.push_str(&Self::leaf_name(names, t));
        } else if self.tv_is_nilable(t) {
            if let Some(inner) = self.tv_arg(t, ARG_NIL) {
                self.p_tv(inner, out, names, on_stack);
            }
            out.push('?');
        } else if self.tv_is_base(t) {
            if let Some(f) = &tv.flow {
                out.push_str(&f.to_string());
            }
        } else if self.tv_is_fun(t) {
            out.push_str("{ ");
            let keys = self.tv_arg_keys(t);
            for k in keys.iter().filter(|k| k.starts_with(' ')) {
                if let Some(c) = self.tv_arg(t, k) {
                    self.p_tv(c, out, names, on_stack);
                    out.push(' ');
                }
            }
            out.push_str("-> ");
            if let Some(r) = self.tv_arg(t, ARG_RET) {
                self.p_tv(r, out, names, on_stack);
            }
            out.push_str(" }");
            if tv.fidxs.as_ref().is_some_and(|f| f.test(0)) {
                out.push('?');
            }
        } else if self.tv_is_struct(t) {
            out.push_str("@{");
            let keys = self.tv_arg_keys(t);
            let mut first = true;
            for k in &keys {
                if !first {
                    out.push_str(", ");
                } else {
                    out.push(' ');
                }
                first = false;
                out.push_str(k);
                out.push('=');
                if let Some(c) = self.tv_arg(t, k) {
                    self.p_tv(c, out, names, on_stack);
                }
            }
            if tv.open {
                if !first {
                    out.push_str(", ");
                } else {
                    out.push(' ');
                }
                out.push_str("...");
            }
            out.push_str(" }");
            if tv.aliases.as_ref().is_some_and(|a| a.test(0)) {
                out.push('?');
            }
        }
        on_stack.remove(&t);
    }
}

/// Keep the top two base channels by the fixed priority Int > Flt > Str;
/// equal priorities meet, everything lower-priority displaces into `eflow`.
fn merge_bases(
    af: Option<Flow>,
    aef: Option<Flow>,
    bf: Option<Flow>,
    bef: Option<Flow>,
) -> (Option<Flow>, Option<Flow>) {
    let cands: Vec<Flow> = [af, aef, bf, bef].into_iter().flatten().collect();
    if cands.is_empty() {
        return (None, None);
    }
    let top = cands.iter().map(base_prio).max().unwrap_or(0);
    let mut flow: Option<Flow> = None;
    let mut eflow: Option<Flow> = None;
    for c in &cands {
        if base_prio(c) == top {
            flow = Some(match flow {
                Some(f) => f.meet(c),
                None => c.clone(),
            });
        } else {
            eflow = Some(match eflow {
                Some(f) => f.meet(c),
                None => c.clone(),
            });
        }
    }
    (flow, eflow)
}

fn base_prio(f: &Flow) -> u8 {
    match f {
        Flow::Int(_) => 3,
        Flow::Flt(_) => 2,
        Flow::Str(_) => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Prog;
    use crate::driver::{Infer, InferConfig};
    use hmlang_core::flow::{FltB, IntB};

    fn session() -> Infer {
        Infer::new(Prog::new(), InferConfig::default())
    }

    #[test]
    fn two_leaves_union_to_smaller_id() {
        let mut s = session();
        let a = s.new_leaf();
        let b = s.new_leaf();
        assert!(s.unify(a, b, true));
        assert_eq!(s.find(a), s.find(b));
        assert_eq!(s.find(b), a);
        // Re-unifying is no progress.
        assert!(!s.unify(a, b, true));
        assert!(!s.unify(a, b, false));
    }

    #[test]
    fn test_mode_does_not_mutate() {
        let mut s = session();
        let a = s.new_leaf();
        let b = s.new_base(Flow::int(3));
        assert!(s.unify(a, b, false));
        // Still two distinct classes.
        assert_ne!(s.find(a), s.find(b));
        assert!(s.unify(a, b, true));
        assert_eq!(s.find(a), s.find(b));
    }

    #[test]
    fn leaf_forwards_into_base() {
        let mut s = session();
        let a = s.new_leaf();
        let b = s.new_base(Flow::int(3));
        s.unify(a, b, true);
        let r = s.find(a);
        assert_eq!(r, b);
        assert!(s.tv_is_base(r));
        assert_eq!(s.tv(r).flow, Some(Flow::int(3)));
    }

    #[test]
    fn base_merge_meets_same_kind() {
        let mut s = session();
        let a = s.new_base(Flow::int(3));
        let b = s.new_base(Flow::int(4));
        s.unify(a, b, true);
        let r = s.find(a);
        assert_eq!(s.tv(r).flow, Some(Flow::Int(IntB::All)));
        assert_eq!(s.tv(r).eflow, None);
    }

    #[test]
    fn base_merge_displaces_lower_priority() {
        let mut s = session();
        let a = s.new_base(Flow::int(3));
        let b = s.new_base(Flow::str_con("abc"));
        s.unify(a, b, true);
        let r = s.find(a);
        // Int wins the primary channel, the string survives in eflow.
        assert_eq!(s.tv(r).flow, Some(Flow::int(3)));
        assert_eq!(s.tv(r).eflow, Some(Flow::str_con("abc")));
        assert!(s.tv_is_err2(r));
        // Flt sits between.
        let c = s.new_base(Flow::flt(1.5));
        s.unify(r, c, true);
        let r2 = s.find(r);
        assert_eq!(s.tv(r2).flow, Some(Flow::int(3)));
        let ef = s.tv(r2).eflow.clone().unwrap();
        assert_eq!(ef, Flow::flt(1.5).meet(&Flow::str_con("abc")));
    }

    #[test]
    fn nilable_of_base_folds_in_find() {
        let mut s = session();
        let base = s.new_base(Flow::str_con("abc"));
        let leaf = s.new_leaf();
        let nil = s.new_nilable(leaf);
        // While the child is a leaf, the wrapper stays.
        assert_eq!(s.find(nil), nil);
        let fnil = s.find(nil);
        assert!(s.tv_is_nilable(fnil));
        // Once the child resolves to a base, the wrapper dissolves.
        s.unify(leaf, base, true);
        let r = s.find(nil);
        assert!(s.tv_is_base(r));
        assert_eq!(s.tv(r).flow, Some(Flow::str_con("abc").meet_nil()));
        // The base itself keeps its non-nil reading.
        let fbase = s.find(base);
        assert_eq!(s.tv(fbase).flow, Some(Flow::str_con("abc")));
    }

    #[test]
    fn unify_nil_strips_and_reunifies() {
        let mut s = session();
        let leaf = s.new_leaf();
        let nil = s.new_nilable(leaf);
        let base = s.new_base(Flow::str_con("abc"));
        assert!(s.unify(nil, base, true));
        // The wrapper forwarded into the base, which gained nil.
        let r = s.find(nil);
        assert_eq!(r, s.find(base));
        assert_eq!(s.tv(r).flow, Some(Flow::str_con("abc").meet_nil()));
        // The inner leaf got the stripped reading.
        let ir = s.find(leaf);
        assert_eq!(s.tv(ir).flow, Some(Flow::str_con("abc")));
    }

    #[test]
    fn struct_unify_extends_open_side() {
        let mut s = session();
        let f1 = s.new_leaf();
        let open = s.new_struct_open_for("x", f1);
        let f2 = s.new_leaf();
        let f3 = s.new_leaf();
        let closed = s.new_struct(
            BitsAlias::of(4),
            &[("x".to_string(), f2), ("y".to_string(), f3)],
            false,
        );
        s.unify(open, closed, true);
        let r = s.find(open);
        assert_eq!(r, s.find(closed));
        assert!(!s.tv_is_open(r));
        assert_eq!(s.tv_arg_keys(r), vec!["x".to_string(), "y".to_string()]);
        assert_eq!(s.find(f1), s.find(f2));
        assert!(s.tv(r).err.is_none());
    }

    #[test]
    fn struct_unify_missing_field_on_closed_side_errs() {
        let mut s = session();
        let f1 = s.new_leaf();
        let f2 = s.new_leaf();
        let two = s.new_struct(
            BitsAlias::of(4),
            &[("x".to_string(), f1), ("y".to_string(), f2)],
            false,
        );
        let f3 = s.new_leaf();
        let one = s.new_struct(BitsAlias::of(5), &[("x".to_string(), f3)], false);
        s.unify(two, one, true);
        let r = s.find(two);
        assert!(s.tv(r).err.as_deref().is_some_and(|e| e.contains("Missing field y")));
    }

    #[test]
    fn fun_meets_struct_is_error_state() {
        let mut s = session();
        let p = s.new_leaf();
        let r = s.new_leaf();
        let f = s.new_fun(BitsFun::of(2), &[p], r);
        let fl = s.new_leaf();
        let st = s.new_struct(BitsAlias::of(4), &[("x".to_string(), fl)], false);
        s.unify(f, st, true);
        let rep = s.find(f);
        assert!(s.tv_is_err2(rep));
        let printed = s.scheme_of(rep);
        assert!(printed.contains("Cannot unify"), "got: {printed}");
    }

    #[test]
    fn fresh_unify_copies_polymorphic_type() {
        // id = { x -> x }; instantiating twice must not conflate the uses.
        let mut s = session();
        let x = s.new_leaf();
        let id_t = s.new_fun(BitsFun::of(2), &[x], x);

        let use1 = s.new_leaf();
        assert!(s.fresh_unify(id_t, use1, &None, true));
        let i3 = s.new_base(Flow::int(3));
        let u1 = s.find(use1);
        let p1 = s.tv_arg(u1, " x").unwrap();
        s.unify(p1, i3, true);

        let use2 = s.new_leaf();
        assert!(s.fresh_unify(id_t, use2, &None, true));
        let sa = s.new_base(Flow::str_con("abc"));
        let u2 = s.find(use2);
        let p2 = s.tv_arg(u2, " x").unwrap();
        s.unify(p2, sa, true);

        // First instantiation is int, second is str, original untouched.
        let r1 = s.find(use1);
        let r1p = s.find(s.tv_arg(r1, " x").unwrap());
        assert_eq!(s.tv(r1p).flow, Some(Flow::int(3)));
        let r2 = s.find(use2);
        let r2p = s.find(s.tv_arg(r2, " x").unwrap());
        assert_eq!(s.tv(r2p).flow, Some(Flow::str_con("abc")));
        let fid_t = s.find(id_t);
        let arg_p = s.tv_arg(fid_t, " x").unwrap();
        let orig_p = s.find(arg_p);
        assert!(s.tv_is_leaf(orig_p));
    }

    #[test]
    fn occurs_check_shares_captured_leaf() {
        // A leaf captured by an enclosing binder is unified, not copied.
        let mut s = session();
        let captured = s.new_leaf();
        let fun = s.new_fun(BitsFun::of(2), &[captured], captured);
        let nongen = VStack::push(&None, captured);

        let use1 = s.new_leaf();
        s.fresh_unify(fun, use1, &nongen, true);
        let u = s.find(use1);
        let p = s.find(s.tv_arg(u, " x").unwrap());
        // The parameter slot is the captured leaf itself.
        assert_eq!(p, s.find(captured));
    }

    #[test]
    fn fresh_copy_preserves_cycles() {
        // f : { A -> f } (a function returning itself).
        let mut s = session();
        let p = s.new_leaf();
        let f = s.new_fun(BitsFun::of(2), &[p], p);
        // Tie the knot: ret slot points back at the function.
        if let Some(args) = s.tv_mut(f).args.as_mut() {
            args.insert(ARG_RET.to_string(), f);
        }
        let use1 = s.new_leaf();
        s.fresh_unify(f, use1, &None, true);
        let u = s.find(use1);
        let r = s.find(s.tv_arg(u, ARG_RET).unwrap());
        // The copy's return is the copy itself, not an unrolling.
        assert_eq!(r, u);
    }

    #[test]
    fn cycle_equals_closes_at_reentry() {
        // Two structurally identical self-returning functions sharing one
        // parameter leaf: equality must terminate through the cycle map.
        let mut s = session();
        let p = s.new_leaf();
        let f1 = s.new_fun(BitsFun::of(2), &[p], p);
        if let Some(args) = s.tv_mut(f1).args.as_mut() {
            args.insert(ARG_RET.to_string(), f1);
        }
        let f2 = s.new_fun(BitsFun::of(2), &[p], p);
        if let Some(args) = s.tv_mut(f2).args.as_mut() {
            args.insert(ARG_RET.to_string(), f2);
        }
        assert!(s.cycle_equals(f1, f2));
    }

    #[test]
    fn cycle_equals_distinguishes_flows() {
        let mut s = session();
        let a = s.new_base(Flow::int(3));
        let b = s.new_base(Flow::int(3));
        assert!(s.cycle_equals(a, b));
        let c = s.new_base(Flow::int(4));
        assert!(!s.cycle_equals(a, c));
        let l1 = s.new_leaf();
        let l2 = s.new_leaf();
        assert!(!s.cycle_equals(l1, l2));
    }

    #[test]
    fn scheme_printing() {
        let mut s = session();
        let x = s.new_leaf();
        let f = s.new_fun(BitsFun::of(2), &[x], x);
        assert_eq!(s.scheme_of(f), "{ A -> A }");

        let leaf = s.new_leaf();
        let nil = s.new_nilable(leaf);
        assert_eq!(s.scheme_of(nil), "A?");

        let b = s.new_base(Flow::int(5));
        assert_eq!(s.scheme_of(b), "5");

        let fx = s.new_base(Flow::int(3));
        let fy = s.new_base(Flow::str_con("abc"));
        let st = s.new_struct(
            BitsAlias::of(4),
            &[("0".to_string(), fx), ("1".to_string(), fy)],
            false,
        );
        assert_eq!(s.scheme_of(st), "@{ 0=3, 1=\"abc\" }");

        let fz = s.new_base(Flow::Int(IntB::All));
        let open = s.new_struct(BitsAlias::empty().set(0), &[("x".to_string(), fz)], true);
        assert_eq!(s.scheme_of(open), "@{ x=int64, ... }?");
    }

    #[test]
    fn debug_find_does_not_fold_nilables() {
        let mut s = session();
        let base = s.new_base(Flow::flt(1.5));
        let nil = s.new_nilable(base);
        assert_eq!(s.debug_find(nil), nil);
        assert!(s.tv_is_nilable(nil));
        // find() folds.
        let r = s.find(nil);
        assert_eq!(r, nil);
        assert!(s.tv_is_base(r));
        assert_eq!(s.tv(r).flow, Some(Flow::Flt(FltB::All)));
    }
}
