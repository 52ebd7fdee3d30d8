//! The post-parse syntax tree and its analysis operations.
//!
//! Nodes live in a [`Prog`] arena and are addressed by [`NodeId`]. The node
//! kinds form a tagged sum ([`SynKind`]); the three analysis operations --
//! `prep_tree`, `hm`, `val` -- dispatch exhaustively over it with no
//! wildcard arms.
//!
//! Every node carries its current HM type variable (`hmt`), its current
//! flow type (`flow`, monotone falling), and its non-generative environment
//! (`nongen`): the stack of binder type variables that fresh instantiation
//! must not copy.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use hmlang_core::flow::{Flow, Tfp};
use hmlang_core::bits::BitsFun;

use crate::driver::Infer;
use crate::prim::Prim;
use crate::tvar::{arg_label, TvId, ARG_RET};

/// Stable AST node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One frame of the non-generative environment: a binder's type variable
/// plus the enclosing frames.
#[derive(Debug)]
pub struct VStack {
    pub tv: TvId,
    pub par: Option<Rc<VStack>>,
}

impl VStack {
    /// Push a frame, returning the extended stack.
    pub fn push(par: &Option<Rc<VStack>>, tv: TvId) -> Option<Rc<VStack>> {
        Some(Rc::new(VStack {
            tv,
            par: par.clone(),
        }))
    }

    /// Iterate the binder type variables, innermost first.
    pub fn iter(stack: &Option<Rc<VStack>>) -> impl Iterator<Item = TvId> {
        let mut frames = Vec::new();
        let mut cur = stack.clone();
        while let Some(f) = cur {
            frames.push(f.tv);
            cur = f.par.clone();
        }
        frames.into_iter()
    }
}

/// How an identifier resolves to its binder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Not yet resolved (only during parsing).
    Unresolved,
    /// A lambda parameter.
    Param { lambda: NodeId, idx: usize },
    /// A let binding; `poly` is true for uses in the let body, false for
    /// recursive uses inside the definition.
    LetBound { let_id: NodeId, poly: bool },
}

/// The node kinds.
#[derive(Debug, Clone)]
pub enum SynKind {
    /// Literal constant. `0` is the nil literal.
    Con { val: Flow },
    Ident {
        name: String,
        bind: Binding,
    },
    Lambda {
        params: SmallVec<[String; 3]>,
        body: NodeId,
        /// Unique function index, assigned during prep.
        fidx: u32,
        /// Per-parameter type variables.
        targs: SmallVec<[TvId; 3]>,
        /// Per-parameter flow types, lowered by `arg_meet`.
        ptypes: SmallVec<[Flow; 3]>,
        /// Applies that can call this lambda.
        applys: Vec<NodeId>,
        /// Per-parameter identifier uses, re-run when the parameter lowers.
        pidents: Vec<Vec<NodeId>>,
    },
    Let {
        name: String,
        def: NodeId,
        body: NodeId,
        /// The binder's type variable.
        targ: TvId,
        /// Identifier uses of this binding.
        idents: Vec<NodeId>,
    },
    Apply {
        fun: NodeId,
        args: SmallVec<[NodeId; 3]>,
    },
    StructLit {
        /// Alias class of this literal, assigned during prep.
        alias: u32,
        fields: Vec<(String, NodeId)>,
    },
    Field {
        label: String,
        rec: NodeId,
    },
    /// A primitive, occurring as a first-class function value.
    Prim {
        prim: Prim,
        fidx: u32,
        targs: SmallVec<[TvId; 3]>,
        ptypes: SmallVec<[Flow; 3]>,
        applys: Vec<NodeId>,
    },
    /// Wrapper modeling the external caller of the whole program.
    Root { body: NodeId },
}

/// The syntax arena.
#[derive(Debug)]
pub struct Prog {
    pub nodes: Vec<Syn>,
    pub root: NodeId,
}

/// One syntax node with its analysis state.
#[derive(Debug)]
pub struct Syn {
    pub id: NodeId,
    pub par: Option<NodeId>,
    pub hmt: TvId,
    pub flow: Flow,
    pub nongen: Option<Rc<VStack>>,
    pub kind: SynKind,
}

impl Prog {
    pub fn new() -> Self {
        Prog {
            nodes: Vec::new(),
            root: NodeId(0),
        }
    }

    /// Adds a node; parent and type variables are filled in during prep.
    pub fn add(&mut self, kind: SynKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Syn {
            id,
            par: None,
            hmt: TvId::NONE,
            flow: Flow::Any,
            nongen: None,
            kind,
        });
        id
    }

    /// Reserves a node slot so children can point back at a binder that is
    /// parsed before its subtrees are complete.
    pub fn reserve(&mut self) -> NodeId {
        self.add(SynKind::Root { body: NodeId(0) })
    }

    pub fn set_kind(&mut self, id: NodeId, kind: SynKind) {
        self.nodes[id.0 as usize].kind = kind;
    }

    pub fn node(&self, id: NodeId) -> &Syn {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Syn {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for Prog {
    fn default() -> Self {
        Self::new()
    }
}

impl Infer {
    pub(crate) fn hmt_of(&self, n: NodeId) -> TvId {
        self.prog.node(n).hmt
    }

    pub(crate) fn flow_of(&self, n: NodeId) -> Flow {
        self.prog.node(n).flow.clone()
    }

    // -----------------------------------------------------------------------
    // prep_tree
    // -----------------------------------------------------------------------

    /// Initial allocation of type variables and structural pre-unification.
    /// Assigns parents and non-generative environments, extends `nongen`
    /// under lambdas (every parameter) and on the definition side of lets.
    /// Returns the subtree size.
    pub(crate) fn prep_tree(
        &mut self,
        n: NodeId,
        par: Option<NodeId>,
        nongen: Option<Rc<VStack>>,
    ) -> usize {
        self.prog.node_mut(n).par = par;
        self.prog.node_mut(n).nongen = nongen.clone();

        let kind = self.prog.node(n).kind.clone();
        match kind {
            SynKind::Con { val } => {
                let t = if val.must_nil() {
                    let leaf = self.new_leaf();
                    self.new_nilable(leaf)
                } else {
                    self.new_base(val)
                };
                self.prog.node_mut(n).hmt = t;
                1
            }

            SynKind::Ident { bind, .. } => {
                let t = self.new_leaf();
                self.prog.node_mut(n).hmt = t;
                match bind {
                    Binding::Param { lambda, idx } => {
                        if let SynKind::Lambda { pidents, .. } =
                            &mut self.prog.node_mut(lambda).kind
                        {
                            pidents[idx].push(n);
                        }
                    }
                    Binding::LetBound { let_id, .. } => {
                        if let SynKind::Let { idents, .. } = &mut self.prog.node_mut(let_id).kind {
                            idents.push(n);
                        }
                    }
                    Binding::Unresolved => {}
                }
                1
            }

            SynKind::Lambda { params, body, .. } => {
                let fidx = self.fidxs.new_fidx();
                self.fidx_map.insert(fidx, n);
                let targs: SmallVec<[TvId; 3]> =
                    params.iter().map(|_| self.new_leaf()).collect();
                let ret = self.new_leaf();
                let t = self.new_fun(BitsFun::of(fidx), &targs, ret);
                // The lambda itself watches its parameter variables so that
                // unifications re-run it (and through it, its callers).
                for &ta in &targs {
                    self.push_dep(ta, n);
                }
                let ptypes: SmallVec<[Flow; 3]> =
                    params.iter().map(|_| Flow::XScalar).collect();
                let pidents: Vec<Vec<NodeId>> = params.iter().map(|_| Vec::new()).collect();
                if let SynKind::Lambda {
                    fidx: f,
                    targs: t0,
                    ptypes: p0,
                    pidents: pi,
                    ..
                } = &mut self.prog.node_mut(n).kind
                {
                    *f = fidx;
                    *t0 = targs.clone();
                    *p0 = ptypes;
                    *pi = pidents;
                }
                self.prog.node_mut(n).hmt = t;
                let mut inner = nongen;
                for &ta in &targs {
                    inner = VStack::push(&inner, ta);
                }
                1 + self.prep_tree(body, Some(n), inner)
            }

            SynKind::Let { def, body, .. } => {
                let targ = self.new_leaf();
                if let SynKind::Let { targ: t0, .. } = &mut self.prog.node_mut(n).kind {
                    *t0 = targ;
                }
                let def_env = VStack::push(&nongen, targ);
                let szd = self.prep_tree(def, Some(n), def_env);
                let def_t = self.hmt_of(def);
                self.unify(targ, def_t, true);
                let szb = self.prep_tree(body, Some(n), nongen);
                self.prog.node_mut(n).hmt = self.hmt_of(body);
                1 + szd + szb
            }

            SynKind::Apply { fun, args } => {
                let mut sz = 1 + self.prep_tree(fun, Some(n), nongen.clone());
                for &a in &args {
                    sz += self.prep_tree(a, Some(n), nongen.clone());
                }
                // Record this apply on its callee set.
                if let SynKind::Lambda { applys, .. } | SynKind::Prim { applys, .. } =
                    &mut self.prog.node_mut(fun).kind
                {
                    applys.push(n);
                }
                let t = self.new_leaf();
                self.prog.node_mut(n).hmt = t;
                sz
            }

            SynKind::StructLit { fields, .. } => {
                let alias = match self.aliases.new_alias(1) {
                    Ok(a) => a,
                    Err(_) => 1,
                };
                if let SynKind::StructLit { alias: a0, .. } = &mut self.prog.node_mut(n).kind {
                    *a0 = alias;
                }
                let mut sz = 1;
                for (_, c) in &fields {
                    sz += self.prep_tree(*c, Some(n), nongen.clone());
                }
                let flds: Vec<(String, TvId)> = fields
                    .iter()
                    .map(|(k, c)| (k.clone(), self.hmt_of(*c)))
                    .collect();
                let t = self.new_struct(hmlang_core::bits::BitsAlias::of(alias), &flds, false);
                self.push_dep(t, n);
                self.prog.node_mut(n).hmt = t;
                sz
            }

            SynKind::Field { rec, .. } => {
                let sz = 1 + self.prep_tree(rec, Some(n), nongen);
                let t = self.new_leaf();
                self.prog.node_mut(n).hmt = t;
                self.field_nodes.push(n);
                sz
            }

            SynKind::Prim { prim, .. } => {
                let fidx = self.fidxs.new_fidx();
                self.fidx_map.insert(fidx, n);
                let (targs, ret) = self.prim_sig(prim);
                let t = self.new_fun(BitsFun::of(fidx), &targs, ret);
                for &ta in &targs {
                    self.push_dep(ta, n);
                }
                let ptypes: SmallVec<[Flow; 3]> =
                    targs.iter().map(|_| Flow::XScalar).collect();
                if let SynKind::Prim {
                    fidx: f,
                    targs: t0,
                    ptypes: p0,
                    ..
                } = &mut self.prog.node_mut(n).kind
                {
                    *f = fidx;
                    *t0 = targs.clone();
                    *p0 = ptypes;
                }
                self.prog.node_mut(n).hmt = t;
                1
            }

            SynKind::Root { body } => {
                let sz = 1 + self.prep_tree(body, Some(n), nongen);
                let t = self.new_leaf();
                self.prog.node_mut(n).hmt = t;
                sz
            }
        }
    }

    // -----------------------------------------------------------------------
    // hm
    // -----------------------------------------------------------------------

    /// One HM step for node `n`. With `work` false, reports whether
    /// unification would make progress without mutating; with `work` true,
    /// performs it.
    pub(crate) fn hm(&mut self, n: NodeId, work: bool) -> bool {
        let kind = self.prog.node(n).kind.clone();
        let hmt = self.hmt_of(n);
        match kind {
            SynKind::Con { .. } => false,

            SynKind::Ident { bind, .. } => match bind {
                Binding::Param { lambda, idx } => {
                    let targ = match &self.prog.node(lambda).kind {
                        SynKind::Lambda { targs, .. } => targs[idx],
                        _ => return false,
                    };
                    let r = self.find(targ);
                    self.push_dep(r, n);
                    self.unify(targ, hmt, work)
                }
                Binding::LetBound { let_id, poly } => {
                    let targ = match &self.prog.node(let_id).kind {
                        SynKind::Let { targ, .. } => *targ,
                        _ => return false,
                    };
                    let r = self.find(targ);
                    if poly {
                        // Growth anywhere inside the binder's type must
                        // re-instantiate this use.
                        self.push_dep_rec(r, n);
                        let nongen = self.prog.node(n).nongen.clone();
                        self.fresh_unify(targ, hmt, &nongen, work)
                    } else {
                        self.push_dep(r, n);
                        self.unify(targ, hmt, work)
                    }
                }
                Binding::Unresolved => false,
            },

            SynKind::Lambda { body, targs, .. } => {
                let t = self.find(hmt);
                let mut progress = false;
                for (i, &ta) in targs.iter().enumerate() {
                    if let Some(slot) = self.tv_arg(t, &arg_label(i)) {
                        progress |= self.unify(slot, ta, work);
                    }
                }
                let t = self.find(hmt);
                if let Some(ret) = self.tv_arg(t, ARG_RET) {
                    let bt = self.hmt_of(body);
                    progress |= self.unify(ret, bt, work);
                }
                progress
            }

            SynKind::Let { .. } => false,

            SynKind::Apply { fun, args } => {
                let ft = self.hmt_of(fun);
                let f = self.find(ft);
                self.push_dep(f, n);
                if !self.tv_is_fun(f) {
                    if !work {
                        return true;
                    }
                    let arg_ts: SmallVec<[TvId; 3]> =
                        args.iter().map(|&a| self.hmt_of(a)).collect();
                    let want = self.new_fun(BitsFun::empty(), &arg_ts, hmt);
                    self.unify(ft, want, true)
                } else {
                    let mut progress = false;
                    let nparams = self.tv_nparams(f);
                    if nparams != args.len() {
                        progress |= self.set_err(
                            f,
                            &format!("Bad argument count: wanted {nparams}, got {}", args.len()),
                            work,
                        );
                    }
                    for (i, &a) in args.iter().enumerate().take(nparams) {
                        let f = self.find(ft);
                        if let Some(slot) = self.tv_arg(f, &arg_label(i)) {
                            let at = self.hmt_of(a);
                            progress |= self.unify(slot, at, work);
                        }
                    }
                    let f = self.find(ft);
                    if let Some(ret) = self.tv_arg(f, ARG_RET) {
                        progress |= self.unify(ret, hmt, work);
                    }
                    progress
                }
            }

            SynKind::StructLit { fields, .. } => {
                let mut progress = false;
                for (lbl, c) in &fields {
                    let t = self.find(hmt);
                    let ct = self.hmt_of(*c);
                    match self.tv_arg(t, lbl) {
                        Some(slot) => progress |= self.unify(slot, ct, work),
                        None => {
                            if !work {
                                return true;
                            }
                            self.add_fld(t, lbl, ct);
                            progress = true;
                        }
                    }
                }
                // Fields unified in from elsewhere that this literal does not
                // provide are errors.
                let t = self.find(hmt);
                let extra: Vec<String> = self
                    .tv_arg_keys(t)
                    .into_iter()
                    .filter(|k| !fields.iter().any(|(l, _)| l == k))
                    .collect();
                for k in extra {
                    progress |= self.set_err(t, &format!("Missing field {k}"), work);
                }
                progress
            }

            SynKind::Field { label, rec } => {
                let rt = self.hmt_of(rec);
                let r = self.find(rt);
                self.push_dep(r, n);
                if self.tv_is_struct(r) {
                    let mut progress = false;
                    if self.tv_has_nil(r) {
                        progress |= self.set_err(
                            hmt,
                            &format!("May be nil when loading field {label}"),
                            work,
                        );
                    }
                    match self.tv_arg(r, &label) {
                        Some(fld) => progress |= self.unify(fld, hmt, work),
                        None => {
                            if self.tv_is_open(r) {
                                if !work {
                                    return true;
                                }
                                self.add_fld(r, &label, hmt);
                                progress = true;
                            } else {
                                progress |=
                                    self.set_err(hmt, &format!("Missing field {label}"), work);
                            }
                        }
                    }
                    progress
                } else if self.tv_is_nilable(r) {
                    // Loading through a maybe-nil pointer: record the error
                    // but keep the field flowing through the inner type.
                    // The inner is a leaf here (find() folds everything
                    // else), so demanding the field always progresses.
                    let mut progress = self.set_err(
                        hmt,
                        &format!("May be nil when loading field {label}"),
                        work,
                    );
                    if let Some(inner) = self.tv_arg(r, crate::tvar::ARG_NIL) {
                        if !work {
                            return true;
                        }
                        let want = self.new_struct_open_for(&label, hmt);
                        progress |= self.unify(inner, want, true);
                    }
                    progress
                } else if self.tv_is_leaf(r) {
                    if !work {
                        return true;
                    }
                    let want = self.new_struct_open_for(&label, hmt);
                    self.unify(rt, want, true)
                } else {
                    self.set_err(hmt, &format!("Missing field {label}"), work)
                }
            }

            SynKind::Prim { prim, ptypes, .. } => match prim {
                Prim::If => {
                    let t = self.find(hmt);
                    let (arm1, arm2, ret) = match (
                        self.tv_arg(t, &arg_label(1)),
                        self.tv_arg(t, &arg_label(2)),
                        self.tv_arg(t, ARG_RET),
                    ) {
                        (Some(a), Some(b), Some(r)) => (a, b, r),
                        _ => return false,
                    };
                    let pred = ptypes[0].clone();
                    if pred.must_nil() {
                        // Known false: only the else arm feeds the result.
                        self.unify(arm2, ret, work)
                    } else if pred.above_center() {
                        false
                    } else if !pred.may_nil() {
                        self.unify(arm1, ret, work)
                    } else {
                        let p1 = self.unify(arm1, ret, work);
                        let p2 = self.unify(arm2, ret, work);
                        p1 | p2
                    }
                }
                _ => false,
            },

            SynKind::Root { body } => {
                let bt = self.hmt_of(body);
                self.unify(hmt, bt, work)
            }
        }
    }

    // -----------------------------------------------------------------------
    // val
    // -----------------------------------------------------------------------

    /// Recompute the flow for node `n` from its children. Never touches the
    /// node's own stored flow; the driver installs the result. With `work`
    /// false, side channels (callee parameter meets, memory stores) are left
    /// untouched.
    pub(crate) fn val(&mut self, n: NodeId, work: bool) -> Flow {
        let kind = self.prog.node(n).kind.clone();
        match kind {
            SynKind::Con { val } => val,

            SynKind::Ident { bind, .. } => match bind {
                Binding::Param { lambda, idx } => match &self.prog.node(lambda).kind {
                    SynKind::Lambda { ptypes, .. } => ptypes[idx].clone(),
                    _ => Flow::Scalar,
                },
                Binding::LetBound { let_id, .. } => match &self.prog.node(let_id).kind {
                    SynKind::Let { def, .. } => self.flow_of(*def),
                    _ => Flow::Scalar,
                },
                Binding::Unresolved => Flow::Scalar,
            },

            SynKind::Lambda {
                params, body, fidx, ..
            } => Flow::FunPtr(Tfp {
                above: false,
                fidxs: BitsFun::of(fidx),
                nargs: params.len() as u8,
                ret: Box::new(self.flow_of(body)),
            }),

            SynKind::Let { body, .. } => self.flow_of(body),

            SynKind::Apply { fun, args } => self.apply_val(n, fun, &args, work),

            SynKind::StructLit { alias, fields } => {
                let mut obj = hmlang_core::flow::Obj::default();
                for (k, c) in &fields {
                    obj.fields.insert(k.clone(), self.flow_of(*c));
                }
                let objf = Flow::Obj(obj);
                if work {
                    self.mem_store(alias, &objf);
                }
                Flow::MemPtr(hmlang_core::flow::Tmp {
                    above: false,
                    aliases: hmlang_core::bits::BitsAlias::of(alias),
                    obj: Box::new(objf),
                })
            }

            SynKind::Field { label, rec } => {
                let r = self.flow_of(rec);
                if r.above_center() {
                    return Flow::XScalar;
                }
                match r.as_mem() {
                    Some(t) => {
                        let obj = self.mem.ld(&t.aliases, &self.aliases);
                        let v = match obj {
                            Flow::Obj(ref o) => o.field(&label),
                            other => other,
                        };
                        let v = scalarize(v);
                        if t.aliases.test(0) {
                            v.meet_nil()
                        } else {
                            v
                        }
                    }
                    None => Flow::Scalar,
                }
            }

            SynKind::Prim {
                prim,
                fidx,
                targs,
                ..
            } => {
                let ret = self.prim_apply(n, prim, work);
                Flow::FunPtr(Tfp {
                    above: false,
                    fidxs: BitsFun::of(fidx),
                    nargs: targs.len() as u8,
                    ret: Box::new(ret),
                })
            }

            SynKind::Root { body } => {
                let ret = self.flow_of(body);
                let out = self.hmt_of(body);
                let out = self.find(out);
                self.lift(n, &[body], out, ret, work)
            }
        }
    }

    /// Apply's flow: meet actuals into every callee, combine the callee
    /// returns, then lift the result through the HM type.
    fn apply_val(&mut self, n: NodeId, fun: NodeId, args: &[NodeId], work: bool) -> Flow {
        let f = self.flow_of(fun);
        let tfp = match f.as_fun() {
            Some(t) => t.clone(),
            None => {
                return if f.above_center() {
                    Flow::XScalar
                } else {
                    Flow::Scalar
                }
            }
        };
        if tfp.above {
            return Flow::XScalar;
        }
        if tfp.fidxs.test(1) {
            // "All functions": nothing precise can be said.
            return Flow::Scalar;
        }
        let mut ret = Flow::Any;
        for fidx in tfp.fidxs.iter().filter(|&i| i > 1) {
            let callee = match self.fidx_map.get(&fidx) {
                Some(&c) => c,
                None => continue,
            };
            if work {
                // Callees discovered through the flow register their caller.
                if let SynKind::Lambda { applys, .. } | SynKind::Prim { applys, .. } =
                    &mut self.prog.node_mut(callee).kind
                {
                    if !applys.contains(&n) {
                        applys.push(n);
                    }
                }
            }
            for (i, &a) in args.iter().enumerate() {
                let af = self.flow_of(a);
                self.arg_meet(callee, i, &af, work);
            }
            let cret = match self.prog.node(callee).kind.clone() {
                SynKind::Lambda { body, .. } => self.flow_of(body),
                SynKind::Prim { prim, .. } => self.prim_apply(callee, prim, work),
                _ => Flow::Scalar,
            };
            ret = ret.meet(&cret);
        }
        let out = self.hmt_of(n);
        let out = self.find(out);
        self.lift(n, args, out, ret, work)
    }

    /// Meets `flow` into callee parameter `i`. Returns whether the slot
    /// would change; mutates and schedules only when `work`.
    pub(crate) fn arg_meet(&mut self, callee: NodeId, i: usize, flow: &Flow, work: bool) -> bool {
        let old = match &self.prog.node(callee).kind {
            SynKind::Lambda { ptypes, .. } | SynKind::Prim { ptypes, .. } => {
                match ptypes.get(i) {
                    Some(p) => p.clone(),
                    None => return false,
                }
            }
            _ => return false,
        };
        let new = old.meet(flow);
        if new == old {
            return false;
        }
        if !work {
            return true;
        }
        let mut to_push: Vec<NodeId> = vec![callee];
        match &mut self.prog.node_mut(callee).kind {
            SynKind::Lambda {
                ptypes, pidents, ..
            } => {
                ptypes[i] = new;
                to_push.extend(pidents[i].iter().copied());
            }
            SynKind::Prim { ptypes, applys, .. } => {
                ptypes[i] = new;
                // Primitive transfers read parameter flows directly, so
                // every caller is stale the moment a slot falls.
                to_push.extend(applys.iter().copied());
            }
            _ => {}
        }
        for p in to_push {
            self.work.push(p);
        }
        true
    }

    /// Monotone store into session memory; every field load is stale when a
    /// slot changes.
    pub(crate) fn mem_store(&mut self, alias: u32, obj: &Flow) {
        match self.mem.st(alias, obj, &self.aliases) {
            Ok(true) => {
                let fields = self.field_nodes.clone();
                for f in fields {
                    self.work.push(f);
                }
            }
            Ok(false) => {}
            Err(_) => debug_assert!(false, "store to unallocated alias {alias}"),
        }
    }

    /// Would re-running this apply lower any callee parameter? Used by the
    /// fixed-point audit only.
    pub(crate) fn apply_would_meet(&mut self, n: NodeId) -> bool {
        let (fun, args) = match &self.prog.node(n).kind {
            SynKind::Apply { fun, args } => (*fun, args.clone()),
            _ => return false,
        };
        let f = self.flow_of(fun);
        let tfp = match f.as_fun() {
            Some(t) => t.clone(),
            None => return false,
        };
        if tfp.above || tfp.fidxs.test(1) {
            return false;
        }
        for fidx in tfp.fidxs.iter().filter(|&i| i > 1) {
            if let Some(&callee) = self.fidx_map.get(&fidx) {
                for (i, &a) in args.iter().enumerate() {
                    let af = self.flow_of(a);
                    if self.arg_meet(callee, i, &af, false) {
                        return true;
                    }
                }
            }
        }
        false
    }
}

/// Clamp a loaded field value into the scalar band.
fn scalarize(v: Flow) -> Flow {
    match v {
        Flow::Any => Flow::XScalar,
        Flow::All | Flow::Obj(_) => Flow::Scalar,
        other => other,
    }
}
