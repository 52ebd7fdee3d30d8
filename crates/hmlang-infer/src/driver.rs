//! The inference session and its worklist driver.
//!
//! [`Infer`] owns everything the analysis mutates: the syntax arena, the
//! type-variable arena, the worklist, the alias/fidx tables, the session
//! memory, and the session-scoped scratch maps the graph algorithms use
//! (fields here rather than process globals, so sessions are independent).
//!
//! The passes run in program order:
//!
//! 1. pre-pass: `prep_tree`, binder links, seed the worklist;
//! 2. main loop, unfrozen: pop a node, run HM then GCP, push neighbors;
//! 3. root argument widening: escaping lambdas take the widest
//!    HM-compatible argument flows, then the main loop again;
//! 4. freeze: leaves stop growing, the lift switches join to meet, the
//!    main loop runs to the final fixed point;
//! 5. error finalization.
//!
//! The loop is deterministic; a seeded shuffle of the pop order exists only
//! so the confluence tests can vary scheduling.

use std::collections::{HashMap, HashSet, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::debug;

use hmlang_core::bits::{AliasTable, BitsFun, FidxTable};
use hmlang_core::flow::Flow;
use hmlang_core::mem::TypeMem;

use crate::ast::{NodeId, Prog, SynKind};
use crate::tvar::{TvId, Tvar, ARG_NIL, ARG_RET};

/// Analysis failures. Ordinary type errors are monotone graph state, not
/// `Err`s; these are the driver-level stops.
#[derive(Debug, Error)]
pub enum InferError {
    /// The main loop failed to reach a fixed point within the guard.
    #[error("no fixed point after {iters} iterations")]
    NoFixedPoint { iters: usize },
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct InferConfig {
    /// Iteration guard for each main-loop run.
    pub max_iters: usize,
    /// Run the HM half.
    pub do_hm: bool,
    /// Run the GCP half.
    pub do_gcp: bool,
    /// Randomize worklist pop order (confluence tests only).
    pub shuffle_seed: Option<u64>,
    /// Run the global would-progress audit after every iteration instead of
    /// only at each fixed point. Debug builds only; expensive.
    pub paranoid: bool,
}

impl Default for InferConfig {
    fn default() -> Self {
        InferConfig {
            max_iters: 10_000,
            do_hm: true,
            do_gcp: true,
            shuffle_seed: None,
            paranoid: false,
        }
    }
}

/// Deduplicating worklist of syntax nodes.
#[derive(Debug, Default)]
pub(crate) struct Work {
    q: VecDeque<NodeId>,
    on: HashSet<NodeId>,
}

impl Work {
    pub(crate) fn push(&mut self, n: NodeId) {
        if self.on.insert(n) {
            self.q.push_back(n);
        }
    }

    fn pop(&mut self, rng: &mut Option<ChaCha8Rng>) -> Option<NodeId> {
        if self.q.is_empty() {
            return None;
        }
        let idx = match rng {
            Some(r) => r.gen_range(0..self.q.len()),
            None => 0,
        };
        let n = self.q.remove(idx)?;
        self.on.remove(&n);
        Some(n)
    }

    pub(crate) fn contains(&self, n: NodeId) -> bool {
        self.on.contains(&n)
    }

    pub(crate) fn len(&self) -> usize {
        self.q.len()
    }
}

/// One combined HM + GCP inference session.
pub struct Infer {
    pub(crate) prog: Prog,
    pub(crate) tvs: Vec<Tvar>,
    pub(crate) work: Work,
    pub(crate) freeze: bool,
    pub(crate) cfg: InferConfig,
    pub(crate) fidxs: FidxTable,
    pub(crate) aliases: AliasTable,
    pub(crate) fidx_map: HashMap<u32, NodeId>,
    pub(crate) mem: TypeMem,
    /// Field loads, re-run whenever a memory store changes a slot.
    pub(crate) field_nodes: Vec<NodeId>,
    pub(crate) pair_alias: u32,
    pub(crate) triple_alias: u32,
    // Session-scoped scratch, cleared by each outermost user.
    pub(crate) dups: HashSet<(TvId, TvId)>,
    pub(crate) vars: HashMap<TvId, TvId>,
    pub(crate) odups: HashSet<TvId>,
    pub(crate) cdups: HashSet<(TvId, TvId)>,
    pub(crate) t2map: HashMap<TvId, Flow>,
    pub(crate) wdups: HashSet<(TvId, Flow)>,
    pub(crate) wbs: BitsFun,
    /// Last lifted result per site, keyed with the result representative so
    /// the monotonicity audit only compares like shapes.
    pub(crate) lift_audit: HashMap<NodeId, (TvId, Flow)>,
}

impl Infer {
    pub fn new(prog: Prog, cfg: InferConfig) -> Self {
        let mut aliases = AliasTable::new();
        let pair_alias = aliases.new_alias(1).unwrap();
        let triple_alias = aliases.new_alias(1).unwrap();
        Infer {
            prog,
            tvs: Vec::new(),
            work: Work::default(),
            freeze: false,
            cfg,
            fidxs: FidxTable::new(),
            aliases,
            fidx_map: HashMap::new(),
            mem: TypeMem::new(),
            field_nodes: Vec::new(),
            pair_alias,
            triple_alias,
            dups: HashSet::new(),
            vars: HashMap::new(),
            odups: HashSet::new(),
            cdups: HashSet::new(),
            t2map: HashMap::new(),
            wdups: HashSet::new(),
            wbs: BitsFun::empty(),
            lift_audit: HashMap::new(),
        }
    }

    /// Run every pass to the final fixed point.
    pub fn run(&mut self) -> Result<(), InferError> {
        let root = self.prog.root;
        let size = self.prep_tree(root, None, None);
        debug!(size, "pre-pass complete");
        self.seed_all();
        self.main_loop()?;

        debug!("root argument widening");
        self.widen_root_args();
        self.main_loop()?;

        debug!("freeze");
        self.freeze = true;
        self.seed_all();
        self.main_loop()?;

        self.errors_pass();
        debug!("analysis complete");
        Ok(())
    }

    fn seed_all(&mut self) {
        for i in 0..self.prog.len() {
            self.work.push(NodeId(i as u32));
        }
    }

    fn main_loop(&mut self) -> Result<(), InferError> {
        let mut rng = self.cfg.shuffle_seed.map(ChaCha8Rng::seed_from_u64);
        let mut cnt = 0usize;
        while let Some(n) = self.work.pop(&mut rng) {
            cnt += 1;
            if cnt > self.cfg.max_iters {
                return Err(InferError::NoFixedPoint { iters: cnt });
            }
            if self.cfg.do_hm && self.hm(n, true) {
                if let Some(p) = self.prog.node(n).par {
                    self.work.push(p);
                }
                self.work.push(n);
            }
            if self.cfg.do_gcp {
                let old = self.prog.node(n).flow.clone();
                let new = self.val(n, true);
                if new != old {
                    // Unlifted transfers fall; lifted sites (Apply, Root)
                    // may step up while the HM shape they lift through is
                    // still maturing, and anything downstream of one steps
                    // with them. Once frozen, the lift audit pins descent.
                    self.prog.node_mut(n).flow = new;
                    self.push_val_neighbors(n);
                }
            }
            if self.cfg.paranoid {
                self.fixpoint_audit();
            }
        }
        debug!(iters = cnt, "main loop drained");
        #[cfg(debug_assertions)]
        self.fixpoint_audit();
        Ok(())
    }

    /// Everyone whose `val` reads this node's flow.
    fn push_val_neighbors(&mut self, n: NodeId) {
        let mut to_push: Vec<NodeId> = Vec::new();
        if let Some(p) = self.prog.node(n).par {
            to_push.push(p);
            match &self.prog.node(p).kind {
                SynKind::Lambda { body, applys, .. } if *body == n => {
                    to_push.extend(applys.iter().copied());
                }
                SynKind::Let { def, idents, .. } if *def == n => {
                    to_push.extend(idents.iter().copied());
                }
                _ => {}
            }
        }
        if let SynKind::Lambda { applys, .. } | SynKind::Prim { applys, .. } =
            &self.prog.node(n).kind
        {
            to_push.extend(applys.iter().copied());
        }
        for p in to_push {
            self.work.push(p);
        }
    }

    /// Every node still able to make progress must be queued. Runs at each
    /// drained fixed point in debug builds (and per-iteration when
    /// `paranoid`).
    fn fixpoint_audit(&mut self) {
        if self.work.len() > 0 && !self.cfg.paranoid {
            return;
        }
        for i in 0..self.prog.len() {
            let n = NodeId(i as u32);
            if self.prog.node(n).hmt == TvId::NONE {
                continue;
            }
            let hmp = self.cfg.do_hm && self.hm(n, false);
            let gcp = self.cfg.do_gcp
                && (self.val(n, false) != self.prog.node(n).flow || self.apply_would_meet(n));
            debug_assert!(
                !(hmp || gcp) || self.work.contains(n),
                "node {n} can progress but is not queued"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Root boundary
    // -----------------------------------------------------------------------

    /// Model the unknown external caller: the universal memory default
    /// falls to the unknown object, and every root-reachable lambda takes
    /// the widest HM-compatible flow on each parameter.
    fn widen_root_args(&mut self) {
        let changed = self
            .mem
            .st(1, &Flow::obj_unknown(), &self.aliases)
            .unwrap_or(false);
        debug!(changed, "memory default widened");

        let mut seen: HashSet<u32> = HashSet::new();
        let mut stack = vec![self.flow_of(self.prog.root)];
        while let Some(f) = stack.pop() {
            match f {
                Flow::FunPtr(t) => {
                    stack.push((*t.ret).clone());
                    if t.fidxs.test(1) {
                        // "All functions": the widening is already total.
                        continue;
                    }
                    for fidx in t.fidxs.iter().filter(|&i| i > 1) {
                        if !seen.insert(fidx) {
                            continue;
                        }
                        let lam = match self.fidx_map.get(&fidx) {
                            Some(&l) => l,
                            None => continue,
                        };
                        let (targs, body) = match &self.prog.node(lam).kind {
                            SynKind::Lambda { targs, body, .. } => {
                                (targs.to_vec(), Some(*body))
                            }
                            SynKind::Prim { targs, .. } => (targs.to_vec(), None),
                            _ => continue,
                        };
                        for (i, &ta) in targs.iter().enumerate() {
                            let mut visited = HashSet::new();
                            let wide = self.as_flow(ta, &mut visited);
                            self.arg_meet(lam, i, &wide, true);
                        }
                        if let Some(b) = body {
                            // The callee's return escapes as well.
                            stack.push(self.flow_of(b));
                        }
                    }
                }
                Flow::MemPtr(t) => stack.push((*t.obj).clone()),
                Flow::Obj(o) => {
                    for v in o.fields.values() {
                        stack.push(v.clone());
                    }
                }
                _ => {}
            }
        }
        // The memory default moved; every field load may have moved with it.
        self.seed_all();
    }

    /// The widest flow compatible with an HM type: leaves scalar, bases
    /// widen to their class, structure maps through. Cyclic types cut off
    /// at their first re-entry.
    pub(crate) fn as_flow(&mut self, t: TvId, visited: &mut HashSet<TvId>) -> Flow {
        let t = self.find(t);
        if self.tv_is_err2(t) || self.tv(t).err.is_some() {
            return Flow::Scalar;
        }
        if self.tv_is_base(t) {
            return match self.tv(t).flow.clone() {
                Some(f) => f.widen(),
                None => Flow::Scalar,
            };
        }
        if self.tv_is_leaf(t) {
            return Flow::Scalar;
        }
        if !visited.insert(t) {
            return Flow::Scalar;
        }
        if self.tv_is_nilable(t) {
            let inner = match self.tv_arg(t, ARG_NIL) {
                Some(i) => i,
                None => return Flow::Scalar,
            };
            return self.as_flow(inner, visited).meet_nil();
        }
        if self.tv_is_fun(t) {
            let fidxs = self
                .tv(t)
                .fidxs
                .clone()
                .unwrap_or_else(|| BitsFun::of(1));
            let fidxs = if fidxs.iter().all(|i| i == 0) {
                fidxs.set(1)
            } else {
                fidxs
            };
            let nargs = self.tv_nparams(t) as u8;
            let ret = match self.tv_arg(t, ARG_RET) {
                Some(r) => self.as_flow(r, visited),
                None => Flow::Scalar,
            };
            return Flow::FunPtr(hmlang_core::flow::Tfp {
                above: false,
                fidxs,
                nargs,
                ret: Box::new(ret),
            });
        }
        if self.tv_is_struct(t) {
            let aliases = self
                .tv(t)
                .aliases
                .clone()
                .unwrap_or_default();
            let aliases = if aliases.iter().all(|i| i == 0) {
                aliases.set(1)
            } else {
                aliases
            };
            let mut obj = hmlang_core::flow::Obj::default();
            for k in self.tv_arg_keys(t) {
                let rep = self.find(t);
                if let Some(c) = self.tv_arg(rep, &k) {
                    let fv = self.as_flow(c, visited);
                    obj.fields.insert(k, fv);
                }
            }
            let nil = aliases.test(0);
            let out = Flow::MemPtr(hmlang_core::flow::Tmp {
                above: false,
                aliases,
                obj: Box::new(Flow::Obj(obj)),
            });
            return if nil { out.meet_nil() } else { out };
        }
        Flow::Scalar
    }

    // -----------------------------------------------------------------------
    // Error finalization
    // -----------------------------------------------------------------------

    /// Final visit: nil anywhere in an error pair propagates to both
    /// channels, and missing-field messages on open records pick up the
    /// record's print.
    fn errors_pass(&mut self) {
        for i in 0..self.tvs.len() {
            let t = TvId(i as u32);
            if self.tv(t).fwd.is_some() || self.tv(t).eflow.is_none() {
                continue;
            }
            let f = self.tv(t).flow.clone();
            let ef = self.tv(t).eflow.clone();
            let nil = f.as_ref().is_some_and(|x| x.may_nil())
                || ef.as_ref().is_some_and(|x| x.may_nil());
            if nil {
                let dst = self.tv_mut(t);
                dst.flow = f.map(|x| x.meet_nil());
                dst.eflow = ef.map(|x| x.meet_nil());
            }
        }
        for i in 0..self.prog.len() {
            let n = NodeId(i as u32);
            let (label, rec) = match &self.prog.node(n).kind {
                SynKind::Field { label, rec } => (label.clone(), *rec),
                _ => continue,
            };
            let ht = self.hmt_of(n);
            if ht == TvId::NONE {
                continue;
            }
            let ht = self.find(ht);
            let is_missing = self
                .tv(ht)
                .err
                .as_deref()
                .is_some_and(|e| e.starts_with("Missing field"));
            if !is_missing {
                continue;
            }
            let rt = self.hmt_of(rec);
            let rt = self.find(rt);
            if self.tv_is_struct(rt) && self.tv_is_open(rt) {
                let printed = self.scheme_of(rt);
                self.tv_mut(ht).err = Some(format!("Missing field {label} in {printed}"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// The root's printed HM scheme.
    pub fn root_hm(&mut self) -> String {
        let t = self.hmt_of(self.prog.root);
        self.scheme_of(t)
    }

    /// The root's raw flow type.
    pub fn root_flow(&self) -> Flow {
        self.prog.node(self.prog.root).flow.clone()
    }

    /// The root's flow signature: function pointers expand into
    /// `{ args -> ret }` once per fidx, cyclic expansion cut off at the
    /// first repeat.
    pub fn root_flow_sig(&mut self) -> String {
        let f = self.root_flow();
        let mut seen = BitsFun::empty();
        self.expand_sig(&f, &mut seen)
    }

    fn expand_sig(&mut self, f: &Flow, seen: &mut BitsFun) -> String {
        let tfp = match f.as_fun() {
            Some(t) if !t.above && !t.fidxs.test(1) => t.clone(),
            _ => return f.to_string(),
        };
        if seen.overlaps(&tfp.fidxs) {
            return f.to_string();
        }
        *seen = seen.meet(&tfp.fidxs);
        let fidxs: Vec<u32> = tfp.fidxs.iter().filter(|&i| i > 1).collect();
        let mut args = String::new();
        if let [only] = fidxs[..] {
            if let Some(&lam) = self.fidx_map.get(&only) {
                let ptypes: Vec<Flow> = match &self.prog.node(lam).kind {
                    SynKind::Lambda { ptypes, .. } | SynKind::Prim { ptypes, .. } => {
                        ptypes.to_vec()
                    }
                    _ => Vec::new(),
                };
                for p in ptypes {
                    args.push_str(&self.expand_sig(&p, seen));
                    args.push(' ');
                }
            }
        }
        let ret = self.expand_sig(tfp.ret.as_ref(), seen);
        let nil = if tfp.fidxs.test(0) { "?" } else { "" };
        format!("{{ {args}-> {ret} }}{nil}")
    }

    /// Collected analysis error messages, deduplicated, in stable order.
    pub fn errors(&mut self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for i in 0..self.tvs.len() {
            let t = TvId(i as u32);
            if self.tv(t).fwd.is_some() {
                continue;
            }
            let msg = if let Some(e) = self.tv(t).err.clone() {
                Some(e)
            } else if self.tv_is_err2(t) {
                Some(self.scheme_of(t))
            } else {
                None
            };
            if let Some(m) = msg {
                if !out.contains(&m) {
                    out.push(m);
                }
            }
        }
        out
    }
}
