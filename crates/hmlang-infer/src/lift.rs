//! The HM-to-GCP lift at call sites.
//!
//! After an apply meets its actuals into the callees and combines their
//! returns, the polymorphic structure of the callee lets the result be
//! tightened per call site: walk each actual's HM type and flow type in
//! parallel, recording what flows into every type variable; then walk the
//! result's HM type against the combined return and `join` the recorded
//! flows back in wherever the same variables appear.
//!
//! The walk descends through function returns (never parameters), through
//! nilable wrappers, and through shared struct fields; a fidx bitset guards
//! re-entry through recursive function returns. Repeat occurrences of a
//! variable combine with `join` before the freeze and `meet` after it.
//!
//! Lifting only ever tightens: `ret.isa(lifted)` holds for every produced
//! value, and successive lifts at one site fall monotonically. Both facts
//! are audited at runtime in debug builds.

use hmlang_core::bits::BitsFun;
use hmlang_core::flow::{Flow, Obj, Tfp, Tmp};

use crate::ast::NodeId;
use crate::driver::Infer;
use crate::tvar::{TvId, ARG_NIL, ARG_RET};

impl Infer {
    /// Lift `ret` through the HM structure at `out`, reading the actuals'
    /// variable-to-flow bindings first. `key` identifies the site for dep
    /// registration and the monotonicity audit.
    pub(crate) fn lift(
        &mut self,
        key: NodeId,
        actuals: &[NodeId],
        out: TvId,
        ret: Flow,
        work: bool,
    ) -> Flow {
        self.t2map.clear();
        self.wdups.clear();
        for &a in actuals {
            let at = self.hmt_of(a);
            if at == TvId::NONE {
                continue;
            }
            let at = self.find(at);
            let af = self.flow_of(a);
            self.walk_in(key, at, af);
        }
        self.wbs = BitsFun::empty();
        let lifted = self.walk_out(key, out, &ret);
        debug_assert!(
            ret.isa(&lifted),
            "lift must only tighten: {ret} -> {lifted}"
        );
        // Successive lifts must fall -- but only once the freeze pins the
        // HM shapes the walk follows, and only against the same result
        // representative.
        if work && self.freeze {
            if let Some((prev_rep, prev)) = self.lift_audit.get(&key) {
                debug_assert!(
                    *prev_rep != out || lifted.isa(prev),
                    "lift at node {key} must fall monotonically: {prev} -> {lifted}"
                );
            }
            self.lift_audit.insert(key, (out, lifted.clone()));
        }
        lifted
    }

    /// Input walk: record `variable -> flow` for every leaf and base
    /// reached by the parallel descent.
    fn walk_in(&mut self, key: NodeId, t: TvId, flow: Flow) {
        let t = self.find(t);
        if !self.wdups.insert((t, flow.clone())) {
            return;
        }
        // Re-lift this site when any walked node changes, structurally or
        // in its base channel.
        self.push_dep(t, key);
        if self.tv_is_leaf(t) || self.tv_is_base(t) {
            let comb = match self.t2map.get(&t) {
                None => flow,
                Some(prev) => {
                    if self.freeze {
                        prev.meet(&flow)
                    } else {
                        prev.join(&flow)
                    }
                }
            };
            self.t2map.insert(t, comb);
            return;
        }
        if self.tv_is_nilable(t) {
            if let Some(inner) = self.tv_arg(t, ARG_NIL) {
                self.walk_in(key, inner, flow.not_nil());
            }
            return;
        }
        if self.tv_is_fun(t) {
            // Descend through returns only; parameters face the wrong way.
            if let Some(tfp) = flow.as_fun() {
                let r = tfp.ret.as_ref().clone();
                if let Some(rt) = self.tv_arg(t, ARG_RET) {
                    self.walk_in(key, rt, r);
                }
            }
            return;
        }
        if self.tv_is_struct(t) {
            if let Some(tmp) = flow.as_mem() {
                let obj = tmp.obj.as_ref().clone();
                if let Flow::Obj(o) = obj {
                    for k in self.tv_arg_keys(t) {
                        let rep = self.find(t);
                        if let (Some(child), Some(fv)) =
                            (self.tv_arg(rep, &k), o.fields.get(&k))
                        {
                            self.walk_in(key, child, fv.clone());
                        }
                    }
                }
            }
        }
    }

    /// Output walk: rebuild `ret` component-wise against the HM result
    /// type, joining mapped variable flows in.
    fn walk_out(&mut self, key: NodeId, t: TvId, ret: &Flow) -> Flow {
        let t = self.find(t);
        self.push_dep(t, key);
        if self.tv_is_nilable(t) {
            let inner = match self.tv_arg(t, ARG_NIL) {
                Some(i) => i,
                None => return ret.clone(),
            };
            let lifted = self.walk_out(key, inner, &ret.not_nil());
            // Nil comes back only if the unlifted return could carry it.
            return if ret.may_nil() {
                lifted.meet_nil()
            } else {
                lifted
            };
        }
        if self.tv_is_base(t) {
            let mut x = ret.clone();
            if let Some(f) = self.tv(t).flow.clone() {
                x = x.join(&f);
            }
            if let Some(m) = self.t2map.get(&t) {
                x = x.join(&m.clone());
            }
            return x;
        }
        if self.tv_is_leaf(t) {
            return match self.t2map.get(&t) {
                Some(m) => ret.join(&m.clone()),
                None => ret.clone(),
            };
        }
        if self.tv_is_fun(t) {
            if let Some(tfp) = ret.as_fun() {
                let tfp = tfp.clone();
                if self.wbs.overlaps(&tfp.fidxs) {
                    return ret.clone();
                }
                self.wbs = self.wbs.meet(&tfp.fidxs);
                if let Some(rt) = self.tv_arg(t, ARG_RET) {
                    let r2 = self.walk_out(key, rt, tfp.ret.as_ref());
                    return Flow::FunPtr(Tfp {
                        above: tfp.above,
                        fidxs: tfp.fidxs,
                        nargs: tfp.nargs,
                        ret: Box::new(r2),
                    });
                }
            }
            return ret.clone();
        }
        if self.tv_is_struct(t) {
            if let Some(tmp) = ret.as_mem() {
                let tmp = tmp.clone();
                let robj = match tmp.obj.as_ref() {
                    Flow::Obj(o) => o.clone(),
                    other => Obj {
                        fields: Default::default(),
                        open: other.above_center(),
                    },
                };
                let mut out = Obj {
                    fields: Default::default(),
                    open: robj.open,
                };
                for k in self.tv_arg_keys(t) {
                    let rep = self.find(t);
                    let child = match self.tv_arg(rep, &k) {
                        Some(c) => c,
                        None => continue,
                    };
                    let base = robj.field(&k);
                    out.fields.insert(k.clone(), self.walk_out(key, child, &base));
                }
                let frozen = self.freeze;
                let rep = self.find(t);
                let t_open = self.tv_is_open(rep);
                for (k, v) in &robj.fields {
                    if out.fields.contains_key(k) {
                        continue;
                    }
                    if t_open && !frozen {
                        // The record is still growing: keep the flow's view
                        // of the field.
                        out.fields.insert(k.clone(), v.clone());
                    } else {
                        // The HM type says this field cannot exist; lifting
                        // it away tightens.
                        out.fields.insert(k.clone(), Flow::Any);
                    }
                }
                return Flow::MemPtr(Tmp {
                    above: tmp.above,
                    aliases: tmp.aliases,
                    obj: Box::new(Flow::Obj(out)),
                });
            }
            return ret.clone();
        }
        ret.clone()
    }
}
