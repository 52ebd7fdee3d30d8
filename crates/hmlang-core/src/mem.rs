//! The memory lattice: alias index to struct object.
//!
//! [`TypeMem`] maps every alias class to the object stored there. The alias
//! tree gives inheritance: a class with no stored object reads its nearest
//! stored ancestor, so splitting an alias into children never disturbs
//! readers of the parent. Canonical form:
//!
//! - slot 0 is reserved (nil points at nothing),
//! - slot 1 holds the universal default object,
//! - a child storing exactly its parent's effective object collapses to
//!   the parent (entry removed),
//! - trailing empty slots are trimmed.
//!
//! Stores meet into the slot, so memory only falls. Memory starts entirely
//! above center (the universal default is the open empty object); the root
//! boundary lowers slot 1 to the unknown object when the program escapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bits::{AliasTable, BitsAlias};
use crate::error::CoreError;
use crate::flow::Flow;

/// Alias-indexed memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMem {
    /// `objs[i]` is the object stored at alias `i`; `None` inherits.
    objs: Vec<Option<Flow>>,
}

impl TypeMem {
    /// Fresh memory: nothing stored anywhere, the universal default is the
    /// open empty object (everything still above center).
    pub fn new() -> Self {
        TypeMem {
            objs: vec![None, Some(Flow::obj_any())],
        }
    }

    /// Effective object at `alias`, walking the parent chain.
    pub fn at(&self, alias: u32, tbl: &AliasTable) -> Flow {
        let mut a = alias;
        loop {
            if let Some(Some(obj)) = self.objs.get(a as usize) {
                return obj.clone();
            }
            match tbl.parent(a) {
                Ok(0) | Err(_) => return Flow::obj_any(),
                Ok(p) => a = p,
            }
        }
    }

    /// Load through a pointer's alias set: the meet of every named object.
    /// An empty set (or only the nil bit) loads nothing and stays high.
    pub fn ld(&self, aliases: &BitsAlias, tbl: &AliasTable) -> Flow {
        let mut obj = Flow::Any;
        for a in aliases.iter().filter(|&a| a != 0) {
            obj = obj.meet(&self.at(a, tbl));
        }
        obj
    }

    /// Monotone store: meets `obj` into the slot at `alias`, then
    /// re-canonicalizes. Returns whether the slot changed. Slot 1 is
    /// storable (the root boundary lowers the universal default); slot 0
    /// is not.
    pub fn st(&mut self, alias: u32, obj: &Flow, tbl: &AliasTable) -> Result<bool, CoreError> {
        if alias == 0 {
            return Err(CoreError::ReservedSlot { alias });
        }
        if tbl.parent(alias).is_err() {
            return Err(CoreError::AliasNotFound { alias });
        }
        let old = self.at(alias, tbl);
        let new = old.meet(obj);
        if new == old && self.objs.get(alias as usize).is_some_and(|s| s.is_some()) {
            return Ok(false);
        }
        let changed = new != old;
        if self.objs.len() <= alias as usize {
            self.objs.resize(alias as usize + 1, None);
        }
        self.objs[alias as usize] = Some(new);
        self.canonicalize(tbl);
        Ok(changed)
    }

    /// Collapse duplicate parent/child entries and trim trailing empties.
    fn canonicalize(&mut self, tbl: &AliasTable) {
        for a in (2..self.objs.len() as u32).rev() {
            if let Some(obj) = self.objs[a as usize].clone() {
                let parent = tbl.parent(a).unwrap_or(0);
                if parent != 0 && self.at(parent, tbl) == obj {
                    self.objs[a as usize] = None;
                }
            }
        }
        while self.objs.len() > 2 && self.objs.last() == Some(&None) {
            self.objs.pop();
        }
    }
}

impl Default for TypeMem {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TypeMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for (a, slot) in self.objs.iter().enumerate() {
            if let Some(obj) = slot {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{}:{}", a, obj)?;
                first = false;
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Obj;
    use indexmap::IndexMap;

    fn obj(fields: &[(&str, Flow)], open: bool) -> Flow {
        let mut m = IndexMap::new();
        for (k, v) in fields {
            m.insert(k.to_string(), v.clone());
        }
        Flow::Obj(Obj { fields: m, open })
    }

    #[test]
    fn reserved_and_unknown_slots_reject_stores() {
        let tbl = AliasTable::new();
        let mut mem = TypeMem::new();
        assert!(mem.st(0, &Flow::obj_unknown(), &tbl).is_err());
        assert!(mem.st(9, &Flow::obj_unknown(), &tbl).is_err());
    }

    #[test]
    fn widening_the_default_lowers_inherited_loads() {
        let mut tbl = AliasTable::new();
        let a = tbl.new_alias(1).unwrap();
        let mut mem = TypeMem::new();
        // Before widening, an untouched alias reads above center.
        assert_eq!(mem.at(a, &tbl), Flow::obj_any());
        assert!(mem.st(1, &Flow::obj_unknown(), &tbl).unwrap());
        assert_eq!(mem.at(a, &tbl), Flow::obj_unknown());
    }

    #[test]
    fn store_then_load() {
        let mut tbl = AliasTable::new();
        let a = tbl.new_alias(1).unwrap();
        let mut mem = TypeMem::new();
        let o = obj(&[("x", Flow::int(3))], false);
        assert!(mem.st(a, &o, &tbl).unwrap());
        assert_eq!(mem.at(a, &tbl), o);
        assert_eq!(mem.ld(&BitsAlias::of(a), &tbl), o);
    }

    #[test]
    fn store_is_monotone_meet() {
        let mut tbl = AliasTable::new();
        let a = tbl.new_alias(1).unwrap();
        let mut mem = TypeMem::new();
        mem.st(a, &obj(&[("x", Flow::int(3))], false), &tbl).unwrap();
        mem.st(a, &obj(&[("x", Flow::int(4))], false), &tbl).unwrap();
        let got = mem.at(a, &tbl);
        let want = obj(&[("x", Flow::int(3).meet(&Flow::int(4)))], false);
        assert_eq!(got, want);
        // Re-storing the same object is not a change.
        assert!(!mem.st(a, &want, &tbl).unwrap());
    }

    #[test]
    fn child_inherits_parent() {
        let mut tbl = AliasTable::new();
        let p = tbl.new_alias(1).unwrap();
        let c = tbl.new_alias(p).unwrap();
        let mut mem = TypeMem::new();
        let o = obj(&[("y", Flow::str_con("s"))], false);
        mem.st(p, &o, &tbl).unwrap();
        assert_eq!(mem.at(c, &tbl), o);
    }

    #[test]
    fn duplicate_child_collapses_to_parent() {
        let mut tbl = AliasTable::new();
        let p = tbl.new_alias(1).unwrap();
        let c = tbl.new_alias(p).unwrap();
        let mut mem = TypeMem::new();
        let o = obj(&[("y", Flow::int(1))], false);
        mem.st(p, &o, &tbl).unwrap();
        mem.st(c, &o, &tbl).unwrap();
        // The child entry is gone but reads identically through the parent.
        assert_eq!(mem.at(c, &tbl), o);
        let mem2 = {
            let mut m = TypeMem::new();
            m.st(p, &o, &tbl).unwrap();
            m
        };
        assert_eq!(mem, mem2);
    }

    #[test]
    fn load_meets_over_alias_set() {
        let mut tbl = AliasTable::new();
        let a = tbl.new_alias(1).unwrap();
        let b = tbl.new_alias(1).unwrap();
        let mut mem = TypeMem::new();
        mem.st(a, &obj(&[("x", Flow::int(3))], false), &tbl).unwrap();
        mem.st(b, &obj(&[("x", Flow::int(5))], false), &tbl).unwrap();
        let got = mem.ld(&BitsAlias::of(a).set(b), &tbl);
        assert_eq!(got, obj(&[("x", Flow::int(3).meet(&Flow::int(5)))], false));
        // The nil bit contributes nothing to a load.
        assert_eq!(mem.ld(&BitsAlias::of(0), &tbl), Flow::Any);
    }
}
