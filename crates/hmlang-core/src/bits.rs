//! Function-index and alias-index bitsets.
//!
//! [`BitsFun`] names sets of lambdas (by fidx) and [`BitsAlias`] names sets of
//! pointer equivalence classes (by alias index). Both are small immutable
//! word-vector bitsets with stable hashing, so they can sit inside interned
//! flow types. Index allocation and the parent/child tree live in the
//! session-owned [`FidxTable`] and [`AliasTable`] -- the bitset values stay
//! pure so lattice operations never need table access.
//!
//! Reserved indices: bit 0 means "nil", bit 1 means "any function" (for
//! fidxs) or the universal struct parent (for aliases).

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::CoreError;

/// Marker for function-index bitsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FunKind;

/// Marker for alias-index bitsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AliasKind;

/// Set of function indices.
pub type BitsFun = Bits<FunKind>;

/// Set of alias indices.
pub type BitsAlias = Bits<AliasKind>;

/// A small immutable bitset over `u32` indices.
///
/// The word vector is kept canonical (no trailing zero words) so that
/// `PartialEq`/`Hash` are stable regardless of construction order. All
/// mutators return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Bits<K> {
    words: SmallVec<[u64; 2]>,
    #[serde(skip)]
    _kind: PhantomData<K>,
}

impl<K> Bits<K> {
    /// The empty set.
    pub fn empty() -> Self {
        Bits {
            words: SmallVec::new(),
            _kind: PhantomData,
        }
    }

    /// A one-element set.
    pub fn of(i: u32) -> Self {
        Bits::empty().set(i)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of set bits.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn test(&self, i: u32) -> bool {
        let (w, b) = (i as usize / 64, i as usize % 64);
        self.words.get(w).is_some_and(|word| word & (1 << b) != 0)
    }

    /// Returns a copy with bit `i` set.
    pub fn set(&self, i: u32) -> Self {
        let (w, b) = (i as usize / 64, i as usize % 64);
        let mut words = self.words.clone();
        if words.len() <= w {
            words.resize(w + 1, 0);
        }
        words[w] |= 1 << b;
        Bits {
            words,
            _kind: PhantomData,
        }
    }

    /// Returns a copy with bit `i` cleared.
    pub fn clear(&self, i: u32) -> Self {
        let (w, b) = (i as usize / 64, i as usize % 64);
        let mut words = self.words.clone();
        if let Some(word) = words.get_mut(w) {
            *word &= !(1 << b);
        }
        while words.last() == Some(&0) {
            words.pop();
        }
        Bits {
            words,
            _kind: PhantomData,
        }
    }

    /// Set union. This is the conservative (below-center) meet; the polarity
    /// of a set lives in the flow type that carries it.
    pub fn meet(&self, that: &Self) -> Self {
        let (long, short) = if self.words.len() >= that.words.len() {
            (&self.words, &that.words)
        } else {
            (&that.words, &self.words)
        };
        let mut words = long.clone();
        for (i, w) in short.iter().enumerate() {
            words[i] |= w;
        }
        Bits {
            words,
            _kind: PhantomData,
        }
    }

    /// Set intersection, used when two above-center sets meet.
    pub fn and(&self, that: &Self) -> Self {
        let n = self.words.len().min(that.words.len());
        let mut words: SmallVec<[u64; 2]> = SmallVec::with_capacity(n);
        for i in 0..n {
            words.push(self.words[i] & that.words[i]);
        }
        while words.last() == Some(&0) {
            words.pop();
        }
        Bits {
            words,
            _kind: PhantomData,
        }
    }

    pub fn overlaps(&self, that: &Self) -> bool {
        !self.and(that).is_empty()
    }

    /// Iterate the set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, w)| {
            (0..64u32).filter_map(move |b| {
                if w & (1u64 << b) != 0 {
                    Some(wi as u32 * 64 + b)
                } else {
                    None
                }
            })
        })
    }
}

impl<K> fmt::Display for Bits<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (n, i) in self.iter().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", i)?;
        }
        write!(f, "]")
    }
}

impl<K> FromIterator<u32> for Bits<K> {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        iter.into_iter().fold(Bits::empty(), |b, i| b.set(i))
    }
}

/// Allocator for function indices.
///
/// Index 0 is reserved for nil and index 1 for "any function"; fresh indices
/// start at 2. Function indices form a flat tree (every fidx is a child of
/// the universal index 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FidxTable {
    next: u32,
}

impl FidxTable {
    pub fn new() -> Self {
        FidxTable { next: 2 }
    }

    /// Allocates a fresh function index.
    pub fn new_fidx(&mut self) -> u32 {
        let f = self.next;
        self.next += 1;
        f
    }

    /// Number of allocated indices, including the two reserved slots.
    pub fn len(&self) -> u32 {
        self.next
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for FidxTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator for alias indices, carrying the parent tree.
///
/// Index 0 is reserved for nil and index 1 is the universal struct parent.
/// An alias may be split by allocating children under it; types that name
/// the parent are undisturbed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasTable {
    /// `parents[i]` is the parent of alias `i`; 0 means none.
    parents: Vec<u32>,
}

impl AliasTable {
    pub fn new() -> Self {
        AliasTable {
            parents: vec![0, 0],
        }
    }

    /// Allocates a fresh alias as a child of `parent`.
    pub fn new_alias(&mut self, parent: u32) -> Result<u32, CoreError> {
        if parent as usize >= self.parents.len() {
            return Err(CoreError::AliasNotFound { alias: parent });
        }
        let a = self.parents.len() as u32;
        self.parents.push(parent);
        Ok(a)
    }

    /// Parent of `alias`, or 0 for the roots.
    pub fn parent(&self, alias: u32) -> Result<u32, CoreError> {
        self.parents
            .get(alias as usize)
            .copied()
            .ok_or(CoreError::AliasNotFound { alias })
    }

    /// Number of allocated aliases, including the two reserved slots.
    pub fn len(&self) -> u32 {
        self.parents.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_test_clear_roundtrip() {
        let b = BitsFun::empty().set(2).set(5).set(70);
        assert!(b.test(2));
        assert!(b.test(5));
        assert!(b.test(70));
        assert!(!b.test(3));
        assert_eq!(b.len(), 3);

        let b2 = b.clear(70);
        assert!(!b2.test(70));
        assert_eq!(b2.len(), 2);
    }

    #[test]
    fn clear_trims_trailing_words() {
        let b = BitsFun::of(70).clear(70);
        // Canonical form equals the empty set, including the hash.
        assert_eq!(b, BitsFun::empty());
        assert!(b.is_empty());
    }

    #[test]
    fn meet_is_union() {
        let a = BitsAlias::of(2).set(4);
        let b = BitsAlias::of(4).set(7);
        let m = a.meet(&b);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![2, 4, 7]);
        // Commutative and idempotent.
        assert_eq!(m, b.meet(&a));
        assert_eq!(a.meet(&a), a);
    }

    #[test]
    fn and_is_intersection() {
        let a = BitsFun::of(2).set(4);
        let b = BitsFun::of(4).set(7);
        assert_eq!(a.and(&b), BitsFun::of(4));
        assert!(a.overlaps(&b));
        assert!(!BitsFun::of(2).overlaps(&BitsFun::of(3)));
    }

    #[test]
    fn iteration_order_is_ascending() {
        let b = BitsFun::of(65).set(1).set(33);
        assert_eq!(b.iter().collect::<Vec<_>>(), vec![1, 33, 65]);
    }

    #[test]
    fn display_lists_indices() {
        let b = BitsAlias::of(0).set(4);
        assert_eq!(format!("{}", b), "[0,4]");
    }

    #[test]
    fn fidx_table_allocates_from_two() {
        let mut t = FidxTable::new();
        assert_eq!(t.new_fidx(), 2);
        assert_eq!(t.new_fidx(), 3);
    }

    #[test]
    fn alias_table_tracks_parents() {
        let mut t = AliasTable::new();
        let a = t.new_alias(1).unwrap();
        let b = t.new_alias(a).unwrap();
        assert_eq!(a, 2);
        assert_eq!(b, 3);
        assert_eq!(t.parent(b).unwrap(), a);
        assert_eq!(t.parent(a).unwrap(), 1);
        assert_eq!(t.parent(1).unwrap(), 0);
        assert!(t.new_alias(99).is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let b = BitsFun::of(2).set(64);
        let json = serde_json::to_string(&b).unwrap();
        let back: BitsFun = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }
}
