//! Core identifier types for the middle tier
//!
//! Nodes, blocks, definitions, uses and type-graph nodes are all named by
//! lightweight `u32` wrappers so that a `DefId` can never be handed to an API
//! expecting a `BlockId`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

/// Trait for ID types that can be created and validated
pub trait IdType: Copy + Clone + PartialEq + Eq + std::hash::Hash + fmt::Debug + Ord {
    /// Create a new ID from a raw u32 value
    fn from_raw(raw: u32) -> Self;

    /// Get the raw u32 value of this ID
    fn as_raw(self) -> u32;

    /// Check if this ID is valid (not a sentinel value)
    fn is_valid(self) -> bool;

    /// Get an invalid/null sentinel value
    fn invalid() -> Self;

    /// Position of this id when used to index a dense table
    fn index(self) -> usize {
        self.as_raw() as usize
    }
}

macro_rules! define_id_type {
    (
        $(#[$meta:meta])*
        $name:ident, $prefix:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub const fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> u32 {
                self.0
            }

            pub const fn is_valid(self) -> bool {
                self.0 != u32::MAX
            }

            pub const fn invalid() -> Self {
                Self(u32::MAX)
            }

            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl IdType for $name {
            fn from_raw(raw: u32) -> Self {
                Self::from_raw(raw)
            }

            fn as_raw(self) -> u32 {
                self.as_raw()
            }

            fn is_valid(self) -> bool {
                self.is_valid()
            }

            fn invalid() -> Self {
                Self::invalid()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::invalid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "{}{}", $prefix, self.0)
                } else {
                    write!(f, "{}<invalid>", $prefix)
                }
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self::from_raw(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(id: $name) -> u32 {
                id.as_raw()
            }
        }
    };
}

define_id_type! {
    /// Identifier of a node in the [`NodeArena`](crate::node::NodeArena).
    ///
    /// Allocated from the compilation context so ids stay unique across every
    /// arena built or imported during one compilation.
    NodeId, "n"
}

define_id_type! {
    /// Index into the kind table of a [`SchemaRegistry`](crate::node::SchemaRegistry).
    KindId, "k"
}

define_id_type! {
    /// Basic block within one function's control flow graph
    BlockId, "bb"
}

define_id_type! {
    /// SSA definition (parameter, assignment, phi, promotion or undefined marker)
    DefId, "d"
}

define_id_type! {
    /// SSA use; every use points at exactly one definition
    UseId, "u"
}

define_id_type! {
    /// Node of the type dependency graph
    TypeNodeId, "t"
}

define_id_type! {
    /// Strongly connected component of the type dependency graph
    SccId, "scc"
}

/// Generator for creating unique IDs of a specific type
///
/// Thread-safe so that per-function construction can allocate node ids from
/// worker threads.
#[derive(Debug)]
pub struct IdGenerator<T: IdType> {
    next_id: AtomicU32,
    _phantom: PhantomData<T>,
}

impl<T: IdType> IdGenerator<T> {
    pub const fn new() -> Self {
        Self::with_start(0)
    }

    pub const fn with_start(start_id: u32) -> Self {
        Self {
            next_id: AtomicU32::new(start_id),
            _phantom: PhantomData,
        }
    }

    /// Generate the next unique ID
    ///
    /// Panics if we run out of valid IDs (u32::MAX is reserved as the sentinel).
    pub fn next(&self) -> T {
        let raw_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if raw_id == u32::MAX {
            panic!(
                "ID generator overflow: exhausted all valid IDs for {}",
                std::any::type_name::<T>()
            );
        }
        T::from_raw(raw_id)
    }

    /// Peek at the next ID that would be generated without consuming it
    pub fn peek_next(&self) -> T {
        T::from_raw(self.next_id.load(Ordering::Relaxed))
    }

    /// Number of IDs generated so far
    pub fn count(&self) -> u32 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Make sure no future allocation can collide with `id`.
    ///
    /// Used after importing a table whose ids were allocated elsewhere.
    pub fn advance_past(&self, id: T) {
        if id.is_valid() {
            self.next_id
                .fetch_max(id.as_raw().saturating_add(1), Ordering::Relaxed);
        }
    }
}

impl<T: IdType> Default for IdGenerator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash collections keyed by ids
pub mod collections {
    use fxhash::{FxHashMap, FxHashSet};

    pub type IdMap<K, V> = FxHashMap<K, V>;
    pub type IdSet<T> = FxHashSet<T>;

    pub fn new_id_map<K, V>() -> IdMap<K, V> {
        IdMap::default()
    }

    pub fn new_id_set<T>() -> IdSet<T> {
        IdSet::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(BlockId::from_raw(3).to_string(), "bb3");
        assert_eq!(DefId::invalid().to_string(), "d<invalid>");
        assert!(!UseId::default().is_valid());
    }

    #[test]
    fn test_generator_sequence() {
        let generator: IdGenerator<NodeId> = IdGenerator::new();
        assert_eq!(generator.next(), NodeId::from_raw(0));
        assert_eq!(generator.next(), NodeId::from_raw(1));
        assert_eq!(generator.peek_next(), NodeId::from_raw(2));
        assert_eq!(generator.count(), 2);
    }

    #[test]
    fn test_advance_past_only_moves_forward() {
        let generator: IdGenerator<NodeId> = IdGenerator::with_start(10);
        generator.advance_past(NodeId::from_raw(4));
        assert_eq!(generator.peek_next(), NodeId::from_raw(10));
        generator.advance_past(NodeId::from_raw(20));
        assert_eq!(generator.next(), NodeId::from_raw(21));
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&DefId::from_raw(7)).unwrap();
        assert_eq!(json, "7");
        let back: DefId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DefId::from_raw(7));
    }
}
