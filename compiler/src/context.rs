//! Shared state for one compilation
//!
//! The context owns everything that outlives a single function: the node id
//! allocator, the validated configuration with the lattice built from it, and
//! the signature cache shared by all functions. It is `Sync`, so one context
//! serves every worker during parallel construction.

use crate::config::CompilerConfig;
use crate::error::CoreResult;
use crate::ids::{IdGenerator, NodeId};
use crate::types::{Type, TypeLattice};
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Namespace of a cached signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureScope {
    /// A function of the compiled program
    Local,
    /// An application of the rule set with this id
    Rules(u64),
}

/// A callee specialized to concrete argument types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub scope: SignatureScope,
    pub callee: String,
    pub args: Vec<Type>,
}

impl Signature {
    pub fn local(callee: impl Into<String>, args: Vec<Type>) -> Self {
        Self {
            scope: SignatureScope::Local,
            callee: callee.into(),
            args,
        }
    }

    pub fn rule(rule_set: u64, callee: impl Into<String>, args: Vec<Type>) -> Self {
        Self {
            scope: SignatureScope::Rules(rule_set),
            callee: callee.into(),
            args,
        }
    }
}

type Slot = Arc<Mutex<Option<Type>>>;

/// Memoized result types keyed by signature
///
/// Each signature gets its own slot lock, so two workers resolving the same
/// signature serialize on that slot only. Rule slots are written at most
/// once; local slots hold the latest compilation's result.
#[derive(Debug, Default)]
pub struct SignatureCache {
    entries: RwLock<FxHashMap<Signature, Slot>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signature: &Signature) -> Option<Type> {
        let entries = self.entries.read();
        entries.get(signature).and_then(|slot| slot.lock().clone())
    }

    fn slot(&self, signature: &Signature) -> Slot {
        {
            let entries = self.entries.read();
            if let Some(slot) = entries.get(signature) {
                return Arc::clone(slot);
            }
        }
        let mut entries = self.entries.write();
        Arc::clone(entries.entry(signature.clone()).or_default())
    }

    /// Return the cached type, or run `compute` under the slot lock and store
    /// its result. Failures are not cached.
    pub fn get_or_try_insert_with<E>(
        &self,
        signature: &Signature,
        compute: impl FnOnce() -> Result<Type, E>,
    ) -> Result<Type, E> {
        let slot = self.slot(signature);
        let mut guard = slot.lock();
        if let Some(ty) = guard.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(ty.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let ty = compute()?;
        *guard = Some(ty.clone());
        Ok(ty)
    }

    /// Store `ty`, returning what the slot held before
    pub fn record(&self, signature: &Signature, ty: Type) -> Option<Type> {
        let slot = self.slot(signature);
        let previous = slot.lock().replace(ty);
        previous
    }

    /// Number of signatures with a stored result
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|slot| slot.lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug)]
pub struct CompilationContext {
    config: CompilerConfig,
    lattice: TypeLattice,
    node_ids: IdGenerator<NodeId>,
    signatures: SignatureCache,
}

impl CompilationContext {
    pub fn new(config: CompilerConfig) -> CoreResult<Self> {
        config.validate()?;
        let lattice = TypeLattice::from_config(&config);
        Ok(Self {
            config,
            lattice,
            node_ids: IdGenerator::new(),
            signatures: SignatureCache::new(),
        })
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        Self::new(CompilerConfig::from_toml_str(content)?)
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn lattice(&self) -> &TypeLattice {
        &self.lattice
    }

    pub fn signatures(&self) -> &SignatureCache {
        &self.signatures
    }

    pub fn alloc_node_id(&self) -> NodeId {
        self.node_ids.next()
    }

    /// Keep future allocations clear of an imported id
    pub fn reserve_node_id(&self, id: NodeId) {
        self.node_ids.advance_past(id);
    }

    pub fn nodes_allocated(&self) -> u32 {
        self.node_ids.count()
    }
}

impl Default for CompilationContext {
    fn default() -> Self {
        Self {
            lattice: TypeLattice::numeric(),
            config: CompilerConfig::default(),
            node_ids: IdGenerator::new(),
            signatures: SignatureCache::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_cache_computes_once() {
        let cache = SignatureCache::new();
        let sig = Signature::rule(0, "f", vec![Type::INT32]);

        let first: Result<Type, ()> = cache.get_or_try_insert_with(&sig, || Ok(Type::INT64));
        let second: Result<Type, ()> =
            cache.get_or_try_insert_with(&sig, || panic!("should be cached"));

        assert_eq!(first, Ok(Type::INT64));
        assert_eq!(second, Ok(Type::INT64));
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_does_not_store_failures() {
        let cache = SignatureCache::new();
        let sig = Signature::rule(0, "g", vec![]);
        let failed: Result<Type, &str> = cache.get_or_try_insert_with(&sig, || Err("boom"));
        assert!(failed.is_err());
        assert!(cache.get(&sig).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_scopes_do_not_share_slots() {
        let cache = SignatureCache::new();
        let local = Signature::local("abs", vec![Type::INT32]);
        assert_eq!(cache.record(&local, Type::FLOAT64), None);

        let builtin = Signature::rule(7, "abs", vec![Type::INT32]);
        let ty: Result<Type, ()> = cache.get_or_try_insert_with(&builtin, || Ok(Type::INT32));
        assert_eq!(ty, Ok(Type::INT32));
        assert_eq!(cache.get(&Signature::rule(8, "abs", vec![Type::INT32])), None);

        assert_eq!(cache.record(&local, Type::INT64), Some(Type::FLOAT64));
        assert_eq!(cache.get(&local), Some(Type::INT64));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_under_contention() {
        let cache = SignatureCache::new();
        let computed = AtomicUsize::new(0);
        let sig = Signature::rule(0, "h", vec![Type::FLOAT64]);

        (0..64).into_par_iter().for_each(|_| {
            let ty: Result<Type, ()> = cache.get_or_try_insert_with(&sig, || {
                computed.fetch_add(1, Ordering::SeqCst);
                Ok(Type::FLOAT64)
            });
            assert_eq!(ty, Ok(Type::FLOAT64));
        });

        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_node_ids_are_unique_across_threads() {
        let ctx = CompilationContext::default();
        let mut ids: Vec<u32> = (0..256)
            .into_par_iter()
            .map(|_| ctx.alloc_node_id().as_raw())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 256);
    }
}
