//! Promotion insertion for phis whose incoming declared types disagree
//!
//! For a phi whose incoming defs all carry a declared type and those types
//! differ, the types are joined on the lattice. Every incoming slot whose type
//! is not the join gets a `Promotion` def in the predecessor block: the old
//! incoming use becomes the promotion's source and a fresh use of the
//! promotion fills the slot. The phi then carries the joined type, which may
//! in turn settle an enclosing phi, so passes repeat until nothing changes.

use super::form::{DefKind, SsaEvent, SsaFunction, UseSite};
use crate::error::CoreError;
use crate::ids::{DefId, UseId};
use crate::types::{JoinOutcome, Type, TypeLattice};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromotionReport {
    pub inserted: Vec<DefId>,
    /// Phis whose join used the configured fallback
    pub warnings: Vec<CoreError>,
    /// Phis left untyped because no join exists
    pub errors: Vec<CoreError>,
    pub passes: usize,
}

fn incoming_types(ssa: &SsaFunction, phi: DefId) -> Option<Vec<Type>> {
    ssa.incoming_of(phi)?
        .iter()
        .map(|u| ssa.definition_of(*u).and_then(|d| d.declared_type.clone()))
        .collect()
}

pub fn insert_promotions(ssa: &mut SsaFunction, lattice: &TypeLattice) -> PromotionReport {
    let mut report = PromotionReport::default();
    let mut failed: Vec<DefId> = Vec::new();

    loop {
        report.passes += 1;
        let pending: Vec<DefId> = ssa
            .phis()
            .filter(|p| p.declared_type.is_none() && !failed.contains(&p.id))
            .map(|p| p.id)
            .collect();

        let mut changed = false;
        for phi in pending {
            let Some(types) = incoming_types(ssa, phi) else {
                continue;
            };
            if types.is_empty() {
                continue;
            }

            let joined = match lattice.join_all(types.iter()) {
                Ok(Some(JoinOutcome::Joined(ty))) => ty,
                Ok(Some(JoinOutcome::Fallback { ty, error })) => {
                    log::warn!("`{}`: phi {} falls back to `{}`: {}", ssa.function, phi, ty, error);
                    report.warnings.push(error);
                    ty
                }
                Ok(None) => continue,
                Err(error) => {
                    log::debug!("`{}`: phi {} has no join: {}", ssa.function, phi, error);
                    report.errors.push(error);
                    failed.push(phi);
                    continue;
                }
            };

            let slots: Vec<UseId> = ssa.incoming_of(phi).map(|s| s.to_vec()).unwrap_or_default();
            for (index, (slot, ty)) in slots.iter().zip(&types).enumerate() {
                if *ty == joined {
                    continue;
                }
                if let Some(promotion) = promote_slot(ssa, phi, index, *slot, &joined) {
                    report.inserted.push(promotion);
                }
            }
            if let Some(def) = ssa.def_mut(phi) {
                def.declared_type = Some(joined);
            }
            changed = true;
        }

        if !changed {
            break;
        }
    }

    if !report.inserted.is_empty() {
        log::debug!(
            "`{}`: inserted {} promotion(s) in {} pass(es)",
            ssa.function,
            report.inserted.len(),
            report.passes
        );
    }
    report
}

fn promote_slot(
    ssa: &mut SsaFunction,
    phi: DefId,
    index: usize,
    slot: UseId,
    target: &Type,
) -> Option<DefId> {
    let old = ssa.use_(slot)?.clone();
    let predecessor = match old.site {
        UseSite::PhiIncoming { predecessor, .. } => predecessor,
        _ => return None,
    };

    let promotion = ssa.add_def(
        &old.variable,
        predecessor,
        DefKind::Promotion { source: slot, phi },
        Some(target.clone()),
    );
    if let Some(source) = ssa.use_mut(slot) {
        source.site = UseSite::Promotion { def: promotion };
    }
    // the conversion runs last in the predecessor, just before the edge
    ssa.record(predecessor, SsaEvent::Use(slot));
    ssa.record(predecessor, SsaEvent::Def(promotion));
    let fresh = ssa.add_use(
        &old.variable,
        predecessor,
        UseSite::PhiIncoming { phi, predecessor },
        promotion,
    );
    if let Some(DefKind::Phi { incoming }) = ssa.def_mut(phi).map(|d| &mut d.kind) {
        if let Some(entry) = incoming.get_mut(index) {
            *entry = fresh;
        }
    }
    Some(promotion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::CfgBuilder;
    use crate::context::CompilationContext;
    use crate::node::{AstBuilder, NodeArena};
    use crate::ssa::build_ssa;

    fn branchy(then_ty: Type, else_ty: Type) -> SsaFunction {
        let ctx = CompilationContext::default();
        let mut arena = NodeArena::with_builtin_kinds();
        let mut b = AstBuilder::new(&mut arena, &ctx);
        let c = b.param("c", Some(Type::Bool)).unwrap();
        let test = b.name("c").unwrap();
        let one = b.constant(then_ty, "1").unwrap();
        let two = b.constant(else_ty, "2").unwrap();
        let then = b.assign("x", one).unwrap();
        let orelse = b.assign("x", two).unwrap();
        let branch = b.if_(test, &[then], &[orelse]).unwrap();
        let x = b.name("x").unwrap();
        let ret = b.ret(Some(x)).unwrap();
        let f = b.function("f", &[c], &[branch, ret]).unwrap();

        let mut cfg = CfgBuilder::build(&arena, f).unwrap();
        let ssa = build_ssa(&arena, &mut cfg, f).unwrap();
        ssa.verify(&cfg).unwrap();
        ssa
    }

    #[test]
    fn test_int_float_merge_promotes_int_side() {
        let mut ssa = branchy(Type::INT32, Type::FLOAT64);
        let report = insert_promotions(&mut ssa, &TypeLattice::numeric());

        assert_eq!(report.inserted.len(), 1);
        assert!(report.errors.is_empty());
        let phi = ssa.phis().next().unwrap();
        assert_eq!(phi.declared_type, Some(Type::FLOAT64));

        let promotion = ssa.def(report.inserted[0]).unwrap();
        assert_eq!(promotion.declared_type, Some(Type::FLOAT64));
        let DefKind::Promotion { source, phi: owner } = promotion.kind else {
            panic!("not a promotion");
        };
        assert_eq!(owner, phi.id);
        assert_eq!(ssa.definition_of(source).unwrap().declared_type, Some(Type::INT32));
        // the phi's first slot now reads the promotion
        let first = ssa.incoming_of(phi.id).unwrap()[0];
        assert_eq!(ssa.definition_of(first).unwrap().id, promotion.id);
    }

    #[test]
    fn test_promotion_closes_its_predecessor_block() {
        let mut ssa = branchy(Type::INT32, Type::FLOAT64);
        let report = insert_promotions(&mut ssa, &TypeLattice::numeric());
        let promotion = ssa.def(report.inserted[0]).unwrap().clone();
        let DefKind::Promotion { source, .. } = promotion.kind else {
            panic!("not a promotion");
        };

        let events = ssa.events(promotion.block);
        assert_eq!(
            &events[events.len() - 2..],
            &[SsaEvent::Use(source), SsaEvent::Def(promotion.id)]
        );
        let recorded = ssa
            .block_events()
            .iter()
            .flat_map(|(_, events)| events.iter())
            .filter(|e| **e == SsaEvent::Def(promotion.id))
            .count();
        assert_eq!(recorded, 1);
    }

    #[test]
    fn test_equal_types_need_nothing() {
        let mut ssa = branchy(Type::INT64, Type::INT64);
        let report = insert_promotions(&mut ssa, &TypeLattice::numeric());
        assert!(report.inserted.is_empty());
        assert_eq!(ssa.phis().next().unwrap().declared_type, Some(Type::INT64));
    }

    #[test]
    fn test_opaque_merge_is_unification_error() {
        let mut ssa = branchy(Type::INT32, Type::opaque("handle"));
        let report = insert_promotions(&mut ssa, &TypeLattice::numeric());
        assert!(report.inserted.is_empty());
        assert!(matches!(report.errors[..], [CoreError::UnificationError { .. }]));
        assert_eq!(ssa.phis().next().unwrap().declared_type, None);
    }

    #[test]
    fn test_opaque_merge_with_fallback() {
        let mut ssa = branchy(Type::INT32, Type::opaque("handle"));
        let lattice = TypeLattice::numeric().with_fallback(Type::Dynamic);
        let report = insert_promotions(&mut ssa, &lattice);
        assert_eq!(report.inserted.len(), 2);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(ssa.phis().next().unwrap().declared_type, Some(Type::Dynamic));
    }
}
