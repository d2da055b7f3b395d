//! Reaching-definition analysis classifying variable reads as bound or unbound
//!
//! Forward dataflow over the CFG with two bits per variable: "some path
//! reaches here with the variable assigned" and "some path reaches here with
//! it unassigned". The entry block's `Undefined` defs set the second bit,
//! every real definition sets the first, and merges take the union. As in
//! SSA renaming, the state carried along an exception edge is the one at the
//! start of the raising block.

use crate::cfg::{ControlFlowGraph, EdgeKind};
use crate::config::UnboundPolicy;
use crate::error::CoreError;
use crate::ids::collections::{new_id_map, IdMap};
use crate::ids::{BlockId, DefId, UseId};
use crate::ssa::{BindState, DefKind, SsaEvent, SsaFunction, UseSite};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

const BOUND: u8 = 0b01;
const UNBOUND: u8 = 0b10;

type State = FxHashMap<String, u8>;

fn classify(bits: u8) -> BindState {
    match bits {
        UNBOUND => BindState::NeverBound,
        b if b & UNBOUND != 0 => BindState::MaybeUnbound,
        _ => BindState::AlwaysBound,
    }
}

/// A read that must see a poison value instead of uninitialized storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelRequirement {
    pub variable: String,
    pub use_id: UseId,
    pub block: BlockId,
    /// `Undefined` def that reaches the read
    pub undefined_def: Option<DefId>,
    pub state: BindState,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnboundReport {
    pub requirements: Vec<SentinelRequirement>,
    pub errors: Vec<CoreError>,
    pub warnings: Vec<CoreError>,
    pub always_bound: usize,
    pub maybe_unbound: usize,
    pub never_bound: usize,
}

impl UnboundReport {
    pub fn state_of(&self, use_id: UseId) -> Option<BindState> {
        self.requirements
            .iter()
            .find(|r| r.use_id == use_id)
            .map(|r| r.state)
    }
}

fn transfer(ssa: &SsaFunction, block: BlockId, state: &mut State, mut on_use: impl FnMut(UseId, u8)) {
    for event in ssa.events(block) {
        match *event {
            SsaEvent::Def(def) => {
                let Some(def) = ssa.def(def) else { continue };
                match def.kind {
                    DefKind::Phi { .. } | DefKind::Promotion { .. } => {}
                    DefKind::Undefined => {
                        state.insert(def.variable.clone(), UNBOUND);
                    }
                    _ => {
                        state.insert(def.variable.clone(), BOUND);
                    }
                }
            }
            SsaEvent::Use(use_id) => {
                if let Some(u) = ssa.use_(use_id) {
                    on_use(use_id, state.get(&u.variable).copied().unwrap_or(0));
                }
            }
        }
    }
}

fn is_exception_edge(cfg: &ControlFlowGraph, from: BlockId, to: BlockId) -> bool {
    cfg.successors(from)
        .iter()
        .any(|e| e.target == to && e.kind == EdgeKind::Exception)
}

/// Classify every use of `ssa` and record the result on the use
pub fn analyze(cfg: &ControlFlowGraph, ssa: &mut SsaFunction, policy: UnboundPolicy) -> UnboundReport {
    let _span = tracing::debug_span!("unbound", function = ssa.function.as_str()).entered();
    let order = cfg.reverse_postorder();
    let mut ins: IdMap<BlockId, State> = new_id_map();
    let mut outs: IdMap<BlockId, State> = new_id_map();

    let mut changed = true;
    while changed {
        changed = false;
        for &block in &order {
            let mut state = State::default();
            for &pred in cfg.predecessors(block) {
                let source = if is_exception_edge(cfg, pred, block) {
                    ins.get(&pred)
                } else {
                    outs.get(&pred)
                };
                for (name, bits) in source.into_iter().flatten() {
                    *state.entry(name.clone()).or_insert(0) |= *bits;
                }
            }
            let mut out = state.clone();
            transfer(ssa, block, &mut out, |_, _| {});

            if ins.get(&block) != Some(&state) {
                ins.insert(block, state);
                changed = true;
            }
            if outs.get(&block) != Some(&out) {
                outs.insert(block, out);
                changed = true;
            }
        }
    }

    let mut states: Vec<(UseId, BindState)> = Vec::new();
    for &block in &order {
        let mut state = ins.get(&block).cloned().unwrap_or_default();
        transfer(ssa, block, &mut state, |use_id, bits| {
            states.push((use_id, classify(bits)));
        });
    }

    // Phi and promotion operands are read on the edge out of their block
    for u in ssa.uses() {
        let (from, to) = match u.site {
            UseSite::PhiIncoming { phi, predecessor } => match ssa.def(phi) {
                Some(phi) => (predecessor, phi.block),
                None => continue,
            },
            UseSite::Promotion { def } => {
                let Some(promotion) = ssa.def(def) else { continue };
                let DefKind::Promotion { phi, .. } = promotion.kind else { continue };
                match ssa.def(phi) {
                    Some(phi) => (promotion.block, phi.block),
                    None => continue,
                }
            }
            _ => continue,
        };
        let source = if is_exception_edge(cfg, from, to) {
            ins.get(&from)
        } else {
            outs.get(&from)
        };
        let bits = source.and_then(|s| s.get(&u.variable)).copied().unwrap_or(0);
        states.push((u.id, classify(bits)));
    }

    let mut report = UnboundReport::default();
    let mut poisoned: Vec<String> = Vec::new();
    for (use_id, state) in states {
        let Some(u) = ssa.use_mut(use_id) else { continue };
        u.bind_state = Some(state);
        let direct = matches!(
            u.site,
            UseSite::Name(_) | UseSite::LoopTest { .. } | UseSite::LoopStep { .. }
        );
        if !direct {
            continue;
        }
        let (variable, block) = (u.variable.clone(), u.block);

        match state {
            BindState::AlwaysBound => {
                report.always_bound += 1;
                continue;
            }
            BindState::MaybeUnbound => report.maybe_unbound += 1,
            BindState::NeverBound => {
                report.never_bound += 1;
                let error = CoreError::UnboundVariable {
                    function: ssa.function.clone(),
                    variable: variable.clone(),
                    block,
                    use_id,
                };
                match policy {
                    UnboundPolicy::Error => {
                        report.errors.push(error);
                        continue;
                    }
                    UnboundPolicy::Poison => {
                        log::warn!("{}; reading poison instead", error);
                        report.warnings.push(error);
                    }
                }
            }
        }

        let undefined_def = ssa.undefined_def(&variable).map(|d| d.id);
        if !poisoned.contains(&variable) {
            poisoned.push(variable.clone());
        }
        report.requirements.push(SentinelRequirement {
            variable,
            use_id,
            block,
            undefined_def,
            state,
        });
    }

    for variable in poisoned {
        let id = ssa.undefined_def(&variable).map(|d| d.id);
        if let Some(def) = id.and_then(|id| ssa.def_mut(id)) {
            def.needs_poison = true;
        }
    }

    log::debug!(
        "`{}`: {} always-bound, {} maybe-unbound, {} never-bound read(s)",
        ssa.function,
        report.always_bound,
        report.maybe_unbound,
        report.never_bound
    );
    report
}
