//! Static single assignment form
//!
//! Built on top of a finished [`ControlFlowGraph`](crate::cfg::ControlFlowGraph):
//! dominance first, then phi placement and renaming, then promotions where
//! merged definitions disagree on their declared types.

pub mod builder;
pub mod dominance;
pub mod form;
pub mod promote;

pub use builder::{build_ssa, Liveness};
pub use dominance::DominanceTree;
pub use form::{BindState, Def, DefKind, SsaEvent, SsaFunction, SsaStats, Use, UseSite};
pub use promote::{insert_promotions, PromotionReport};
