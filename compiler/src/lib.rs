//! Typed SSA middle tier
//!
//! Lowers schema-described function nodes into a control flow graph, puts the
//! graph into SSA form, and assigns every definition a type by solving a
//! dependency graph one strongly connected component at a time.
//!
//! The usual entry point is [`Pipeline`]:
//!
//! ```ignore
//! let ctx = CompilationContext::default();
//! let report = Pipeline::new(&ctx).compile(&arena, &functions_in(&arena));
//! for function in report.typed_functions() {
//!     println!("{}", function);
//! }
//! ```

pub mod callgraph;
pub mod cfg;
pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod ir;
pub mod logging;
pub mod node;
pub mod pipeline;
pub mod ssa;
pub mod typegraph;
pub mod types;
pub mod unbound;
pub mod validators;

pub use callgraph::CallGraph;
pub use cfg::{CfgBuilder, ControlFlowGraph};
pub use config::{CompilerConfig, UnboundPolicy};
pub use context::CompilationContext;
pub use error::{CoreError, CoreResult};
pub use ir::{DefType, IrTable, TypedFunction};
pub use node::{AstBuilder, NodeArena, SchemaRegistry};
pub use pipeline::{compile, compile_strict, functions_in, Pipeline, ProgramReport};
pub use types::{Type, TypeLattice};
