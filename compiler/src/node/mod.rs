//! Node model: schemas, the arena, traversal and table import/export

pub mod arena;
pub mod ast;
pub mod schema;
pub mod table;
pub mod visit;

pub use arena::{FieldValue, Node, NodeArena};
pub use ast::AstBuilder;
pub use schema::{CompareMode, FieldSpec, FieldType, KindSchema, SchemaRegistry};
pub use table::{NodeRow, NodeTable};
pub use visit::{visit, KindDispatch, VisitAction, VisitOutcome};
