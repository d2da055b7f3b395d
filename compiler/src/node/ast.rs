//! Built-in statement and expression kinds
//!
//! These are the kinds the CFG builder and the SSA passes understand. Other
//! kinds may be registered next to them; they pass through as opaque
//! expressions whose children are still scanned for variable reads.

use super::arena::{FieldValue, NodeArena};
use super::schema::{FieldType, KindSchema};
use crate::context::CompilationContext;
use crate::error::{CoreError, CoreResult};
use crate::ids::NodeId;
use crate::types::Type;

pub const FUNCTION: &str = "Function";
pub const PARAM: &str = "Param";
pub const ASSIGN: &str = "Assign";
pub const EXPR_STMT: &str = "ExprStmt";
pub const IF: &str = "If";
pub const WHILE: &str = "While";
pub const FOR: &str = "For";
pub const TRY: &str = "Try";
pub const HANDLER: &str = "Handler";
pub const BREAK: &str = "Break";
pub const CONTINUE: &str = "Continue";
pub const RETURN: &str = "Return";
pub const RAISE: &str = "Raise";
pub const NAME: &str = "Name";
pub const CONST: &str = "Const";
pub const CALL: &str = "Call";
pub const BIN_OP: &str = "BinOp";
pub const CAST: &str = "Cast";

/// Hidden attribute carrying a declared type on `Param` and `Assign`
pub const DECLARED_TYPE: &str = "declared_type";
/// Hidden attribute marking a `For` loop as parallel
pub const PARALLEL: &str = "parallel";
/// Hidden on `Function`: declared result type
pub const RETURN_TYPE: &str = "return_type";
/// Hidden on `Function`: declared parameter types, in order
pub const SIGNATURE: &str = "signature";

/// Schemas of every built-in kind, in registration order
pub fn builtin_kinds() -> Vec<KindSchema> {
    let stmts = || FieldType::list(FieldType::node());
    vec![
        KindSchema::identity(FUNCTION)
            .field("name", FieldType::Str)
            .field("params", FieldType::list(FieldType::node_of(PARAM)))
            .field("body", stmts())
            .hidden(RETURN_TYPE, FieldType::Type)
            .hidden(SIGNATURE, FieldType::list(FieldType::Type)),
        KindSchema::identity(PARAM)
            .field("name", FieldType::Str)
            .hidden(DECLARED_TYPE, FieldType::Type),
        KindSchema::identity(ASSIGN)
            .field("target", FieldType::node_of(NAME))
            .field("value", FieldType::node())
            .hidden(DECLARED_TYPE, FieldType::Type),
        KindSchema::identity(EXPR_STMT).field("value", FieldType::node()),
        KindSchema::identity(IF)
            .field("test", FieldType::node())
            .field("body", stmts())
            .field("orelse", stmts()),
        KindSchema::identity(WHILE)
            .field("test", FieldType::node())
            .field("body", stmts()),
        KindSchema::identity(FOR)
            .field("target", FieldType::node_of(NAME))
            .field("start", FieldType::node())
            .field("stop", FieldType::node())
            .field("step", FieldType::optional(FieldType::node()))
            .field("body", stmts())
            .hidden(PARALLEL, FieldType::Bool),
        KindSchema::identity(TRY)
            .field("body", stmts())
            .field("handlers", FieldType::list(FieldType::node_of(HANDLER))),
        KindSchema::identity(HANDLER).field("body", stmts()),
        KindSchema::identity(BREAK),
        KindSchema::identity(CONTINUE),
        KindSchema::identity(RETURN).field("value", FieldType::optional(FieldType::node())),
        KindSchema::identity(RAISE).field("value", FieldType::optional(FieldType::node())),
        KindSchema::identity(NAME).field("id", FieldType::Str),
        KindSchema::value(CONST)
            .field("ty", FieldType::Type)
            .field("text", FieldType::Str),
        KindSchema::identity(CALL)
            .field("func", FieldType::Str)
            .field("args", FieldType::list(FieldType::node())),
        KindSchema::value(BIN_OP)
            .field("op", FieldType::Str)
            .field("left", FieldType::node())
            .field("right", FieldType::node()),
        KindSchema::value(CAST)
            .field("value", FieldType::node())
            .field("ty", FieldType::Type),
    ]
}

/// Typed view of a function node
#[derive(Debug, Clone)]
pub struct FunctionView<'a> {
    pub node: NodeId,
    pub name: &'a str,
    pub params: Vec<ParamView<'a>>,
    pub body: Vec<NodeId>,
    pub return_type: Option<&'a Type>,
    /// Declared parameter types, when the function carries a signature
    pub signature: Option<Vec<&'a Type>>,
}

#[derive(Debug, Clone)]
pub struct ParamView<'a> {
    pub node: NodeId,
    pub name: &'a str,
    pub declared_type: Option<&'a Type>,
}

/// Typed view of a statement node
#[derive(Debug, Clone)]
pub enum Stmt<'a> {
    Assign {
        target: NodeId,
        name: &'a str,
        value: NodeId,
        declared_type: Option<&'a Type>,
    },
    Expr {
        value: NodeId,
    },
    If {
        test: NodeId,
        body: Vec<NodeId>,
        orelse: Vec<NodeId>,
    },
    While {
        test: NodeId,
        body: Vec<NodeId>,
    },
    For {
        target: NodeId,
        name: &'a str,
        start: NodeId,
        stop: NodeId,
        step: Option<NodeId>,
        body: Vec<NodeId>,
        parallel: bool,
    },
    Try {
        body: Vec<NodeId>,
        handlers: Vec<NodeId>,
    },
    Break,
    Continue,
    Return {
        value: Option<NodeId>,
    },
    Raise {
        value: Option<NodeId>,
    },
}

/// Typed view of an expression node
#[derive(Debug, Clone)]
pub enum Expr<'a> {
    Name { name: &'a str },
    Const { ty: &'a Type },
    Call { func: &'a str, args: Vec<NodeId> },
    BinOp { op: &'a str, left: NodeId, right: NodeId },
    Cast { value: NodeId, ty: &'a Type },
    /// A registered kind the middle tier has no rule for
    Other { kind: &'a str },
}

fn str_field<'a>(arena: &'a NodeArena, id: NodeId, name: &str) -> CoreResult<&'a str> {
    let kind = arena.kind_name(id).unwrap_or("<unknown>");
    arena
        .field(id, name)?
        .as_str()
        .ok_or_else(|| CoreError::schema(kind, format!("field `{}` is not a string", name)))
}

fn node_field(arena: &NodeArena, id: NodeId, name: &str) -> CoreResult<NodeId> {
    let kind = arena.kind_name(id).unwrap_or("<unknown>");
    arena
        .field(id, name)?
        .as_node()
        .ok_or_else(|| CoreError::schema(kind, format!("field `{}` is not a node", name)))
}

fn optional_node_field(arena: &NodeArena, id: NodeId, name: &str) -> CoreResult<Option<NodeId>> {
    Ok(arena.field(id, name)?.as_node())
}

fn list_field(arena: &NodeArena, id: NodeId, name: &str) -> CoreResult<Vec<NodeId>> {
    let mut out = Vec::new();
    arena.field(id, name)?.node_refs(&mut out);
    Ok(out)
}

fn type_field<'a>(arena: &'a NodeArena, id: NodeId, name: &str) -> CoreResult<&'a Type> {
    let kind = arena.kind_name(id).unwrap_or("<unknown>");
    arena
        .field(id, name)?
        .as_type()
        .ok_or_else(|| CoreError::schema(kind, format!("field `{}` is not a type", name)))
}

fn type_attr(arena: &NodeArena, id: NodeId, name: &str) -> Option<Type> {
    arena.get(id)?.attr(name)?.as_type().cloned()
}

fn type_attr_ref<'a>(arena: &'a NodeArena, id: NodeId, name: &str) -> Option<&'a Type> {
    arena.get(id)?.attr(name)?.as_type()
}

fn expect_kind<'a>(arena: &'a NodeArena, id: NodeId) -> CoreResult<&'a str> {
    arena
        .kind_name(id)
        .ok_or_else(|| CoreError::schema("<unknown>", format!("no node with id {}", id)))
}

pub fn function<'a>(arena: &'a NodeArena, id: NodeId) -> CoreResult<FunctionView<'a>> {
    let kind = expect_kind(arena, id)?;
    if kind != FUNCTION {
        return Err(CoreError::schema(kind, "expected a Function node"));
    }
    let params = list_field(arena, id, "params")?
        .into_iter()
        .map(|param| {
            Ok(ParamView {
                node: param,
                name: str_field(arena, param, "name")?,
                declared_type: type_attr_ref(arena, param, DECLARED_TYPE),
            })
        })
        .collect::<CoreResult<Vec<_>>>()?;

    Ok(FunctionView {
        node: id,
        name: str_field(arena, id, "name")?,
        params,
        body: list_field(arena, id, "body")?,
        return_type: type_attr_ref(arena, id, RETURN_TYPE),
        signature: arena.get(id).and_then(|n| n.attr(SIGNATURE)).map(|value| match value {
            FieldValue::List(items) => items.iter().filter_map(FieldValue::as_type).collect(),
            _ => Vec::new(),
        }),
    })
}

pub fn stmt<'a>(arena: &'a NodeArena, id: NodeId) -> CoreResult<Stmt<'a>> {
    let kind = expect_kind(arena, id)?;
    let stmt = match kind {
        ASSIGN => {
            let target = node_field(arena, id, "target")?;
            Stmt::Assign {
                target,
                name: str_field(arena, target, "id")?,
                value: node_field(arena, id, "value")?,
                declared_type: type_attr_ref(arena, id, DECLARED_TYPE),
            }
        }
        EXPR_STMT => Stmt::Expr {
            value: node_field(arena, id, "value")?,
        },
        IF => Stmt::If {
            test: node_field(arena, id, "test")?,
            body: list_field(arena, id, "body")?,
            orelse: list_field(arena, id, "orelse")?,
        },
        WHILE => Stmt::While {
            test: node_field(arena, id, "test")?,
            body: list_field(arena, id, "body")?,
        },
        FOR => {
            let target = node_field(arena, id, "target")?;
            Stmt::For {
                target,
                name: str_field(arena, target, "id")?,
                start: node_field(arena, id, "start")?,
                stop: node_field(arena, id, "stop")?,
                step: optional_node_field(arena, id, "step")?,
                body: list_field(arena, id, "body")?,
                parallel: arena
                    .get(id)
                    .and_then(|n| n.attr(PARALLEL))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            }
        }
        TRY => Stmt::Try {
            body: list_field(arena, id, "body")?,
            handlers: list_field(arena, id, "handlers")?,
        },
        BREAK => Stmt::Break,
        CONTINUE => Stmt::Continue,
        RETURN => Stmt::Return {
            value: optional_node_field(arena, id, "value")?,
        },
        RAISE => Stmt::Raise {
            value: optional_node_field(arena, id, "value")?,
        },
        other => return Err(CoreError::schema(other, "not a statement kind")),
    };
    Ok(stmt)
}

pub fn expr<'a>(arena: &'a NodeArena, id: NodeId) -> CoreResult<Expr<'a>> {
    let kind = expect_kind(arena, id)?;
    let expr = match kind {
        NAME => Expr::Name {
            name: str_field(arena, id, "id")?,
        },
        CONST => Expr::Const {
            ty: type_field(arena, id, "ty")?,
        },
        CALL => Expr::Call {
            func: str_field(arena, id, "func")?,
            args: list_field(arena, id, "args")?,
        },
        BIN_OP => Expr::BinOp {
            op: str_field(arena, id, "op")?,
            left: node_field(arena, id, "left")?,
            right: node_field(arena, id, "right")?,
        },
        CAST => Expr::Cast {
            value: node_field(arena, id, "value")?,
            ty: type_field(arena, id, "ty")?,
        },
        other => Expr::Other { kind: other },
    };
    Ok(expr)
}

/// Handler body statements
pub fn handler_body(arena: &NodeArena, id: NodeId) -> CoreResult<Vec<NodeId>> {
    list_field(arena, id, "body")
}

/// Type of a literal, if `id` is a `Const`
pub fn literal_type(arena: &NodeArena, id: NodeId) -> Option<Type> {
    match expr(arena, id).ok()? {
        Expr::Const { ty } => Some(ty.clone()),
        _ => None,
    }
}

/// Declared type attached to a `Param` or `Assign`
pub fn declared_type(arena: &NodeArena, id: NodeId) -> Option<Type> {
    type_attr(arena, id, DECLARED_TYPE)
}

/// Convenience constructor for the built-in kinds
pub struct AstBuilder<'a> {
    arena: &'a mut NodeArena,
    ctx: &'a CompilationContext,
}

impl<'a> AstBuilder<'a> {
    pub fn new(arena: &'a mut NodeArena, ctx: &'a CompilationContext) -> Self {
        Self { arena, ctx }
    }

    pub fn arena(&mut self) -> &mut NodeArena {
        &mut *self.arena
    }

    fn make(&mut self, kind: &str, fields: Vec<FieldValue>) -> CoreResult<NodeId> {
        self.arena.create_node(self.ctx, kind, fields)
    }

    fn nodes(ids: &[NodeId]) -> FieldValue {
        FieldValue::List(ids.iter().map(|id| FieldValue::Node(*id)).collect())
    }

    fn optional(id: Option<NodeId>) -> FieldValue {
        id.map(FieldValue::Node).unwrap_or(FieldValue::Absent)
    }

    pub fn name(&mut self, id: &str) -> CoreResult<NodeId> {
        self.make(NAME, vec![FieldValue::Str(id.to_string())])
    }

    pub fn constant(&mut self, ty: Type, text: &str) -> CoreResult<NodeId> {
        self.make(CONST, vec![FieldValue::Type(ty), FieldValue::Str(text.to_string())])
    }

    pub fn int(&mut self, value: i64) -> CoreResult<NodeId> {
        self.constant(Type::INT64, &value.to_string())
    }

    pub fn float(&mut self, value: f64) -> CoreResult<NodeId> {
        self.constant(Type::FLOAT64, &value.to_string())
    }

    pub fn binop(&mut self, op: &str, left: NodeId, right: NodeId) -> CoreResult<NodeId> {
        self.make(
            BIN_OP,
            vec![
                FieldValue::Str(op.to_string()),
                FieldValue::Node(left),
                FieldValue::Node(right),
            ],
        )
    }

    pub fn call(&mut self, func: &str, args: &[NodeId]) -> CoreResult<NodeId> {
        self.make(CALL, vec![FieldValue::Str(func.to_string()), Self::nodes(args)])
    }

    pub fn cast(&mut self, value: NodeId, ty: Type) -> CoreResult<NodeId> {
        self.make(CAST, vec![FieldValue::Node(value), FieldValue::Type(ty)])
    }

    pub fn assign(&mut self, target: &str, value: NodeId) -> CoreResult<NodeId> {
        let target = self.name(target)?;
        self.make(ASSIGN, vec![FieldValue::Node(target), FieldValue::Node(value)])
    }

    pub fn assign_typed(&mut self, target: &str, value: NodeId, ty: Type) -> CoreResult<NodeId> {
        let stmt = self.assign(target, value)?;
        self.arena.set_attr(stmt, DECLARED_TYPE, FieldValue::Type(ty))?;
        Ok(stmt)
    }

    pub fn expr_stmt(&mut self, value: NodeId) -> CoreResult<NodeId> {
        self.make(EXPR_STMT, vec![FieldValue::Node(value)])
    }

    pub fn if_(&mut self, test: NodeId, body: &[NodeId], orelse: &[NodeId]) -> CoreResult<NodeId> {
        self.make(
            IF,
            vec![FieldValue::Node(test), Self::nodes(body), Self::nodes(orelse)],
        )
    }

    pub fn while_(&mut self, test: NodeId, body: &[NodeId]) -> CoreResult<NodeId> {
        self.make(WHILE, vec![FieldValue::Node(test), Self::nodes(body)])
    }

    pub fn for_range(
        &mut self,
        target: &str,
        start: NodeId,
        stop: NodeId,
        step: Option<NodeId>,
        body: &[NodeId],
    ) -> CoreResult<NodeId> {
        let target = self.name(target)?;
        self.make(
            FOR,
            vec![
                FieldValue::Node(target),
                FieldValue::Node(start),
                FieldValue::Node(stop),
                Self::optional(step),
                Self::nodes(body),
            ],
        )
    }

    pub fn declare_signature(&mut self, function: NodeId, params: &[Type]) -> CoreResult<()> {
        let types = params.iter().cloned().map(FieldValue::Type).collect();
        self.arena.set_attr(function, SIGNATURE, FieldValue::List(types))
    }

    pub fn declare_return(&mut self, function: NodeId, ty: Type) -> CoreResult<()> {
        self.arena.set_attr(function, RETURN_TYPE, FieldValue::Type(ty))
    }

    pub fn mark_parallel(&mut self, for_loop: NodeId) -> CoreResult<()> {
        self.arena.set_attr(for_loop, PARALLEL, FieldValue::Bool(true))
    }

    pub fn handler(&mut self, body: &[NodeId]) -> CoreResult<NodeId> {
        self.make(HANDLER, vec![Self::nodes(body)])
    }

    pub fn try_(&mut self, body: &[NodeId], handlers: &[NodeId]) -> CoreResult<NodeId> {
        self.make(TRY, vec![Self::nodes(body), Self::nodes(handlers)])
    }

    pub fn brk(&mut self) -> CoreResult<NodeId> {
        self.make(BREAK, vec![])
    }

    pub fn cont(&mut self) -> CoreResult<NodeId> {
        self.make(CONTINUE, vec![])
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> CoreResult<NodeId> {
        self.make(RETURN, vec![Self::optional(value)])
    }

    pub fn raise(&mut self, value: Option<NodeId>) -> CoreResult<NodeId> {
        self.make(RAISE, vec![Self::optional(value)])
    }

    pub fn param(&mut self, name: &str, declared: Option<Type>) -> CoreResult<NodeId> {
        let param = self.make(PARAM, vec![FieldValue::Str(name.to_string())])?;
        if let Some(ty) = declared {
            self.arena.set_attr(param, DECLARED_TYPE, FieldValue::Type(ty))?;
        }
        Ok(param)
    }

    pub fn function(&mut self, name: &str, params: &[NodeId], body: &[NodeId]) -> CoreResult<NodeId> {
        self.make(
            FUNCTION,
            vec![
                FieldValue::Str(name.to_string()),
                Self::nodes(params),
                Self::nodes(body),
            ],
        )
    }
}
