//! # Compiled Expression Tree
//!
//! Expressions embedded into physical stages: slot references, constants
//! (including opaque build-time handles such as text matchers and shard
//! filterers), primitive operators, builtin function calls, local
//! bindings, and the `fail` terminator that surfaces runtime errors.
//!
//! The builder only constructs these trees; evaluation belongs to the
//! execution runtime and is out of scope.

use crate::catalog::TextMatcher;
use crate::context::ShardFilterer;
use crate::slots::{FrameId, SlotId};
use crate::solution::SortPattern;
use crate::value::Val;
use std::fmt;
use std::sync::Arc;

/// Unary primitive operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation
    Not,
}

/// Binary primitive operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Logical and (short-circuit)
    And,
    /// Logical or (short-circuit)
    Or,
    /// Numeric addition
    Add,
    /// Equality
    Eq,
    /// Strictly less
    Less,
    /// Less or equal
    LessEq,
    /// Strictly greater
    Greater,
    /// Greater or equal
    GreaterEq,
    /// Three-way comparison (`-1`/`0`/`1`)
    Cmp3w,
    /// Left value unless it is `Nothing`, then right
    FillEmpty,
}

/// Builtin functions callable from compiled expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinFn {
    /// `getField(obj, name)` — field extraction, `Nothing` when absent
    GetField,
    /// `newObj(name1, v1, name2, v2, …)` — ordered object construction
    NewObj,
    /// `exists(v)` — true iff the argument is not `Nothing`
    Exists,
    /// `isObject(v)`
    IsObject,
    /// `isArray(v)`
    IsArray,
    /// `collComparisonKey(v, collator)` — collation-aware sort key
    CollComparisonKey,
    /// `generateSortKey(sortSpec, doc)` — full MQL sort-key semantics
    GenerateSortKey,
    /// `ftsMatch(matcher, doc)` — full-text match predicate
    FtsMatch,
    /// `shardFilter(filterer, shardKey)` — shard ownership predicate
    ShardFilter,
    /// `shardHash(v)` — hashed-shard-key component transform
    ShardHash,
}

impl BuiltinFn {
    /// Runtime name of the builtin
    pub fn name(self) -> &'static str {
        match self {
            BuiltinFn::GetField => "getField",
            BuiltinFn::NewObj => "newObj",
            BuiltinFn::Exists => "exists",
            BuiltinFn::IsObject => "isObject",
            BuiltinFn::IsArray => "isArray",
            BuiltinFn::CollComparisonKey => "collComparisonKey",
            BuiltinFn::GenerateSortKey => "generateSortKey",
            BuiltinFn::FtsMatch => "ftsMatch",
            BuiltinFn::ShardFilter => "shardFilter",
            BuiltinFn::ShardHash => "shardHash",
        }
    }
}

/// Opaque build-time constants embedded by translators. These are
/// pointers to engine objects, not documents; the runtime receives them
/// by handle.
#[derive(Debug, Clone)]
pub enum OpaqueConstant {
    /// Compiled full-text matcher
    TextMatcher(Arc<TextMatcher>),
    /// Shard ownership filterer
    ShardFilterer(Arc<dyn ShardFilterer>),
    /// Sort spec for `generateSortKey`
    SortSpec(Arc<SortPattern>),
}

impl PartialEq for OpaqueConstant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OpaqueConstant::TextMatcher(a), OpaqueConstant::TextMatcher(b)) => a == b,
            (OpaqueConstant::ShardFilterer(a), OpaqueConstant::ShardFilterer(b)) => {
                Arc::ptr_eq(a, b)
            }
            (OpaqueConstant::SortSpec(a), OpaqueConstant::SortSpec(b)) => a == b,
            _ => false,
        }
    }
}

/// A compiled expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value
    Constant(Val),
    /// Opaque engine-object constant
    Opaque(OpaqueConstant),
    /// Reference to a slot
    SlotVar(SlotId),
    /// Reference to a local binding (`frame`, position within frame)
    LocalVar {
        /// Owning frame
        frame: FrameId,
        /// Position within the frame's bindings
        index: usize,
    },
    /// Local bindings scoped to `body`
    Let {
        /// Fresh frame id for the bindings
        frame: FrameId,
        /// Bound expressions, addressed by position
        binds: Vec<Expr>,
        /// Expression evaluated with the bindings in scope
        body: Box<Expr>,
    },
    /// Conditional
    If {
        /// Condition
        cond: Box<Expr>,
        /// Value when true
        then_branch: Box<Expr>,
        /// Value when false
        else_branch: Box<Expr>,
    },
    /// Unary primitive
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Binary primitive
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// Builtin function call
    Function {
        /// Callee
        function: BuiltinFn,
        /// Arguments
        args: Vec<Expr>,
    },
    /// Abort evaluation with a user-visible error
    Fail {
        /// Error code surfaced to the user
        code: u32,
        /// Error message
        message: String,
    },
}

impl Expr {
    /// Literal constant
    pub fn constant(val: Val) -> Expr {
        Expr::Constant(val)
    }

    /// Slot reference
    pub fn slot(slot: SlotId) -> Expr {
        Expr::SlotVar(slot)
    }

    /// `Nothing` constant
    pub fn nothing() -> Expr {
        Expr::Constant(Val::Nothing)
    }

    /// `Null` constant
    pub fn null() -> Expr {
        Expr::Constant(Val::Null)
    }

    /// String constant
    pub fn string(s: impl Into<String>) -> Expr {
        Expr::Constant(Val::String(s.into()))
    }
}

/// Builtin function call
pub fn make_function(function: BuiltinFn, args: Vec<Expr>) -> Expr {
    Expr::Function { function, args }
}

/// Unary negation
pub fn make_not(operand: Expr) -> Expr {
    Expr::Unary {
        op: UnaryOp::Not,
        operand: Box::new(operand),
    }
}

/// Binary primitive
pub fn make_binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// Conditional
pub fn make_if(cond: Expr, then_branch: Expr, else_branch: Expr) -> Expr {
    Expr::If {
        cond: Box::new(cond),
        then_branch: Box::new(then_branch),
        else_branch: Box::new(else_branch),
    }
}

/// `fillEmpty(expr, null)` — missing becomes null, per MQL field access
pub fn make_fill_empty_null(expr: Expr) -> Expr {
    make_binary(BinaryOp::FillEmpty, expr, Expr::null())
}

/// `fillEmpty(expr, undefined)` — empty-array leaf policy for sort keys
pub fn make_fill_empty_undefined(expr: Expr) -> Expr {
    make_binary(BinaryOp::FillEmpty, expr, Expr::Constant(Val::Undefined))
}

/// `getField(input, name)`
pub fn make_get_field(input: Expr, name: &str) -> Expr {
    make_function(BuiltinFn::GetField, vec![input, Expr::string(name)])
}

/// `newObj(name1, v1, …)` over `(field, expression)` pairs
pub fn make_new_obj(pairs: Vec<(String, Expr)>) -> Expr {
    let mut args = Vec::with_capacity(pairs.len() * 2);
    for (name, value) in pairs {
        args.push(Expr::string(name));
        args.push(value);
    }
    make_function(BuiltinFn::NewObj, args)
}

/// `exists(slot)`
pub fn make_exists(slot: SlotId) -> Expr {
    make_function(BuiltinFn::Exists, vec![Expr::slot(slot)])
}

/// `isArray(expr)`
pub fn make_is_array(expr: Expr) -> Expr {
    make_function(BuiltinFn::IsArray, vec![expr])
}

/// `isObject(expr)`
pub fn make_is_object(expr: Expr) -> Expr {
    make_function(BuiltinFn::IsObject, vec![expr])
}

/// Left fold of a boolean operator over one or more operands
pub fn make_boolean_tree(op: BinaryOp, first: Expr, rest: Vec<Expr>) -> Expr {
    debug_assert!(matches!(op, BinaryOp::And | BinaryOp::Or));
    rest.into_iter()
        .fold(first, |acc, next| make_binary(op, acc, next))
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(val) => write!(f, "{val}"),
            Expr::Opaque(OpaqueConstant::TextMatcher(m)) => {
                write!(f, "<ftsMatcher:{}>", m.index_name)
            }
            Expr::Opaque(OpaqueConstant::ShardFilterer(_)) => write!(f, "<shardFilterer>"),
            Expr::Opaque(OpaqueConstant::SortSpec(_)) => write!(f, "<sortSpec>"),
            Expr::SlotVar(slot) => write!(f, "{slot}"),
            Expr::LocalVar { frame, index } => write!(f, "l{}.{index}", frame.0),
            Expr::Let { frame, binds, body } => {
                write!(f, "let l{} = [", frame.0)?;
                for (i, bind) in binds.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{bind}")?;
                }
                write!(f, "] in {body}")
            }
            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => write!(f, "if({cond}, {then_branch}, {else_branch})"),
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
            } => write!(f, "!{operand}"),
            Expr::Binary { op, lhs, rhs } => {
                let symbol = match op {
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                    BinaryOp::Add => "+",
                    BinaryOp::Eq => "==",
                    BinaryOp::Less => "<",
                    BinaryOp::LessEq => "<=",
                    BinaryOp::Greater => ">",
                    BinaryOp::GreaterEq => ">=",
                    BinaryOp::Cmp3w => "<=>",
                    BinaryOp::FillEmpty => return write!(f, "fillEmpty({lhs}, {rhs})"),
                };
                write!(f, "({lhs} {symbol} {rhs})")
            }
            Expr::Function { function, args } => {
                write!(f, "{}(", function.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::Fail { code, message } => write!(f, "fail({code}, \"{message}\")"),
        }
    }
}
