use std::fmt;

use crate::schema::FieldKind;
use crate::types::ResourceId;

/// Value type of a resolved node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    Str,
    Int,
    Float,
    Bool,
    Datetime,
    /// Milliseconds, produced by `days()` and friends.
    Duration,
    Resource(String),
}

impl ValueType {
    #[must_use]
    pub fn from_field_kind(kind: FieldKind) -> Option<ValueType> {
        match kind {
            FieldKind::Str => Some(ValueType::Str),
            FieldKind::Int => Some(ValueType::Int),
            FieldKind::Float => Some(ValueType::Float),
            FieldKind::Bool => Some(ValueType::Bool),
            FieldKind::Datetime => Some(ValueType::Datetime),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Int | ValueType::Float)
    }

    #[must_use]
    pub fn resource_spec(&self) -> Option<&str> {
        match self {
            ValueType::Resource(spec) => Some(spec),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Str => f.write_str("str"),
            ValueType::Int => f.write_str("int"),
            ValueType::Float => f.write_str("float"),
            ValueType::Bool => f.write_str("bool"),
            ValueType::Datetime => f.write_str("datetime"),
            ValueType::Duration => f.write_str("duration"),
            ValueType::Resource(spec) => write!(f, "{spec}"),
        }
    }
}

/// The inferred type of a node or calc: a value type plus collection-ness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub ty: ValueType,
    pub collection: bool,
}

impl TypeInfo {
    #[must_use]
    pub fn scalar(ty: ValueType) -> Self {
        Self {
            ty,
            collection: false,
        }
    }

    #[must_use]
    pub fn many(ty: ValueType) -> Self {
        Self {
            ty,
            collection: true,
        }
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.collection {
            write!(f, "collection<{}>", self.ty)
        } else {
            write!(f, "{}", self.ty)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Id(ResourceId),
}

impl Literal {
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Literal::Int(_) => ValueType::Int,
            Literal::Float(_) => ValueType::Float,
            Literal::Str(_) => ValueType::Str,
            Literal::Bool(_) => ValueType::Bool,
            Literal::Id(_) => ValueType::Str,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Literal::Int(i) => serde_json::Value::from(*i),
            Literal::Float(f) => serde_json::Value::from(*f),
            Literal::Str(s) => serde_json::Value::String(s.clone()),
            Literal::Bool(b) => serde_json::Value::Bool(*b),
            Literal::Id(id) => serde_json::Value::String(id.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
    And,
    Or,
}

impl BinOp {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "=",
            BinOp::Gt => ">",
            BinOp::Lt => "<",
            BinOp::Ge => ">=",
            BinOp::Le => "<=",
            BinOp::Like => "~",
            BinOp::And => "&",
            BinOp::Or => "|",
        }
    }

    #[must_use]
    pub const fn is_arithmetic(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div)
    }

    #[must_use]
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le | BinOp::Like
        )
    }

    /// Binding strength; higher binds tighter.
    #[must_use]
    pub const fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 2,
            BinOp::And => 3,
            BinOp::Eq | BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le | BinOp::Like => 4,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Sum,
    Min,
    Max,
    Average,
    First,
    Round,
    Days,
    Hours,
    Minutes,
    Seconds,
}

impl Func {
    pub fn parse(name: &str) -> Option<Func> {
        match name {
            "sum" => Some(Func::Sum),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            "average" => Some(Func::Average),
            "first" => Some(Func::First),
            "round" => Some(Func::Round),
            "days" => Some(Func::Days),
            "hours" => Some(Func::Hours),
            "minutes" => Some(Func::Minutes),
            "seconds" => Some(Func::Seconds),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Func::Sum => "sum",
            Func::Min => "min",
            Func::Max => "max",
            Func::Average => "average",
            Func::First => "first",
            Func::Round => "round",
            Func::Days => "days",
            Func::Hours => "hours",
            Func::Minutes => "minutes",
            Func::Seconds => "seconds",
        }
    }

    /// Milliseconds per unit for the duration builtins.
    #[must_use]
    pub const fn duration_ms(self) -> Option<i64> {
        match self {
            Func::Days => Some(86_400_000),
            Func::Hours => Some(3_600_000),
            Func::Minutes => Some(60_000),
            Func::Seconds => Some(1_000),
            _ => None,
        }
    }
}

/// How a dotted segment traverses from one spec to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Field,
    Link,
    LinkCollection,
    OrderedCollection,
    Collection,
    ParentCollection,
    ReverseLink,
    ReverseLinkCollection,
    Calc,
}

impl RefKind {
    #[must_use]
    pub fn from_field_kind(kind: FieldKind) -> RefKind {
        match kind {
            FieldKind::Link => RefKind::Link,
            FieldKind::LinkCollection => RefKind::LinkCollection,
            FieldKind::OrderedCollection => RefKind::OrderedCollection,
            FieldKind::Collection => RefKind::Collection,
            FieldKind::ParentCollection => RefKind::ParentCollection,
            FieldKind::ReverseLink => RefKind::ReverseLink,
            FieldKind::ReverseLinkCollection => RefKind::ReverseLinkCollection,
            FieldKind::Calc => RefKind::Calc,
            _ => RefKind::Field,
        }
    }
}

/// A filter condition over the fields of the filtered spec.
#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    Compare {
        field: String,
        op: BinOp,
        value: Literal,
    },
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
}

impl Cond {
    /// Field names the condition reads.
    pub fn fields(&self, out: &mut Vec<String>) {
        match self {
            Cond::Compare { field, .. } => out.push(field.clone()),
            Cond::And(a, b) | Cond::Or(a, b) => {
                a.fields(out);
                b.fields(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// `self` or a root collection name.
    Root { name: String },
    /// A dotted segment: `parent.field`, where `field` lives on `owner`.
    Ref {
        kind: RefKind,
        parent: Box<Node>,
        field: String,
        owner: String,
    },
    /// URL-only: `parent/ID…`.
    IdMatch { parent: Box<Node>, id: ResourceId },
    Filtered { parent: Box<Node>, cond: Cond },
    Call { func: Func, args: Vec<Node> },
    Binary {
        op: BinOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Negate(Box<Node>),
    Ternary {
        cond: Box<Node>,
        then: Box<Node>,
        otherwise: Box<Node>,
    },
    Switch {
        selector: Box<Node>,
        cases: Vec<(Literal, Node)>,
    },
    Const(Literal),
}

/// A resolved, typed expression or URL node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub ty: TypeInfo,
}

impl Node {
    #[must_use]
    pub fn new(kind: NodeKind, ty: TypeInfo) -> Self {
        Self { kind, ty }
    }

    /// True for nodes that navigate resources: roots, refs, id matches, filters.
    #[must_use]
    pub fn is_chain(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Root { .. }
                | NodeKind::Ref { .. }
                | NodeKind::IdMatch { .. }
                | NodeKind::Filtered { .. }
        )
    }

    /// The root of a chain node.
    #[must_use]
    pub fn chain_root(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Root { name } => Some(name),
            NodeKind::Ref { parent, .. }
            | NodeKind::IdMatch { parent, .. }
            | NodeKind::Filtered { parent, .. } => parent.chain_root(),
            _ => None,
        }
    }

    /// Child nodes in evaluation order.
    #[must_use]
    pub fn children(&self) -> Vec<&Node> {
        match &self.kind {
            NodeKind::Root { .. } | NodeKind::Const(_) => Vec::new(),
            NodeKind::Ref { parent, .. }
            | NodeKind::IdMatch { parent, .. }
            | NodeKind::Filtered { parent, .. } => vec![parent],
            NodeKind::Call { args, .. } => args.iter().collect(),
            NodeKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            NodeKind::Negate(inner) => vec![inner],
            NodeKind::Ternary {
                cond,
                then,
                otherwise,
            } => vec![cond, then, otherwise],
            NodeKind::Switch { selector, cases } => {
                let mut out = vec![selector.as_ref()];
                out.extend(cases.iter().map(|(_, n)| n));
                out
            }
        }
    }

    /// Maximal chain nodes in the tree.
    #[must_use]
    pub fn chains(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        collect_chains(self, &mut out);
        out
    }
}

fn collect_chains<'a>(node: &'a Node, out: &mut Vec<&'a Node>) {
    if node.is_chain() {
        out.push(node);
        return;
    }
    for child in node.children() {
        collect_chains(child, out);
    }
}
