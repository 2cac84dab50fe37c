use super::parser::Syntax;
use super::tree::{BinOp, Cond, Func, Literal, Node, NodeKind, RefKind, TypeInfo, ValueType};
use crate::error::{Error, Result};
use crate::schema::{FieldKind, Registry, normalize_datetime};

/// Supplies the inferred type of calc fields while resolving references
/// that traverse them.
pub trait CalcTypes {
    fn calc_type(&self, spec: &str, field: &str) -> Result<TypeInfo>;
}

pub struct Resolver<'a> {
    registry: &'a Registry,
    types: &'a dyn CalcTypes,
    self_spec: Option<&'a str>,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a Registry, types: &'a dyn CalcTypes, self_spec: Option<&'a str>) -> Self {
        Self {
            registry,
            types,
            self_spec,
        }
    }

    pub fn resolve(&self, syntax: &Syntax) -> Result<Node> {
        match syntax {
            Syntax::Name(name) => self.root(name),
            Syntax::Literal(lit) => Ok(Node::new(
                NodeKind::Const(lit.clone()),
                TypeInfo::scalar(lit.value_type()),
            )),
            Syntax::Member(parent, name) => self.member(parent, name),
            Syntax::IdSeg(parent, id) => {
                let parent = self.resolve(parent)?;
                let spec = resource_of(&parent, &id.encode())?.to_string();
                if !parent.ty.collection {
                    return Err(Error::bad_expression(
                        "id segment must follow a collection",
                        id.encode(),
                    ));
                }
                Ok(Node::new(
                    NodeKind::IdMatch {
                        parent: Box::new(parent),
                        id: id.clone(),
                    },
                    TypeInfo::scalar(ValueType::Resource(spec)),
                ))
            }
            Syntax::Filter(parent, cond) => {
                let parent = self.resolve(parent)?;
                let spec = resource_of(&parent, "[")?.to_string();
                let cond = self.condition(&spec, cond)?;
                let ty = parent.ty.clone();
                Ok(Node::new(
                    NodeKind::Filtered {
                        parent: Box::new(parent),
                        cond,
                    },
                    ty,
                ))
            }
            Syntax::Call(name, args) => self.call(name, args),
            Syntax::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs),
            Syntax::Neg(inner) => {
                let inner = self.resolve(inner)?;
                scalar(&inner, "-")?;
                if !inner.ty.ty.is_numeric() && inner.ty.ty != ValueType::Duration {
                    return Err(Error::bad_expression(
                        format!("cannot negate {}", inner.ty),
                        "-",
                    ));
                }
                let ty = inner.ty.clone();
                Ok(Node::new(NodeKind::Negate(Box::new(inner)), ty))
            }
            Syntax::Ternary(cond, then, otherwise) => {
                let cond = self.resolve(cond)?;
                if cond.ty != TypeInfo::scalar(ValueType::Bool) {
                    return Err(Error::bad_expression(
                        format!("ternary condition must be bool, got {}", cond.ty),
                        "->",
                    ));
                }
                let then = self.resolve(then)?;
                let otherwise = self.resolve(otherwise)?;
                let ty = unify(&then.ty, &otherwise.ty).ok_or_else(|| {
                    Error::bad_expression(
                        format!("ternary branches disagree: {} vs {}", then.ty, otherwise.ty),
                        ":",
                    )
                })?;
                Ok(Node::new(
                    NodeKind::Ternary {
                        cond: Box::new(cond),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                    ty,
                ))
            }
            Syntax::Switch(selector, cases) => self.switch(selector, cases),
        }
    }

    fn root(&self, name: &str) -> Result<Node> {
        if name == "self" {
            let spec = self
                .self_spec
                .ok_or_else(|| Error::bad_expression("self is not available here", name))?;
            return Ok(Node::new(
                NodeKind::Root {
                    name: name.to_string(),
                },
                TypeInfo::scalar(ValueType::Resource(spec.to_string())),
            ));
        }
        let field = self
            .registry
            .root()
            .field(name)
            .ok_or_else(|| Error::bad_expression(format!("unknown root name {name}"), name))?;
        let target = field.target().unwrap_or_default().to_string();
        Ok(Node::new(
            NodeKind::Root {
                name: name.to_string(),
            },
            TypeInfo::many(ValueType::Resource(target)),
        ))
    }

    fn member(&self, parent: &Syntax, name: &str) -> Result<Node> {
        let parent = self.resolve(parent)?;
        let owner = resource_of(&parent, name)?.to_string();
        let field = self.registry.field(&owner, name).ok_or_else(|| {
            Error::bad_expression(format!("no field {name} on {owner}"), name)
        })?;
        let kind = RefKind::from_field_kind(field.kind);
        let ty = match field.kind {
            FieldKind::Calc => {
                let calc = self.types.calc_type(&owner, name)?;
                TypeInfo {
                    ty: calc.ty,
                    collection: parent.ty.collection || calc.collection,
                }
            }
            kind if kind.is_primitive() => TypeInfo {
                ty: ValueType::from_field_kind(kind).unwrap_or(ValueType::Str),
                collection: parent.ty.collection,
            },
            kind => TypeInfo {
                ty: ValueType::Resource(field.target().unwrap_or_default().to_string()),
                collection: parent.ty.collection || kind.is_collection(),
            },
        };
        Ok(Node::new(
            NodeKind::Ref {
                kind,
                parent: Box::new(parent),
                field: name.to_string(),
                owner,
            },
            ty,
        ))
    }

    fn call(&self, name: &str, args: &[Syntax]) -> Result<Node> {
        let func = Func::parse(name)
            .ok_or_else(|| Error::bad_expression(format!("unknown function {name}"), name))?;
        let args = args
            .iter()
            .map(|a| self.resolve(a))
            .collect::<Result<Vec<_>>>()?;
        let arity = |expected: &str| {
            Error::bad_expression(
                format!("{name}() takes {expected} argument(s), got {}", args.len()),
                name,
            )
        };

        let ty = match func {
            Func::Sum | Func::Min | Func::Max | Func::Average => {
                let [arg] = args.as_slice() else {
                    return Err(arity("1"));
                };
                if !arg.ty.collection || !arg.is_chain() {
                    return Err(Error::bad_expression(
                        format!("{name}() needs a collection, got {}", arg.ty),
                        name,
                    ));
                }
                let numeric = arg.ty.ty.is_numeric();
                let orderable = numeric || matches!(arg.ty.ty, ValueType::Datetime | ValueType::Str);
                match func {
                    Func::Sum if numeric => TypeInfo::scalar(arg.ty.ty.clone()),
                    Func::Average if numeric => TypeInfo::scalar(ValueType::Float),
                    Func::Min | Func::Max if orderable => TypeInfo::scalar(arg.ty.ty.clone()),
                    _ => {
                        return Err(Error::bad_expression(
                            format!("{name}() cannot aggregate {}", arg.ty),
                            name,
                        ));
                    }
                }
            }
            Func::First => {
                let [arg] = args.as_slice() else {
                    return Err(arity("1"));
                };
                if !arg.ty.collection || !arg.is_chain() {
                    return Err(Error::bad_expression(
                        format!("first() needs a collection, got {}", arg.ty),
                        name,
                    ));
                }
                TypeInfo::scalar(arg.ty.ty.clone())
            }
            Func::Round => {
                let (value, digits) = match args.as_slice() {
                    [value] => (value, None),
                    [value, digits] => (value, Some(digits)),
                    _ => return Err(arity("1 or 2")),
                };
                if value.ty.collection || !value.ty.ty.is_numeric() {
                    return Err(Error::bad_expression(
                        format!("round() needs a number, got {}", value.ty),
                        name,
                    ));
                }
                if let Some(digits) = digits {
                    if digits.ty != TypeInfo::scalar(ValueType::Int) {
                        return Err(Error::bad_expression(
                            format!("round() digits must be int, got {}", digits.ty),
                            name,
                        ));
                    }
                }
                TypeInfo::scalar(ValueType::Float)
            }
            Func::Days | Func::Hours | Func::Minutes | Func::Seconds => {
                let [arg] = args.as_slice() else {
                    return Err(arity("1"));
                };
                if arg.ty.collection || !arg.ty.ty.is_numeric() {
                    return Err(Error::bad_expression(
                        format!("{name}() needs a number, got {}", arg.ty),
                        name,
                    ));
                }
                TypeInfo::scalar(ValueType::Duration)
            }
        };

        Ok(Node::new(NodeKind::Call { func, args }, ty))
    }

    fn binary(&self, op: BinOp, lhs: &Syntax, rhs: &Syntax) -> Result<Node> {
        let lhs = self.resolve(lhs)?;
        let rhs = self.resolve(rhs)?;
        scalar(&lhs, op.symbol())?;
        scalar(&rhs, op.symbol())?;
        let mismatch = || {
            Error::bad_expression(
                format!("cannot apply {} to {} and {}", op.symbol(), lhs.ty, rhs.ty),
                op.symbol(),
            )
        };
        let (l, r) = (&lhs.ty.ty, &rhs.ty.ty);

        let ty = match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => match (l, r) {
                (ValueType::Int, ValueType::Int) if op == BinOp::Div => ValueType::Float,
                (ValueType::Int, ValueType::Int) => ValueType::Int,
                (a, b) if a.is_numeric() && b.is_numeric() => ValueType::Float,
                (ValueType::Str, ValueType::Str) if op == BinOp::Add => ValueType::Str,
                (ValueType::Datetime, ValueType::Duration) if matches!(op, BinOp::Add | BinOp::Sub) => {
                    ValueType::Datetime
                }
                (ValueType::Datetime, ValueType::Datetime) if op == BinOp::Sub => ValueType::Duration,
                (ValueType::Duration, ValueType::Duration) if matches!(op, BinOp::Add | BinOp::Sub) => {
                    ValueType::Duration
                }
                _ => return Err(mismatch()),
            },
            BinOp::Like => match (l, r) {
                (ValueType::Str, ValueType::Str) => ValueType::Bool,
                _ => return Err(mismatch()),
            },
            BinOp::Eq | BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
                if comparable(l, r) {
                    ValueType::Bool
                } else {
                    return Err(mismatch());
                }
            }
            BinOp::And | BinOp::Or => match (l, r) {
                (ValueType::Bool, ValueType::Bool) => ValueType::Bool,
                _ => return Err(mismatch()),
            },
        };

        Ok(Node::new(
            NodeKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            TypeInfo::scalar(ty),
        ))
    }

    fn switch(&self, selector: &Syntax, cases: &[(Literal, Syntax)]) -> Result<Node> {
        let selector = self.resolve(selector)?;
        scalar(&selector, "->")?;
        let mut resolved = Vec::with_capacity(cases.len());
        let mut ty: Option<TypeInfo> = None;
        for (literal, body) in cases {
            if !comparable(&selector.ty.ty, &literal.value_type()) {
                return Err(Error::bad_expression(
                    format!("case {} does not match selector {}", super::emit::emit_literal(literal), selector.ty),
                    super::emit::emit_literal(literal),
                ));
            }
            let body = self.resolve(body)?;
            ty = match ty {
                None => Some(body.ty.clone()),
                Some(prev) => Some(unify(&prev, &body.ty).ok_or_else(|| {
                    Error::bad_expression(
                        format!("switch cases disagree: {prev} vs {}", body.ty),
                        ":",
                    )
                })?),
            };
            resolved.push((literal.clone(), body));
        }
        let ty = ty.ok_or_else(|| Error::bad_expression("switch without cases", "->"))?;
        Ok(Node::new(
            NodeKind::Switch {
                selector: Box::new(selector),
                cases: resolved,
            },
            ty,
        ))
    }

    /// Resolves a filter condition against the fields of `spec`.
    pub fn condition(&self, spec: &str, syntax: &Syntax) -> Result<Cond> {
        match syntax {
            Syntax::Binary(BinOp::And, a, b) => Ok(Cond::And(
                Box::new(self.condition(spec, a)?),
                Box::new(self.condition(spec, b)?),
            )),
            Syntax::Binary(BinOp::Or, a, b) => Ok(Cond::Or(
                Box::new(self.condition(spec, a)?),
                Box::new(self.condition(spec, b)?),
            )),
            Syntax::Binary(op, lhs, rhs) if op.is_comparison() => {
                let (Syntax::Name(name), Syntax::Literal(literal)) = (lhs.as_ref(), rhs.as_ref()) else {
                    return Err(Error::bad_expression(
                        "condition must compare a field to a literal",
                        op.symbol(),
                    ));
                };
                let value = self.condition_literal(spec, name, *op, literal)?;
                Ok(Cond::Compare {
                    field: name.clone(),
                    op: *op,
                    value,
                })
            }
            other => Err(Error::bad_expression(
                "expected a condition",
                other.to_string(),
            )),
        }
    }

    fn condition_literal(&self, spec: &str, name: &str, op: BinOp, literal: &Literal) -> Result<Literal> {
        let field = self
            .registry
            .field(spec, name)
            .ok_or_else(|| Error::bad_expression(format!("no field {name} on {spec}"), name))?;
        let field_ty = match field.kind {
            FieldKind::Calc => {
                let ty = self.types.calc_type(spec, name)?;
                if ty.collection {
                    None
                } else {
                    Some(ty.ty)
                }
            }
            FieldKind::Link => Some(ValueType::Resource(field.target().unwrap_or_default().to_string())),
            kind => ValueType::from_field_kind(kind),
        };
        let incompatible = || {
            Error::bad_expression(
                format!(
                    "cannot compare {spec}.{name} with {}",
                    super::emit::emit_literal(literal)
                ),
                super::emit::emit_literal(literal),
            )
        };
        let Some(field_ty) = field_ty else {
            return Err(incompatible());
        };
        if op == BinOp::Like {
            return match (&field_ty, literal) {
                (ValueType::Str, Literal::Str(_)) => Ok(literal.clone()),
                _ => Err(incompatible()),
            };
        }
        match (&field_ty, literal) {
            (ValueType::Int | ValueType::Float, Literal::Int(_) | Literal::Float(_)) => Ok(literal.clone()),
            (ValueType::Str, Literal::Str(_)) => Ok(literal.clone()),
            (ValueType::Bool, Literal::Bool(_)) if op == BinOp::Eq => Ok(literal.clone()),
            (ValueType::Datetime, Literal::Str(s)) => normalize_datetime(s)
                .map(Literal::Str)
                .ok_or_else(incompatible),
            (ValueType::Resource(_), Literal::Id(_)) if op == BinOp::Eq => Ok(literal.clone()),
            _ => Err(incompatible()),
        }
    }
}

fn resource_of<'n>(node: &'n Node, token: &str) -> Result<&'n str> {
    if !node.is_chain() {
        return Err(Error::bad_expression(
            "only references can be navigated",
            token,
        ));
    }
    node.ty.ty.resource_spec().ok_or_else(|| {
        Error::bad_expression(format!("cannot navigate into {}", node.ty), token)
    })
}

fn scalar(node: &Node, token: &str) -> Result<()> {
    if node.ty.collection {
        return Err(Error::bad_expression(
            format!("operand is a {}, expected a single value", node.ty),
            token,
        ));
    }
    Ok(())
}

fn comparable(a: &ValueType, b: &ValueType) -> bool {
    a == b || (a.is_numeric() && b.is_numeric())
}

fn unify(a: &TypeInfo, b: &TypeInfo) -> Option<TypeInfo> {
    if a.collection != b.collection {
        return None;
    }
    if a.ty == b.ty {
        return Some(a.clone());
    }
    if a.ty.is_numeric() && b.ty.is_numeric() {
        return Some(TypeInfo {
            ty: ValueType::Float,
            collection: a.collection,
        });
    }
    None
}
