use std::collections::BTreeMap;

use serde_json::Value;

use super::chain::{Chain, ChainStart, Step};
use super::pipeline::{AccOp, Accumulator, CmpOp, Expr, Filter, Pipeline, Stage, hop};
use crate::error::{Error, Result};
use crate::lang::{BinOp, Cond, Func, Node, NodeKind, RefKind, ValueType};
use crate::schema::Registry;
use crate::types::{ID, PARENT_CANONICAL_URL, PARENT_FIELD_NAME, PARENT_ID};

/// Slot the computed value is stored in.
pub const VAL: &str = "_val";

/// Filter selecting the members of root collection `name`.
pub fn root_membership(name: &str) -> Filter {
    Filter::And(vec![
        Filter::eq(PARENT_FIELD_NAME, name),
        Filter::eq(PARENT_CANONICAL_URL, "/"),
    ])
}

pub fn cond_filter(cond: &Cond) -> Filter {
    match cond {
        Cond::Compare { field, op, value } => {
            let value = value.to_json();
            let op = match op {
                BinOp::Eq => CmpOp::Eq,
                BinOp::Gt => CmpOp::Gt,
                BinOp::Lt => CmpOp::Lt,
                BinOp::Ge => CmpOp::Gte,
                BinOp::Le => CmpOp::Lte,
                _ => {
                    return Filter::Regex {
                        field: field.clone(),
                        pattern: value.as_str().unwrap_or_default().to_string(),
                    };
                }
            };
            Filter::Cmp {
                field: field.clone(),
                op,
                value,
            }
        }
        Cond::And(a, b) => Filter::And(vec![cond_filter(a), cond_filter(b)]),
        Cond::Or(a, b) => Filter::Or(vec![cond_filter(a), cond_filter(b)]),
    }
}

fn forward_hop(step: &Step) -> Vec<Stage> {
    let Step::Hop {
        kind,
        field,
        target,
        mirrored,
        ..
    } = step
    else {
        return Vec::new();
    };
    let mirrored_field = mirrored.as_ref().map_or(field.as_str(), |(_, f)| f.as_str());
    match kind {
        RefKind::Link | RefKind::Calc => hop(target, field, ID),
        RefKind::LinkCollection | RefKind::OrderedCollection => {
            hop(target, &format!("{field}.{ID}"), ID)
        }
        RefKind::Collection => {
            let mut stages = hop(target, ID, PARENT_ID);
            stages.push(Stage::Match(Filter::eq(PARENT_FIELD_NAME, field.as_str())));
            stages
        }
        RefKind::ParentCollection => {
            let mut stages = vec![Stage::Match(Filter::eq(PARENT_FIELD_NAME, mirrored_field))];
            stages.extend(hop(target, PARENT_ID, ID));
            stages
        }
        RefKind::ReverseLink => hop(target, ID, mirrored_field),
        RefKind::ReverseLinkCollection => hop(target, ID, &format!("{mirrored_field}.{ID}")),
        RefKind::Field => Vec::new(),
    }
}

/// Stages that walk a chain forward from its start.
pub fn chain_stages(chain: &Chain) -> Vec<Stage> {
    let mut stages = match &chain.start {
        ChainStart::Context { .. } => vec![Stage::Match(Filter::Context(ID.to_string()))],
        ChainStart::Root { name, .. } => vec![Stage::Match(root_membership(name))],
    };
    for step in &chain.steps {
        match step {
            Step::Hop { .. } => stages.extend(forward_hop(step)),
            Step::Read { field, .. } => {
                stages.push(Stage::AddFields(vec![(VAL.to_string(), Expr::field(field))]));
            }
            Step::Filter { cond, .. } => stages.push(Stage::Match(cond_filter(cond))),
            Step::Id(id) => stages.push(Stage::Match(Filter::eq(ID, id.as_str()))),
        }
    }
    stages
}

/// Pipeline yielding the resources a URL addresses.
pub fn url_pipeline(node: &Node, registry: &Registry) -> Result<Pipeline> {
    let chain = Chain::from_node(node, registry)?;
    Ok(Pipeline {
        stages: chain_stages(&chain),
    })
}

/// Builds the pipeline computing a calc for the resource bound as context.
///
/// Chain-valued calcs yield the reached resources (or `_val` documents for
/// primitive reads); every other calc yields one document whose `_val`
/// holds the result.
pub fn forward_plan(tree: &Node, registry: &Registry) -> Result<Pipeline> {
    if tree.is_chain() {
        return url_pipeline(tree, registry);
    }
    let mut composer = Composer {
        registry,
        stages: vec![Stage::Match(Filter::Context(ID.to_string()))],
        slots: BTreeMap::new(),
    };
    let value = composer.value(tree, "_expr")?;
    composer
        .stages
        .push(Stage::AddFields(vec![(VAL.to_string(), value)]));
    Ok(Pipeline {
        stages: composer.stages,
    })
}

struct Composer<'a> {
    registry: &'a Registry,
    stages: Vec<Stage>,
    slots: BTreeMap<String, usize>,
}

impl Composer<'_> {
    fn slot(&mut self, base: &str) -> String {
        let n = self.slots.entry(base.to_string()).or_insert(0);
        *n += 1;
        if *n == 1 {
            base.to_string()
        } else {
            format!("{base}_{n}")
        }
    }

    /// Runs `stages` as a sub-pipeline into a fresh slot and returns the
    /// slot name.
    fn lookup(&mut self, base: &str, stages: Vec<Stage>) -> String {
        let slot = self.slot(base);
        self.stages.push(Stage::LookupPipeline {
            pipeline: Pipeline { stages },
            as_field: slot.clone(),
        });
        slot
    }

    fn value(&mut self, node: &Node, base: &str) -> Result<Expr> {
        match &node.kind {
            NodeKind::Const(lit) => Ok(Expr::Literal(lit.to_json())),
            _ if node.is_chain() => self.chain_value(node, base),
            NodeKind::Call { func, args } => self.call(*func, args, base),
            NodeKind::Binary { op, lhs, rhs } => {
                let l = self.value(lhs, "_lhs")?;
                let r = self.value(rhs, "_rhs")?;
                Ok(binary(*op, &lhs.ty.ty, &rhs.ty.ty, l, r))
            }
            NodeKind::Negate(inner) => Ok(Expr::Negate(Box::new(self.value(inner, base)?))),
            NodeKind::Ternary {
                cond,
                then,
                otherwise,
            } => Ok(Expr::Cond {
                when: Box::new(self.value(cond, "_if")?),
                then: Box::new(self.value(then, "_then")?),
                otherwise: Box::new(self.value(otherwise, "_else")?),
            }),
            NodeKind::Switch { selector, cases } => {
                let selector = self.value(selector, "_switch_src")?;
                let slot = self.slot("_switch_val");
                self.stages
                    .push(Stage::AddFields(vec![(slot.clone(), selector)]));
                let mut branches = Vec::with_capacity(cases.len());
                for (i, (literal, body)) in cases.iter().enumerate() {
                    let case = Expr::Cmp(
                        CmpOp::Eq,
                        Box::new(Expr::Literal(literal.to_json())),
                        Box::new(Expr::Field(slot.clone())),
                    );
                    let body = self.value(body, &format!("_case_{i}"))?;
                    branches.push((case, body));
                }
                Ok(Expr::Switch {
                    branches,
                    default: Box::new(Expr::Literal(Value::Null)),
                })
            }
            _ => Err(Error::Invariant(format!(
                "unplannable node {:?}",
                node.kind
            ))),
        }
    }

    fn chain_value(&mut self, node: &Node, base: &str) -> Result<Expr> {
        let chain = Chain::from_node(node, self.registry)?;
        if let ChainStart::Context { .. } = chain.start {
            match chain.steps.as_slice() {
                [] => return Ok(Expr::field(ID)),
                [Step::Read { field, .. }] => return Ok(Expr::field(field)),
                _ => {}
            }
        }
        let key = if chain.reads_value() { VAL } else { ID };
        let slot = self.lookup(base, chain_stages(&chain));
        let values = Expr::Field(format!("{slot}.{key}"));
        if node.ty.collection {
            Ok(values)
        } else {
            Ok(Expr::ArrayElemAt(Box::new(values), 0))
        }
    }

    fn call(&mut self, func: Func, args: &[Node], base: &str) -> Result<Expr> {
        let arg = |i: usize| -> Result<&Node> {
            args.get(i).ok_or_else(|| {
                Error::Invariant(format!("{}() missing argument", func.name()))
            })
        };
        match func {
            Func::Sum | Func::Min | Func::Max | Func::Average => {
                let chain = Chain::from_node(arg(0)?, self.registry)?;
                let op = match func {
                    Func::Sum => AccOp::Sum,
                    Func::Min => AccOp::Min,
                    Func::Max => AccOp::Max,
                    _ => AccOp::Avg,
                };
                let mut stages = chain_stages(&chain);
                stages.push(Stage::Group {
                    key: Expr::Literal(Value::Null),
                    fields: vec![(
                        VAL.to_string(),
                        Accumulator {
                            op,
                            expr: Expr::field(VAL),
                        },
                    )],
                });
                let slot = self.lookup(base, stages);
                let value = Expr::ArrayElemAt(Box::new(Expr::Field(format!("{slot}.{VAL}"))), 0);
                if func == Func::Sum {
                    Ok(Expr::IfNull(Box::new(value), Box::new(Expr::lit(0))))
                } else {
                    Ok(value)
                }
            }
            Func::First => {
                let chain = Chain::from_node(arg(0)?, self.registry)?;
                let key = if chain.reads_value() { VAL } else { ID };
                let mut stages = chain_stages(&chain);
                stages.push(Stage::Limit(1));
                let slot = self.lookup(base, stages);
                Ok(Expr::ArrayElemAt(
                    Box::new(Expr::Field(format!("{slot}.{key}"))),
                    0,
                ))
            }
            Func::Round => {
                let value = self.value(arg(0)?, "_arg")?;
                let digits = match args.get(1) {
                    Some(d) => self.value(d, "_arg")?,
                    None => Expr::lit(0),
                };
                Ok(Expr::Round(Box::new(value), Box::new(digits)))
            }
            Func::Days | Func::Hours | Func::Minutes | Func::Seconds => {
                let value = self.value(arg(0)?, "_arg")?;
                let ms = func.duration_ms().unwrap_or(1);
                Ok(Expr::Multiply(Box::new(value), Box::new(Expr::lit(ms))))
            }
        }
    }
}

fn zero_if_null(e: Expr) -> Box<Expr> {
    Box::new(Expr::IfNull(Box::new(e), Box::new(Expr::lit(0))))
}

fn binary(op: BinOp, lt: &ValueType, rt: &ValueType, l: Expr, r: Expr) -> Expr {
    let (lb, rb) = (Box::new(l), Box::new(r));
    match op {
        BinOp::Add => match (lt, rt) {
            (ValueType::Str, ValueType::Str) => Expr::Concat(lb, rb),
            (ValueType::Datetime, ValueType::Duration) => Expr::DateAdd(lb, rb),
            _ => Expr::Add(zero_if_null(*lb), zero_if_null(*rb)),
        },
        BinOp::Sub => match (lt, rt) {
            (ValueType::Datetime, ValueType::Duration) => {
                Expr::DateAdd(lb, Box::new(Expr::Negate(rb)))
            }
            (ValueType::Datetime, ValueType::Datetime) => Expr::DateDiff(lb, rb),
            _ => Expr::Subtract(zero_if_null(*lb), zero_if_null(*rb)),
        },
        BinOp::Mul => Expr::Multiply(lb, rb),
        BinOp::Div => Expr::Divide(lb, rb),
        BinOp::Eq => Expr::Cmp(CmpOp::Eq, lb, rb),
        BinOp::Gt => Expr::Cmp(CmpOp::Gt, lb, rb),
        BinOp::Lt => Expr::Cmp(CmpOp::Lt, lb, rb),
        BinOp::Ge => Expr::Cmp(CmpOp::Gte, lb, rb),
        BinOp::Le => Expr::Cmp(CmpOp::Lte, lb, rb),
        BinOp::Like => Expr::Regex(lb, rb),
        BinOp::And => Expr::And(lb, rb),
        BinOp::Or => Expr::Or(lb, rb),
    }
}
