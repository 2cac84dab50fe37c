use crate::error::{Error, Result};
use crate::lang::{Cond, Node, NodeKind, RefKind};
use crate::schema::Registry;
use crate::types::{ROOT_SPEC, ResourceId};

#[derive(Debug, Clone, PartialEq)]
pub enum ChainStart {
    /// `self`, the resource the calc is evaluated for.
    Context { spec: String },
    /// A root collection.
    Root { name: String, spec: String },
}

impl ChainStart {
    #[must_use]
    pub fn spec(&self) -> &str {
        match self {
            ChainStart::Context { spec } | ChainStart::Root { spec, .. } => spec,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Moves from resources of `owner` to resources of `target`.
    Hop {
        kind: RefKind,
        owner: String,
        field: String,
        target: String,
        /// For synthesized reverse fields, the authored field they mirror.
        mirrored: Option<(String, String)>,
    },
    /// Reads a primitive value; always the last step.
    Read { owner: String, field: String },
    Filter { spec: String, cond: Cond },
    Id(ResourceId),
}

impl Step {
    /// The `spec.field` dependency a step introduces, if any.
    #[must_use]
    pub fn dep(&self) -> Option<String> {
        match self {
            Step::Hop {
                mirrored: Some((spec, field)),
                ..
            } => Some(format!("{spec}.{field}")),
            Step::Hop { owner, field, .. } | Step::Read { owner, field } => {
                Some(format!("{owner}.{field}"))
            }
            Step::Filter { .. } | Step::Id(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub start: ChainStart,
    pub steps: Vec<Step>,
}

impl Chain {
    pub fn from_node(node: &Node, registry: &Registry) -> Result<Chain> {
        let mut steps = Vec::new();
        let start = flatten(node, registry, &mut steps)?;
        Ok(Chain { start, steps })
    }

    /// Spec of the resources the chain yields, or the owner spec for a
    /// chain ending in a primitive read.
    #[must_use]
    pub fn end_spec(&self) -> &str {
        self.steps
            .iter()
            .rev()
            .find_map(|s| match s {
                Step::Hop { target, .. } => Some(target.as_str()),
                _ => None,
            })
            .unwrap_or_else(|| self.start.spec())
    }

    #[must_use]
    pub fn reads_value(&self) -> bool {
        matches!(self.steps.last(), Some(Step::Read { .. }))
    }
}

fn flatten(node: &Node, registry: &Registry, steps: &mut Vec<Step>) -> Result<ChainStart> {
    match &node.kind {
        NodeKind::Root { name } if name == "self" => Ok(ChainStart::Context {
            spec: node.ty.ty.resource_spec().unwrap_or_default().to_string(),
        }),
        NodeKind::Root { name } => Ok(ChainStart::Root {
            name: name.clone(),
            spec: node.ty.ty.resource_spec().unwrap_or(ROOT_SPEC).to_string(),
        }),
        NodeKind::Ref {
            kind,
            parent,
            field,
            owner,
        } => {
            let start = flatten(parent, registry, steps)?;
            if matches!(steps.last(), Some(Step::Read { .. })) {
                return Err(Error::bad_expression("cannot navigate past a value", field.clone()));
            }
            match node.ty.ty.resource_spec() {
                Some(target) if *kind != RefKind::Field => {
                    let mirrored = registry
                        .field(owner, field)
                        .and_then(|f| f.reverse_of.as_ref())
                        .map(|r| (r.spec.clone(), r.field.clone()));
                    steps.push(Step::Hop {
                        kind: *kind,
                        owner: owner.clone(),
                        field: field.clone(),
                        target: target.to_string(),
                        mirrored,
                    });
                }
                _ => steps.push(Step::Read {
                    owner: owner.clone(),
                    field: field.clone(),
                }),
            }
            Ok(start)
        }
        NodeKind::Filtered { parent, cond } => {
            let start = flatten(parent, registry, steps)?;
            let spec = node.ty.ty.resource_spec().unwrap_or_default().to_string();
            steps.push(Step::Filter {
                spec,
                cond: cond.clone(),
            });
            Ok(start)
        }
        NodeKind::IdMatch { parent, id } => {
            let start = flatten(parent, registry, steps)?;
            steps.push(Step::Id(id.clone()));
            Ok(start)
        }
        _ => Err(Error::Invariant("chain node expected".into())),
    }
}
