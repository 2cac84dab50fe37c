use super::chain::{Chain, ChainStart, Step};
use super::forward::root_membership;
use super::pipeline::{Filter, Pipeline, Stage, hop};
use crate::error::Result;
use crate::lang::{Node, RefKind};
use crate::schema::Registry;
use crate::types::{ID, PARENT_FIELD_NAME, PARENT_ID, TYPE};

/// Impact-discovery pipeline for one dependency of a calc.
///
/// Executed with a mutated resource of `start_spec` bound as context, it
/// yields the resources of the calc's spec whose value may have changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReversePlan {
    /// `spec.field` or `root.name`.
    pub dep: String,
    pub start_spec: String,
    pub pipeline: Pipeline,
}

const CALC_SLOT: &str = "_calc";

fn inverse_hop(step: &Step) -> Vec<Stage> {
    let Step::Hop {
        kind,
        owner,
        field,
        mirrored,
        ..
    } = step
    else {
        return Vec::new();
    };
    let mirrored_field = mirrored.as_ref().map_or(field.as_str(), |(_, f)| f.as_str());
    match kind {
        RefKind::Link | RefKind::Calc => hop(owner, ID, field),
        RefKind::LinkCollection | RefKind::OrderedCollection => {
            hop(owner, ID, &format!("{field}.{ID}"))
        }
        RefKind::Collection => {
            let mut stages = vec![Stage::Match(Filter::eq(PARENT_FIELD_NAME, field.as_str()))];
            stages.extend(hop(owner, PARENT_ID, ID));
            stages
        }
        RefKind::ParentCollection => {
            let mut stages = hop(owner, ID, PARENT_ID);
            stages.push(Stage::Match(Filter::eq(PARENT_FIELD_NAME, mirrored_field)));
            stages
        }
        RefKind::ReverseLink => hop(owner, mirrored_field, ID),
        RefKind::ReverseLinkCollection => hop(owner, &format!("{mirrored_field}.{ID}"), ID),
        RefKind::Field => Vec::new(),
    }
}

fn walk_back(steps: &[Step]) -> Vec<Stage> {
    let mut stages = Vec::new();
    for step in steps.iter().rev() {
        match step {
            Step::Hop { .. } => stages.extend(inverse_hop(step)),
            Step::Id(id) => stages.push(Stage::Match(Filter::eq(ID, id.as_str()))),
            // Runs after the write, so a filter would hide resources that just left it.
            Step::Filter { .. } | Step::Read { .. } => {}
        }
    }
    stages
}

fn terminal(start: &ChainStart, calc_spec: &str) -> Vec<Stage> {
    match start {
        ChainStart::Context { .. } => vec![Stage::Match(Filter::eq(TYPE, calc_spec))],
        ChainStart::Root { name, .. } => vec![
            Stage::Match(root_membership(name)),
            Stage::LookupPipeline {
                pipeline: Pipeline::new().with(Stage::Match(Filter::eq(TYPE, calc_spec))),
                as_field: CALC_SLOT.to_string(),
            },
            Stage::Unwind(CALC_SLOT.to_string()),
            Stage::ReplaceRoot(CALC_SLOT.to_string()),
        ],
    }
}

fn plan(chain: &Chain, calc_spec: &str, dep: String, start_spec: &str, end: usize) -> ReversePlan {
    let mut stages = vec![Stage::Match(Filter::And(vec![
        Filter::Context(ID.to_string()),
        Filter::eq(TYPE, start_spec),
    ]))];
    stages.extend(walk_back(&chain.steps[..end]));
    stages.extend(terminal(&chain.start, calc_spec));
    ReversePlan {
        dep,
        start_spec: start_spec.to_string(),
        pipeline: Pipeline { stages },
    }
}

/// Reverse plans for one chain: one per dependency the chain introduces.
pub fn chain_reverse_plans(chain: &Chain, calc_spec: &str) -> Vec<ReversePlan> {
    let mut plans = Vec::new();

    if let ChainStart::Root { name, spec } = &chain.start {
        let end = chain
            .steps
            .iter()
            .position(|s| matches!(s, Step::Hop { .. } | Step::Read { .. }))
            .unwrap_or(chain.steps.len());
        plans.push(plan(chain, calc_spec, format!("root.{name}"), spec, end));
    }

    for (k, step) in chain.steps.iter().enumerate() {
        match step {
            Step::Hop {
                kind, owner, target, ..
            } => {
                let Some(dep) = step.dep() else { continue };
                let reverse = matches!(
                    kind,
                    RefKind::ReverseLink | RefKind::ReverseLinkCollection | RefKind::ParentCollection
                );
                if reverse {
                    plans.push(plan(chain, calc_spec, dep, target, k + 1));
                } else {
                    plans.push(plan(chain, calc_spec, dep, owner, k));
                }
            }
            Step::Read { owner, .. } => {
                if let Some(dep) = step.dep() {
                    plans.push(plan(chain, calc_spec, dep, owner, k));
                }
            }
            Step::Filter { spec, cond } => {
                let mut fields = Vec::new();
                cond.fields(&mut fields);
                fields.sort();
                fields.dedup();
                for field in fields {
                    plans.push(plan(chain, calc_spec, format!("{spec}.{field}"), spec, k + 1));
                }
            }
            Step::Id(_) => {}
        }
    }
    plans
}

/// All reverse plans of a calc tree declared on `calc_spec`.
pub fn reverse_plans(tree: &Node, calc_spec: &str, registry: &Registry) -> Result<Vec<ReversePlan>> {
    let mut plans: Vec<ReversePlan> = Vec::new();
    for node in tree.chains() {
        let chain = Chain::from_node(node, registry)?;
        for plan in chain_reverse_plans(&chain, calc_spec) {
            if !plans.contains(&plan) {
                plans.push(plan);
            }
        }
    }
    Ok(plans)
}
