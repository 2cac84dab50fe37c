mod chain;
mod forward;
mod pipeline;
mod reverse;

pub use chain::{Chain, ChainStart, Step};
pub use forward::{VAL, chain_stages, cond_filter, forward_plan, root_membership, url_pipeline};
pub use pipeline::{AccOp, Accumulator, CmpOp, Expr, Filter, Pipeline, Stage, hop};
pub use reverse::{ReversePlan, chain_reverse_plans, reverse_plans};

use std::collections::BTreeSet;

use crate::error::Result;
use crate::lang::Node;
use crate::schema::Registry;

/// The `spec.field` / `root.name` dependencies of a calc tree.
pub fn resource_deps(tree: &Node, registry: &Registry) -> Result<BTreeSet<String>> {
    let mut deps = BTreeSet::new();
    for node in tree.chains() {
        let chain = Chain::from_node(node, registry)?;
        if let ChainStart::Root { name, .. } = &chain.start {
            deps.insert(format!("root.{name}"));
        }
        for step in &chain.steps {
            match step {
                Step::Filter { spec, cond } => {
                    let mut fields = Vec::new();
                    cond.fields(&mut fields);
                    deps.extend(fields.into_iter().map(|f| format!("{spec}.{f}")));
                }
                other => deps.extend(other.dep()),
            }
        }
    }
    Ok(deps)
}
