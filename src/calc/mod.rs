use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::lang::{self, CalcTypes, Node, TypeInfo};
use crate::plan::{self, Pipeline, ReversePlan};
use crate::schema::Registry;

/// `(spec, field)` of a calc.
pub type CalcKey = (String, String);

#[derive(Debug, Clone)]
pub struct CalcEntry {
    pub spec: String,
    pub field: String,
    pub expr: String,
    pub tree: Node,
    pub deps: BTreeSet<String>,
    pub forward: Pipeline,
    pub reverse: Vec<ReversePlan>,
    /// Position in topological order; dependencies rank lower.
    pub rank: usize,
}

impl CalcEntry {
    #[must_use]
    pub fn calc_type(&self) -> &TypeInfo {
        &self.tree.ty
    }

    #[must_use]
    pub fn dep_name(&self) -> String {
        format!("{}.{}", self.spec, self.field)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CalcIndex {
    entries: BTreeMap<CalcKey, CalcEntry>,
    order: Vec<CalcKey>,
}

/// Parses calcs on demand so that a calc traversing another calc sees its
/// inferred type, detecting cycles through the resolution stack.
struct TypeResolver<'a> {
    registry: &'a Registry,
    trees: RefCell<BTreeMap<CalcKey, Node>>,
    stack: RefCell<Vec<CalcKey>>,
}

impl TypeResolver<'_> {
    fn tree(&self, spec: &str, field: &str) -> Result<Node> {
        let key = (spec.to_string(), field.to_string());
        if let Some(tree) = self.trees.borrow().get(&key) {
            return Ok(tree.clone());
        }
        {
            let stack = self.stack.borrow();
            if let Some(pos) = stack.iter().position(|k| *k == key) {
                let mut cycle: Vec<String> =
                    stack[pos..].iter().map(|(s, f)| format!("{s}.{f}")).collect();
                cycle.push(format!("{spec}.{field}"));
                return Err(Error::CircularCalc(cycle));
            }
        }
        let expr = self
            .registry
            .field(spec, field)
            .and_then(|f| f.calc_str.clone())
            .ok_or_else(|| Error::UnknownField(format!("{spec}.{field}")))?;

        self.stack.borrow_mut().push(key.clone());
        let parsed = lang::parse_calc(self.registry, spec, &expr, self);
        self.stack.borrow_mut().pop();

        let tree = parsed?;
        self.trees.borrow_mut().insert(key, tree.clone());
        Ok(tree)
    }
}

impl CalcTypes for TypeResolver<'_> {
    fn calc_type(&self, spec: &str, field: &str) -> Result<TypeInfo> {
        self.tree(spec, field).map(|t| t.ty)
    }
}

impl CalcTypes for CalcIndex {
    fn calc_type(&self, spec: &str, field: &str) -> Result<TypeInfo> {
        self.get(spec, field)
            .map(|e| e.tree.ty.clone())
            .ok_or_else(|| Error::UnknownField(format!("{spec}.{field}")))
    }
}

impl CalcIndex {
    /// Parses every calc in the registry, plans it and orders the result.
    pub fn build(registry: &Registry) -> Result<Self> {
        let resolver = TypeResolver {
            registry,
            trees: RefCell::new(BTreeMap::new()),
            stack: RefCell::new(Vec::new()),
        };

        let mut keys = Vec::new();
        for spec in registry.specs() {
            for field in spec.calc_fields() {
                keys.push((spec.name.clone(), field.name.clone()));
            }
        }

        let mut entries = BTreeMap::new();
        for (spec, field) in &keys {
            let tree = resolver.tree(spec, field).map_err(|e| match e {
                Error::BadExpression { message, token } => Error::BadExpression {
                    message: format!("{spec}.{field}: {message}"),
                    token,
                },
                other => other,
            })?;
            let deps = plan::resource_deps(&tree, registry)?;
            let forward = plan::forward_plan(&tree, registry)?;
            let reverse = plan::reverse_plans(&tree, spec, registry)?;
            let expr = registry
                .field(spec, field)
                .and_then(|f| f.calc_str.clone())
                .unwrap_or_default();
            entries.insert(
                (spec.clone(), field.clone()),
                CalcEntry {
                    spec: spec.clone(),
                    field: field.clone(),
                    expr,
                    tree,
                    deps,
                    forward,
                    reverse,
                    rank: 0,
                },
            );
        }

        let order = topo_order(&entries)?;
        for (rank, key) in order.iter().enumerate() {
            if let Some(entry) = entries.get_mut(key) {
                entry.rank = rank;
            }
        }
        Ok(Self { entries, order })
    }

    #[must_use]
    pub fn get(&self, spec: &str, field: &str) -> Option<&CalcEntry> {
        self.entries.get(&(spec.to_string(), field.to_string()))
    }

    #[must_use]
    pub fn deps(&self, spec: &str, field: &str) -> Option<&BTreeSet<String>> {
        self.get(spec, field).map(|e| &e.deps)
    }

    /// Calc keys in dependency order.
    #[must_use]
    pub fn topo_order(&self) -> &[CalcKey] {
        &self.order
    }

    pub fn entries(&self) -> impl Iterator<Item = &CalcEntry> {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }

    /// Calcs declared on `spec`, in dependency order.
    pub fn for_spec<'a>(&'a self, spec: &'a str) -> impl Iterator<Item = &'a CalcEntry> + 'a {
        self.entries().filter(move |e| e.spec == spec)
    }

    #[must_use]
    pub fn rank(&self, spec: &str, field: &str) -> usize {
        self.get(spec, field).map_or(usize::MAX, |e| e.rank)
    }

    /// Reverse plans to run for a change to a resource of `spec` touching
    /// `deps`.
    #[must_use]
    pub fn calcs_touched_by(&self, spec: &str, deps: &BTreeSet<String>) -> Vec<(&CalcEntry, &ReversePlan)> {
        self.entries()
            .flat_map(|entry| {
                entry
                    .reverse
                    .iter()
                    .filter(|p| p.start_spec == spec && deps.contains(&p.dep))
                    .map(move |p| (entry, p))
            })
            .collect()
    }

    /// Calcs that read `dep` (a `spec.field` or `root.name`).
    #[must_use]
    pub fn dependents_of(&self, dep: &str) -> Vec<&CalcEntry> {
        self.entries().filter(|e| e.deps.contains(dep)).collect()
    }
}

/// Kahn's algorithm over calc-to-calc edges, ties broken by key order.
fn topo_order(entries: &BTreeMap<CalcKey, CalcEntry>) -> Result<Vec<CalcKey>> {
    let mut incoming: BTreeMap<&CalcKey, BTreeSet<&CalcKey>> = BTreeMap::new();
    for (key, entry) in entries {
        let mut upstream = BTreeSet::new();
        for dep in &entry.deps {
            if let Some((spec, field)) = dep.split_once('.') {
                if let Some((other, _)) = entries.get_key_value(&(spec.to_string(), field.to_string())) {
                    upstream.insert(other);
                }
            }
        }
        incoming.insert(key, upstream);
    }

    let mut order = Vec::with_capacity(entries.len());
    let mut done: BTreeSet<&CalcKey> = BTreeSet::new();
    while done.len() < entries.len() {
        let ready: Vec<&CalcKey> = incoming
            .iter()
            .filter(|(k, ups)| !done.contains(*k) && ups.iter().all(|u| done.contains(u)))
            .map(|(k, _)| *k)
            .collect();
        if ready.is_empty() {
            let cycle = incoming
                .keys()
                .filter(|k| !done.contains(*k))
                .map(|(s, f)| format!("{s}.{f}"))
                .collect();
            return Err(Error::CircularCalc(cycle));
        }
        for key in ready {
            done.insert(key);
            order.push(key.clone());
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ValueType;
    use crate::schema::{Field, FieldKind, SchemaDef};

    fn registry(calcs: &[(&str, &str, &str)]) -> Result<Registry> {
        let mut def = SchemaDef::new();
        for spec in ["employee", "division", "calcs"] {
            def.add_spec(spec)?;
        }
        def.add_field("employee", Field::primitive("name", FieldKind::Str))?;
        def.add_field("employee", Field::primitive("age", FieldKind::Int))?;
        def.add_field("employee", Field::link("division", "division"))?;
        def.add_field("division", Field::primitive("yearly_sales", FieldKind::Int))?;
        def.add_field("division", Field::collection("staff", "employee"))?;
        def.add_field("root", Field::collection("employees", "employee"))?;
        def.add_field("root", Field::collection("calcs", "calcs"))?;
        for (spec, field, expr) in calcs {
            def.add_field(spec, Field::calc(field, expr))?;
        }
        Registry::from_def(&def)
    }

    #[test]
    fn test_deps_of_link_traversal() {
        let reg = registry(&[("employee", "sales", "self.division.yearly_sales")]).unwrap();
        let index = CalcIndex::build(&reg).unwrap();
        let deps: Vec<&str> = index
            .deps("employee", "sales")
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(deps, vec!["division.yearly_sales", "employee.division"]);
    }

    #[test]
    fn test_deps_of_root_aggregate_with_filter() {
        let reg = registry(&[("calcs", "older", "employees[age>30]")]).unwrap();
        let index = CalcIndex::build(&reg).unwrap();
        let deps = index.deps("calcs", "older").unwrap();
        assert!(deps.contains("root.employees"));
        assert!(deps.contains("employee.age"));
        assert_eq!(
            index.get("calcs", "older").unwrap().calc_type(),
            &TypeInfo::many(ValueType::Resource("employee".into()))
        );
    }

    #[test]
    fn test_reverse_dep_uses_mirrored_field() {
        let reg = registry(&[("division", "headcount_age", "sum(self.link_employee_division.age)")]).unwrap();
        let index = CalcIndex::build(&reg).unwrap();
        let deps = index.deps("division", "headcount_age").unwrap();
        assert!(deps.contains("employee.division"));
        assert!(deps.contains("employee.age"));
    }

    #[test]
    fn test_topo_order_puts_dependencies_first() {
        let reg = registry(&[
            ("employee", "c", "self.b * 2"),
            ("employee", "b", "self.a + 1"),
            ("employee", "a", "self.age + 1"),
        ])
        .unwrap();
        let index = CalcIndex::build(&reg).unwrap();
        let order: Vec<&str> = index.topo_order().iter().map(|(_, f)| f.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(index.rank("employee", "a") < index.rank("employee", "c"));
    }

    #[test]
    fn test_cycle_rejected() {
        let reg = registry(&[
            ("employee", "a", "self.b + 1"),
            ("employee", "b", "self.a + 1"),
        ])
        .unwrap();
        match CalcIndex::build(&reg) {
            Err(Error::CircularCalc(cycle)) => {
                assert!(cycle.contains(&"employee.a".to_string()));
                assert!(cycle.contains(&"employee.b".to_string()));
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_cycle_rejected() {
        let reg = registry(&[("employee", "a", "self.a + 1")]).unwrap();
        assert!(matches!(CalcIndex::build(&reg), Err(Error::CircularCalc(_))));
    }

    #[test]
    fn test_cross_spec_cycle_rejected() {
        let reg = registry(&[
            ("employee", "x", "self.division.y"),
            ("division", "y", "sum(self.staff.x)"),
        ])
        .unwrap();
        assert!(matches!(CalcIndex::build(&reg), Err(Error::CircularCalc(_))));
    }

    #[test]
    fn test_calcs_touched_by() {
        let reg = registry(&[("employee", "sales", "self.division.yearly_sales")]).unwrap();
        let index = CalcIndex::build(&reg).unwrap();
        let deps = BTreeSet::from(["division.yearly_sales".to_string()]);
        let touched = index.calcs_touched_by("division", &deps);
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].0.field, "sales");
        assert!(index.calcs_touched_by("employee", &deps).is_empty());
    }

    #[test]
    fn test_bad_expression_names_calc() {
        let reg = registry(&[("employee", "bad", "self.nope")]).unwrap();
        match CalcIndex::build(&reg) {
            Err(Error::BadExpression { message, token }) => {
                assert!(message.starts_with("employee.bad"));
                assert_eq!(token, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
