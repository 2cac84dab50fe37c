pub mod emit;
mod lexer;
mod parser;
mod resolve;
mod tree;

pub use emit::{emit, emit_cond, emit_literal, emit_url};
pub use lexer::tokenize;
pub use parser::{Grammar, Syntax, parse_syntax};
pub use resolve::CalcTypes;
pub use tree::{BinOp, Cond, Func, Literal, Node, NodeKind, RefKind, TypeInfo, ValueType};

use resolve::Resolver;

use crate::error::{Error, Result};
use crate::schema::Registry;

/// Parses and type-checks a calc expression declared on `spec`.
pub fn parse_calc(registry: &Registry, spec: &str, expr: &str, types: &dyn CalcTypes) -> Result<Node> {
    let syntax = parse_syntax(Grammar::Calc, tokenize(expr)?)?;
    Resolver::new(registry, types, Some(spec)).resolve(&syntax)
}

/// Parses a filtered URL such as `/employees[age>30]/ID…/laptops`.
pub fn parse_url(registry: &Registry, types: &dyn CalcTypes, url: &str) -> Result<Node> {
    parse_path(registry, types, Grammar::Url, url)
}

/// Parses a canonical URL: `/`-separated names and ids, no filters.
pub fn parse_canonical_url(registry: &Registry, types: &dyn CalcTypes, url: &str) -> Result<Node> {
    parse_path(registry, types, Grammar::Canonical, url)
}

fn parse_path(registry: &Registry, types: &dyn CalcTypes, grammar: Grammar, url: &str) -> Result<Node> {
    let trimmed = url.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::BadRequest("empty path".into()));
    }
    let syntax = parse_syntax(grammar, tokenize(trimmed)?)?;
    let node = Resolver::new(registry, types, None).resolve(&syntax)?;
    if !node.is_chain() {
        return Err(Error::bad_expression("not a resource path", url));
    }
    Ok(node)
}

/// Parses a standalone filter condition over the fields of `spec`.
pub fn parse_filter(registry: &Registry, types: &dyn CalcTypes, spec: &str, text: &str) -> Result<Cond> {
    let syntax = parse_syntax(Grammar::Filter, tokenize(text)?)?;
    Resolver::new(registry, types, None).condition(spec, &syntax)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldKind, SchemaDef};

    struct Fixed;

    impl CalcTypes for Fixed {
        fn calc_type(&self, spec: &str, field: &str) -> Result<TypeInfo> {
            match (spec, field) {
                ("employee", "older") => Ok(TypeInfo::scalar(ValueType::Int)),
                ("employee", "boss") => Ok(TypeInfo::scalar(ValueType::Resource("employee".into()))),
                _ => Err(Error::UnknownField(format!("{spec}.{field}"))),
            }
        }
    }

    fn registry() -> Registry {
        let mut def = SchemaDef::new();
        for spec in ["employee", "division", "calcs"] {
            def.add_spec(spec).unwrap();
        }
        let employee = [
            Field::primitive("name", FieldKind::Str),
            Field::primitive("age", FieldKind::Int),
            Field::primitive("salary", FieldKind::Float),
            Field::primitive("hired", FieldKind::Datetime),
            Field::primitive("active", FieldKind::Bool),
            Field::link("division", "division"),
            Field::calc("older", "self.age + 1"),
            Field::calc("boss", "self.division.manager"),
        ];
        for field in employee {
            def.add_field("employee", field).unwrap();
        }
        def.add_field("division", Field::primitive("yearly_sales", FieldKind::Int))
            .unwrap();
        def.add_field("division", Field::link("manager", "employee"))
            .unwrap();
        def.add_field("division", Field::collection("staff", "employee"))
            .unwrap();
        def.add_field("root", Field::collection("employees", "employee"))
            .unwrap();
        def.add_field("root", Field::collection("divisions", "division"))
            .unwrap();
        def.add_field("root", Field::collection("calcs", "calcs"))
            .unwrap();
        Registry::from_def(&def).unwrap()
    }

    fn calc(spec: &str, expr: &str) -> Result<Node> {
        parse_calc(&registry(), spec, expr, &Fixed)
    }

    #[test]
    fn test_types_of_refs() {
        let node = calc("employee", "self.division.yearly_sales").unwrap();
        assert_eq!(node.ty, TypeInfo::scalar(ValueType::Int));

        let node = calc("calcs", "employees.age").unwrap();
        assert_eq!(node.ty, TypeInfo::many(ValueType::Int));

        let node = calc("employee", "self.division.staff").unwrap();
        assert_eq!(node.ty, TypeInfo::many(ValueType::Resource("employee".into())));
    }

    #[test]
    fn test_reverse_ref_kind() {
        let node = calc("division", "self.link_employee_division").unwrap();
        assert!(matches!(
            node.kind,
            NodeKind::Ref {
                kind: RefKind::ReverseLink,
                ..
            }
        ));
        assert!(node.ty.collection);

        let node = calc("employee", "self.parent_division_staff.yearly_sales").unwrap();
        assert_eq!(node.ty, TypeInfo::scalar(ValueType::Int));
    }

    #[test]
    fn test_calc_refs_use_inferred_type() {
        let node = calc("employee", "self.older * 2").unwrap();
        assert_eq!(node.ty, TypeInfo::scalar(ValueType::Int));
        let node = calc("employee", "self.boss.name").unwrap();
        assert_eq!(node.ty, TypeInfo::scalar(ValueType::Str));
    }

    #[test]
    fn test_aggregates() {
        assert_eq!(
            calc("calcs", "max(employees.age)").unwrap().ty,
            TypeInfo::scalar(ValueType::Int)
        );
        assert_eq!(
            calc("calcs", "average(employees.age)").unwrap().ty,
            TypeInfo::scalar(ValueType::Float)
        );
        assert_eq!(
            calc("calcs", "first(employees[age>30])").unwrap().ty,
            TypeInfo::scalar(ValueType::Resource("employee".into()))
        );
        assert!(calc("calcs", "sum(employees.name)").is_err());
        assert!(calc("employee", "sum(self.age)").is_err());
        assert!(calc("calcs", "first(employees).division").is_err());
        assert!(calc("calcs", "max(employees.age, 2)").is_err());
    }

    #[test]
    fn test_unknown_field_and_root() {
        let err = calc("employee", "self.nope").unwrap_err();
        assert!(matches!(err, Error::BadExpression { ref token, .. } if token == "nope"));
        assert!(calc("employee", "nobody.age").is_err());
    }

    #[test]
    fn test_filter_literal_types() {
        assert!(calc("calcs", "employees[age>30]").is_ok());
        assert!(calc("calcs", "employees[age>'old']").is_err());
        assert!(calc("calcs", "employees[name~'^b']").is_ok());
        assert!(calc("calcs", "employees[age~'1']").is_err());
        assert!(calc("calcs", "employees[hired>'2020-01-01T00:00:00Z']").is_ok());
        assert!(calc("calcs", "employees[active=true]").is_ok());
        assert!(calc("calcs", "employees[active>false]").is_err());
        assert!(calc("calcs", "employees[age=true]").is_err());
    }

    #[test]
    fn test_ternary_branch_types() {
        assert_eq!(
            calc("employee", "self.age > 30 -> 1 : 2.5").unwrap().ty,
            TypeInfo::scalar(ValueType::Float)
        );
        assert!(calc("employee", "self.age > 30 -> 'a' : 2").is_err());
        assert!(calc("employee", "self.age -> 1 : 2").is_err());
        assert!(calc("employee", "self.age > 1 -> (self.age > 2 -> 'x' : 3) : 4").is_err());
    }

    #[test]
    fn test_switch_types() {
        assert_eq!(
            calc("employee", "self.name -> ('Bob': 22, 'Ned': 11)").unwrap().ty,
            TypeInfo::scalar(ValueType::Int)
        );
        assert!(calc("employee", "self.name -> (1: 22)").is_err());
        assert_eq!(
            calc("employee", "self.active = true").unwrap().ty,
            TypeInfo::scalar(ValueType::Bool)
        );
    }

    #[test]
    fn test_datetime_arithmetic() {
        assert_eq!(
            calc("employee", "self.hired - days(2)").unwrap().ty,
            TypeInfo::scalar(ValueType::Datetime)
        );
        assert!(calc("employee", "self.hired * 2").is_err());
    }

    #[test]
    fn test_arithmetic_requires_scalars() {
        assert!(calc("calcs", "employees.age + 1").is_err());
        assert_eq!(
            calc("employee", "self.age / 2").unwrap().ty,
            TypeInfo::scalar(ValueType::Float)
        );
    }

    #[test]
    fn test_emit_round_trip() {
        let cases = [
            ("employee", "self.division.yearly_sales * 2 + self.age"),
            ("employee", "(self.age + 1) * 2"),
            ("employee", "self.age - -3"),
            ("employee", "-self.salary / 2"),
            ("employee", "self.age > 30 & self.name ~ 'b' | self.age < 5"),
            ("employee", "self.name -> ('Bob': 22, 'Ned': -11)"),
            ("employee", "self.age > 30 -> self.salary : round(self.salary, 1)"),
            ("employee", "self.hired - days(2)"),
            ("employee", "self.active -> (true: 1, false: 0)"),
            ("calcs", "employees[active=false]"),
            ("calcs", "sum(employees[age>30, name='it\\'s'].salary)"),
            ("calcs", "first(employees[age>=1 & (age<5 | age=9)])"),
        ];
        for (spec, expr) in cases {
            let tree = calc(spec, expr).unwrap();
            let again = calc(spec, &emit(&tree)).unwrap();
            assert_eq!(tree, again, "{expr} -> {}", emit(&tree));
        }
    }

    #[test]
    fn test_parse_url() {
        let reg = registry();
        let node = parse_url(&reg, &Fixed, "/divisions/ID5e1b3c9f0a1b2c3d4e5f6a7b/staff[age>1]").unwrap();
        assert_eq!(node.ty, TypeInfo::many(ValueType::Resource("employee".into())));
        assert_eq!(node.chain_root(), Some("divisions"));

        let node = parse_canonical_url(&reg, &Fixed, "/employees/ID5e1b3c9f0a1b2c3d4e5f6a7b/").unwrap();
        assert_eq!(node.ty, TypeInfo::scalar(ValueType::Resource("employee".into())));
        assert_eq!(emit_url(&node), "/employees/ID5e1b3c9f0a1b2c3d4e5f6a7b");

        assert!(parse_url(&reg, &Fixed, "/self").is_err());
        assert!(parse_url(&reg, &Fixed, "/employees/ID5e1b3c9f0a1b2c3d4e5f6a7b/ID5e1b3c9f0a1b2c3d4e5f6a7b").is_err());
    }

    #[test]
    fn test_parse_filter() {
        let cond = parse_filter(&registry(), &Fixed, "employee", "age>30,name='x'").unwrap();
        assert!(matches!(cond, Cond::Or(_, _)));
        assert!(parse_filter(&registry(), &Fixed, "employee", "age").is_err());
    }
}
