use super::tree::{Cond, Literal, Node, NodeKind};

// Compound operands are always parenthesized so output parses back to the same tree.

pub fn emit_literal(literal: &Literal) -> String {
    match literal {
        Literal::Int(i) => i.to_string(),
        Literal::Float(f) => {
            let text = f.to_string();
            if text.contains('.') || !f.is_finite() {
                text
            } else {
                format!("{text}.0")
            }
        }
        Literal::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Literal::Bool(b) => b.to_string(),
        Literal::Id(id) => id.encode(),
    }
}

pub fn emit_cond(cond: &Cond) -> String {
    match cond {
        Cond::Compare { field, op, value } => {
            format!("{field} {} {}", op.symbol(), emit_literal(value))
        }
        Cond::And(a, b) => format!("{} & {}", emit_cond_operand(a), emit_cond_operand(b)),
        Cond::Or(a, b) => format!("{} | {}", emit_cond_operand(a), emit_cond_operand(b)),
    }
}

fn emit_cond_operand(cond: &Cond) -> String {
    match cond {
        Cond::Compare { .. } => emit_cond(cond),
        _ => format!("({})", emit_cond(cond)),
    }
}

/// Renders a calc expression.
pub fn emit(node: &Node) -> String {
    match &node.kind {
        NodeKind::Root { name } => name.clone(),
        NodeKind::Ref { parent, field, .. } => format!("{}.{field}", emit(parent)),
        NodeKind::IdMatch { parent, id } => format!("{}/{}", emit(parent), id.encode()),
        NodeKind::Filtered { parent, cond } => format!("{}[{}]", emit(parent), emit_cond(cond)),
        NodeKind::Call { func, args } => {
            let args: Vec<String> = args.iter().map(emit).collect();
            format!("{}({})", func.name(), args.join(", "))
        }
        NodeKind::Binary { op, lhs, rhs } => {
            format!("{} {} {}", operand(lhs), op.symbol(), operand(rhs))
        }
        NodeKind::Negate(inner) => format!("-{}", operand(inner)),
        NodeKind::Ternary {
            cond,
            then,
            otherwise,
        } => format!("{} -> {} : {}", operand(cond), operand(then), operand(otherwise)),
        NodeKind::Switch { selector, cases } => {
            let cases: Vec<String> = cases
                .iter()
                .map(|(lit, body)| format!("{}: {}", emit_literal(lit), operand(body)))
                .collect();
            format!("{} -> ({})", operand(selector), cases.join(", "))
        }
        NodeKind::Const(literal) => emit_literal(literal),
    }
}

fn operand(node: &Node) -> String {
    match &node.kind {
        NodeKind::Binary { .. } | NodeKind::Ternary { .. } | NodeKind::Switch { .. } | NodeKind::Negate(_) => {
            format!("({})", emit(node))
        }
        NodeKind::Const(Literal::Int(i)) if *i < 0 => format!("({})", emit(node)),
        NodeKind::Const(Literal::Float(f)) if *f < 0.0 => format!("({})", emit(node)),
        _ => emit(node),
    }
}

/// Renders a URL node with `/` separators.
pub fn emit_url(node: &Node) -> String {
    match &node.kind {
        NodeKind::Root { name } => format!("/{name}"),
        NodeKind::Ref { parent, field, .. } => format!("{}/{field}", emit_url(parent)),
        NodeKind::IdMatch { parent, id } => format!("{}/{}", emit_url(parent), id.encode()),
        NodeKind::Filtered { parent, cond } => format!("{}[{}]", emit_url(parent), emit_cond(cond)),
        _ => emit(node),
    }
}
