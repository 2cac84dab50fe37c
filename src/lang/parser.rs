//! Shift-reduce parser shared by calc expressions and URLs.
//!
//! After every shift the parser repeatedly tries an ordered list of
//! reduction rules against the top of the stack, consulting one token of
//! lookahead where precedence or postfix forms require it. Each grammar
//! (calc, filtered URL, canonical URL, bare filter) is just a different
//! rule list over the same engine.

use std::fmt;

use super::lexer::{Op, Tok, Token};
use super::tree::{BinOp, Literal};
use crate::error::{Error, Result};
use crate::types::ResourceId;

/// Untyped parse result, resolved into a [`super::Node`] afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Syntax {
    Name(String),
    Literal(Literal),
    Member(Box<Syntax>, String),
    IdSeg(Box<Syntax>, ResourceId),
    Filter(Box<Syntax>, Box<Syntax>),
    Call(String, Vec<Syntax>),
    Binary(BinOp, Box<Syntax>, Box<Syntax>),
    Neg(Box<Syntax>),
    Ternary(Box<Syntax>, Box<Syntax>, Box<Syntax>),
    Switch(Box<Syntax>, Vec<(Literal, Syntax)>),
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Syntax::Name(name) => f.write_str(name),
            Syntax::Literal(lit) => write!(f, "{}", super::emit::emit_literal(lit)),
            Syntax::Member(parent, name) => write!(f, "{parent}.{name}"),
            Syntax::IdSeg(parent, id) => write!(f, "{parent}/{}", id.encode()),
            Syntax::Filter(parent, cond) => write!(f, "{parent}[{cond}]"),
            Syntax::Call(name, args) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Syntax::Binary(op, lhs, rhs) => write!(f, "{lhs} {} {rhs}", op.symbol()),
            Syntax::Neg(inner) => write!(f, "-{inner}"),
            Syntax::Ternary(c, t, e) => write!(f, "{c} -> {t} : {e}"),
            Syntax::Switch(sel, _) => write!(f, "{sel} -> (...)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    Calc,
    Url,
    Canonical,
    Filter,
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    Member,
    UrlRoot,
    UrlMember,
    UrlId,
    Literal,
    Name,
    Filter,
    Call,
    Args,
    ArgsMore,
    Group,
    Case,
    CaseMore,
    Switch,
    Negate,
    Binary,
    Ternary,
}

const CALC_RULES: &[Rule] = &[
    Rule::Member,
    Rule::Literal,
    Rule::Name,
    Rule::Filter,
    Rule::Call,
    Rule::Args,
    Rule::ArgsMore,
    Rule::Group,
    Rule::Case,
    Rule::CaseMore,
    Rule::Switch,
    Rule::Negate,
    Rule::Binary,
    Rule::Ternary,
];

const URL_RULES: &[Rule] = &[
    Rule::UrlRoot,
    Rule::UrlMember,
    Rule::UrlId,
    Rule::Literal,
    Rule::Name,
    Rule::Filter,
    Rule::Group,
    Rule::Negate,
    Rule::Binary,
];

const CANONICAL_RULES: &[Rule] = &[Rule::UrlRoot, Rule::UrlMember, Rule::UrlId];

const FILTER_RULES: &[Rule] = &[
    Rule::Literal,
    Rule::Name,
    Rule::Group,
    Rule::Negate,
    Rule::Binary,
];

#[derive(Debug)]
enum Sym {
    Tok(Token),
    Expr(Syntax),
    Args(Vec<Syntax>),
    Cases(Vec<(Literal, Syntax)>),
}

impl Sym {
    fn tok(&self) -> Option<&Token> {
        match self {
            Sym::Tok(t) => Some(t),
            _ => None,
        }
    }

    fn is_op(&self, op: Op) -> bool {
        self.tok().is_some_and(|t| t.is_op(op))
    }

    fn is_expr(&self) -> bool {
        matches!(self, Sym::Expr(_))
    }

    fn is_name(&self) -> bool {
        matches!(self.tok(), Some(Token { tok: Tok::Name(_), .. }))
    }

    fn is_literal_expr(&self) -> bool {
        matches!(self, Sym::Expr(Syntax::Literal(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommaRole {
    Or,
    Arg,
    Case,
}

pub struct Parser {
    grammar: Grammar,
    rules: &'static [Rule],
    stack: Vec<Sym>,
}

impl Parser {
    #[must_use]
    pub fn new(grammar: Grammar) -> Self {
        let rules = match grammar {
            Grammar::Calc => CALC_RULES,
            Grammar::Url => URL_RULES,
            Grammar::Canonical => CANONICAL_RULES,
            Grammar::Filter => FILTER_RULES,
        };
        Self {
            grammar,
            rules,
            stack: Vec::new(),
        }
    }

    pub fn parse(mut self, tokens: Vec<Token>) -> Result<Syntax> {
        if tokens.is_empty() {
            return Err(Error::bad_expression("empty expression", ""));
        }
        let mut tokens = tokens.into_iter().peekable();
        while let Some(token) = tokens.next() {
            self.stack.push(Sym::Tok(token));
            self.reduce(tokens.peek())?;
        }

        match self.stack.as_slice() {
            [Sym::Expr(_)] => match self.stack.pop() {
                Some(Sym::Expr(syntax)) => Ok(syntax),
                _ => Err(Error::bad_expression("incomplete expression", "")),
            },
            _ => {
                let token = self
                    .stack
                    .iter()
                    .find_map(Sym::tok)
                    .map(|t| t.text.clone())
                    .unwrap_or_default();
                Err(Error::bad_expression("unexpected token", token))
            }
        }
    }

    fn reduce(&mut self, la: Option<&Token>) -> Result<()> {
        'restart: loop {
            for rule in self.rules {
                if self.apply(*rule, la)? {
                    continue 'restart;
                }
            }
            return Ok(());
        }
    }

    fn peek(&self, depth: usize) -> Option<&Sym> {
        self.stack.len().checked_sub(depth + 1).map(|i| &self.stack[i])
    }

    fn pop_expr(&mut self) -> Syntax {
        match self.stack.pop() {
            Some(Sym::Expr(s)) => s,
            _ => unreachable!("rule matched an expression"),
        }
    }

    fn pop_token(&mut self) -> Token {
        match self.stack.pop() {
            Some(Sym::Tok(t)) => t,
            _ => unreachable!("rule matched a token"),
        }
    }

    fn pop_name(&mut self) -> String {
        match self.pop_token().tok {
            Tok::Name(name) => name,
            _ => unreachable!("rule matched a name"),
        }
    }

    /// The innermost unmatched `(` or `[`, and the symbol below it.
    fn open_bracket(&self) -> Option<(Op, Option<&Sym>)> {
        let idx = self
            .stack
            .iter()
            .rposition(|s| s.is_op(Op::LParen) || s.is_op(Op::LBracket))?;
        let op = self.stack[idx].tok().and_then(Token::op)?;
        let below = idx.checked_sub(1).map(|i| &self.stack[i]);
        Some((op, below))
    }

    fn comma_role(&self) -> CommaRole {
        match self.open_bracket() {
            Some((Op::LParen, Some(below))) if self.grammar == Grammar::Calc && below.is_name() => {
                CommaRole::Arg
            }
            Some((Op::LParen, Some(below))) if below.is_op(Op::Arrow) => CommaRole::Case,
            _ => CommaRole::Or,
        }
    }

    fn binop(&self, token: &Token) -> Option<BinOp> {
        let op = token.op()?;
        match op {
            Op::Plus => Some(BinOp::Add),
            Op::Minus => Some(BinOp::Sub),
            Op::Star => Some(BinOp::Mul),
            Op::Slash if matches!(self.grammar, Grammar::Calc | Grammar::Filter) => Some(BinOp::Div),
            Op::Eq => Some(BinOp::Eq),
            Op::Gt => Some(BinOp::Gt),
            Op::Lt => Some(BinOp::Lt),
            Op::Ge => Some(BinOp::Ge),
            Op::Le => Some(BinOp::Le),
            Op::Like => Some(BinOp::Like),
            Op::And => Some(BinOp::And),
            Op::Or => Some(BinOp::Or),
            Op::Comma if self.comma_role() == CommaRole::Or => Some(BinOp::Or),
            _ => None,
        }
    }

    fn la_is(la: Option<&Token>, ops: &[Op]) -> bool {
        la.and_then(Token::op).is_some_and(|op| ops.contains(&op))
    }

    fn apply(&mut self, rule: Rule, la: Option<&Token>) -> Result<bool> {
        match rule {
            Rule::Member => {
                let matched = self.peek(0).is_some_and(Sym::is_name)
                    && self.peek(1).is_some_and(|s| s.is_op(Op::Dot))
                    && self.peek(2).is_some_and(Sym::is_expr);
                if !matched {
                    return Ok(false);
                }
                let name = self.pop_name();
                self.stack.pop();
                let parent = self.pop_expr();
                self.stack
                    .push(Sym::Expr(Syntax::Member(Box::new(parent), name)));
                Ok(true)
            }
            Rule::UrlRoot => {
                let name_on_top = self.peek(0).is_some_and(Sym::is_name);
                let bare = name_on_top && self.stack.len() == 1;
                let slashed = name_on_top
                    && self.stack.len() == 2
                    && self.peek(1).is_some_and(|s| s.is_op(Op::Slash));
                if !bare && !slashed {
                    return Ok(false);
                }
                let name = self.pop_name();
                self.stack.clear();
                self.stack.push(Sym::Expr(Syntax::Name(name)));
                Ok(true)
            }
            Rule::UrlMember => {
                let separator_ok = self.peek(1).is_some_and(|s| {
                    s.is_op(Op::Slash) || (self.grammar != Grammar::Canonical && s.is_op(Op::Dot))
                });
                let matched = self.peek(0).is_some_and(Sym::is_name)
                    && separator_ok
                    && self.peek(2).is_some_and(Sym::is_expr);
                if !matched {
                    return Ok(false);
                }
                let name = self.pop_name();
                self.stack.pop();
                let parent = self.pop_expr();
                self.stack
                    .push(Sym::Expr(Syntax::Member(Box::new(parent), name)));
                Ok(true)
            }
            Rule::UrlId => {
                let matched = matches!(self.peek(0), Some(Sym::Tok(Token { tok: Tok::Id(_), .. })))
                    && self.peek(1).is_some_and(|s| s.is_op(Op::Slash))
                    && self.peek(2).is_some_and(Sym::is_expr);
                if !matched {
                    return Ok(false);
                }
                let id = match self.pop_token().tok {
                    Tok::Id(id) => id,
                    _ => unreachable!("rule matched an id"),
                };
                self.stack.pop();
                let parent = self.pop_expr();
                self.stack
                    .push(Sym::Expr(Syntax::IdSeg(Box::new(parent), id)));
                Ok(true)
            }
            Rule::Literal => {
                let literal = match self.peek(0).and_then(Sym::tok).map(|t| &t.tok) {
                    Some(Tok::Int(i)) => Literal::Int(*i),
                    Some(Tok::Float(f)) => Literal::Float(*f),
                    Some(Tok::Str(s)) => Literal::Str(s.clone()),
                    Some(Tok::Bool(b)) => Literal::Bool(*b),
                    Some(Tok::Id(id)) => Literal::Id(id.clone()),
                    _ => return Ok(false),
                };
                self.stack.pop();
                self.stack.push(Sym::Expr(Syntax::Literal(literal)));
                Ok(true)
            }
            Rule::Name => {
                if !self.peek(0).is_some_and(Sym::is_name) {
                    return Ok(false);
                }
                if self.grammar == Grammar::Calc && Self::la_is(la, &[Op::LParen]) {
                    return Ok(false);
                }
                let name = self.pop_name();
                self.stack.push(Sym::Expr(Syntax::Name(name)));
                Ok(true)
            }
            Rule::Filter => {
                let matched = self.peek(0).is_some_and(|s| s.is_op(Op::RBracket))
                    && self.peek(1).is_some_and(Sym::is_expr)
                    && self.peek(2).is_some_and(|s| s.is_op(Op::LBracket))
                    && self.peek(3).is_some_and(Sym::is_expr);
                if !matched {
                    return Ok(false);
                }
                self.stack.pop();
                let cond = self.pop_expr();
                self.stack.pop();
                let parent = self.pop_expr();
                self.stack.push(Sym::Expr(Syntax::Filter(
                    Box::new(parent),
                    Box::new(cond),
                )));
                Ok(true)
            }
            Rule::Call => {
                if !self.peek(0).is_some_and(|s| s.is_op(Op::RParen)) {
                    return Ok(false);
                }
                let empty = self.peek(1).is_some_and(|s| s.is_op(Op::LParen))
                    && self.peek(2).is_some_and(Sym::is_name);
                let with_args = matches!(self.peek(1), Some(Sym::Expr(_) | Sym::Args(_)))
                    && self.peek(2).is_some_and(|s| s.is_op(Op::LParen))
                    && self.peek(3).is_some_and(Sym::is_name);
                if !empty && !with_args {
                    return Ok(false);
                }
                self.stack.pop();
                let args = if empty {
                    Vec::new()
                } else {
                    match self.stack.pop() {
                        Some(Sym::Expr(e)) => vec![e],
                        Some(Sym::Args(args)) => args,
                        _ => unreachable!("rule matched arguments"),
                    }
                };
                self.stack.pop();
                let name = self.pop_name();
                self.stack.push(Sym::Expr(Syntax::Call(name, args)));
                Ok(true)
            }
            Rule::Args => {
                let matched = self.peek(0).is_some_and(Sym::is_expr)
                    && self.peek(1).is_some_and(|s| s.is_op(Op::LParen))
                    && self.peek(2).is_some_and(Sym::is_name)
                    && Self::la_is(la, &[Op::Comma]);
                if !matched {
                    return Ok(false);
                }
                let first = self.pop_expr();
                self.stack.push(Sym::Args(vec![first]));
                Ok(true)
            }
            Rule::ArgsMore => {
                let matched = self.peek(0).is_some_and(Sym::is_expr)
                    && self.peek(1).is_some_and(|s| s.is_op(Op::Comma))
                    && matches!(self.peek(2), Some(Sym::Args(_)))
                    && Self::la_is(la, &[Op::Comma, Op::RParen]);
                if !matched {
                    return Ok(false);
                }
                let next = self.pop_expr();
                self.stack.pop();
                if let Some(Sym::Args(args)) = self.stack.last_mut() {
                    args.push(next);
                }
                Ok(true)
            }
            Rule::Group => {
                let matched = self.peek(0).is_some_and(|s| s.is_op(Op::RParen))
                    && self.peek(1).is_some_and(Sym::is_expr)
                    && self.peek(2).is_some_and(|s| s.is_op(Op::LParen))
                    && !self.peek(3).is_some_and(Sym::is_name);
                if !matched {
                    return Ok(false);
                }
                self.stack.pop();
                let inner = self.pop_expr();
                self.stack.pop();
                self.stack.push(Sym::Expr(inner));
                Ok(true)
            }
            Rule::Case => {
                let matched = self.peek(0).is_some_and(Sym::is_expr)
                    && self.peek(1).is_some_and(|s| s.is_op(Op::Colon))
                    && self.peek(2).is_some_and(Sym::is_literal_expr)
                    && self.peek(3).is_some_and(|s| s.is_op(Op::LParen))
                    && self.peek(4).is_some_and(|s| s.is_op(Op::Arrow))
                    && Self::la_is(la, &[Op::Comma, Op::RParen]);
                if !matched {
                    return Ok(false);
                }
                let (literal, body) = self.pop_case();
                self.stack.push(Sym::Cases(vec![(literal, body)]));
                Ok(true)
            }
            Rule::CaseMore => {
                let matched = self.peek(0).is_some_and(Sym::is_expr)
                    && self.peek(1).is_some_and(|s| s.is_op(Op::Colon))
                    && self.peek(2).is_some_and(Sym::is_literal_expr)
                    && self.peek(3).is_some_and(|s| s.is_op(Op::Comma))
                    && matches!(self.peek(4), Some(Sym::Cases(_)))
                    && Self::la_is(la, &[Op::Comma, Op::RParen]);
                if !matched {
                    return Ok(false);
                }
                let case = self.pop_case();
                self.stack.pop();
                if let Some(Sym::Cases(cases)) = self.stack.last_mut() {
                    cases.push(case);
                }
                Ok(true)
            }
            Rule::Switch => {
                let matched = self.peek(0).is_some_and(|s| s.is_op(Op::RParen))
                    && matches!(self.peek(1), Some(Sym::Cases(_)))
                    && self.peek(2).is_some_and(|s| s.is_op(Op::LParen))
                    && self.peek(3).is_some_and(|s| s.is_op(Op::Arrow))
                    && self.peek(4).is_some_and(Sym::is_expr);
                if !matched {
                    return Ok(false);
                }
                self.stack.pop();
                let cases = match self.stack.pop() {
                    Some(Sym::Cases(cases)) => cases,
                    _ => unreachable!("rule matched cases"),
                };
                self.stack.pop();
                self.stack.pop();
                let selector = self.pop_expr();
                self.stack
                    .push(Sym::Expr(Syntax::Switch(Box::new(selector), cases)));
                Ok(true)
            }
            Rule::Negate => {
                let matched = self.peek(0).is_some_and(Sym::is_expr)
                    && self.peek(1).is_some_and(|s| s.is_op(Op::Minus))
                    && !self.peek(2).is_some_and(Sym::is_expr)
                    && !Self::la_is(la, &[Op::Dot, Op::LBracket]);
                if !matched {
                    return Ok(false);
                }
                let inner = self.pop_expr();
                self.stack.pop();
                let negated = match inner {
                    Syntax::Literal(Literal::Int(i)) => Syntax::Literal(Literal::Int(-i)),
                    Syntax::Literal(Literal::Float(f)) => Syntax::Literal(Literal::Float(-f)),
                    other => Syntax::Neg(Box::new(other)),
                };
                self.stack.push(Sym::Expr(negated));
                Ok(true)
            }
            Rule::Binary => {
                let op = match (self.peek(0), self.peek(1), self.peek(2)) {
                    (Some(Sym::Expr(_)), Some(Sym::Tok(t)), Some(Sym::Expr(_))) => self.binop(t),
                    _ => None,
                };
                let Some(op) = op else {
                    return Ok(false);
                };
                if Self::la_is(la, &[Op::Dot, Op::LBracket]) {
                    return Ok(false);
                }
                if let Some(next) = la.and_then(|t| self.binop(t)) {
                    if next.precedence() > op.precedence() {
                        return Ok(false);
                    }
                }
                let rhs = self.pop_expr();
                self.stack.pop();
                let lhs = self.pop_expr();
                self.stack.push(Sym::Expr(Syntax::Binary(
                    op,
                    Box::new(lhs),
                    Box::new(rhs),
                )));
                Ok(true)
            }
            Rule::Ternary => {
                let matched = self.peek(0).is_some_and(Sym::is_expr)
                    && self.peek(1).is_some_and(|s| s.is_op(Op::Colon))
                    && self.peek(2).is_some_and(Sym::is_expr)
                    && self.peek(3).is_some_and(|s| s.is_op(Op::Arrow))
                    && self.peek(4).is_some_and(Sym::is_expr);
                if !matched {
                    return Ok(false);
                }
                if Self::la_is(la, &[Op::Dot, Op::LBracket, Op::Arrow])
                    || la.and_then(|t| self.binop(t)).is_some()
                {
                    return Ok(false);
                }
                let otherwise = self.pop_expr();
                self.stack.pop();
                let then = self.pop_expr();
                self.stack.pop();
                let cond = self.pop_expr();
                self.stack.push(Sym::Expr(Syntax::Ternary(
                    Box::new(cond),
                    Box::new(then),
                    Box::new(otherwise),
                )));
                Ok(true)
            }
        }
    }

    fn pop_case(&mut self) -> (Literal, Syntax) {
        let body = self.pop_expr();
        self.stack.pop();
        match self.pop_expr() {
            Syntax::Literal(literal) => (literal, body),
            _ => unreachable!("rule matched a literal"),
        }
    }
}

pub fn parse_syntax(grammar: Grammar, tokens: Vec<Token>) -> Result<Syntax> {
    Parser::new(grammar).parse(tokens)
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn calc(s: &str) -> Syntax {
        parse_syntax(Grammar::Calc, tokenize(s).unwrap()).unwrap()
    }

    fn name(n: &str) -> Box<Syntax> {
        Box::new(Syntax::Name(n.to_string()))
    }

    fn member(parent: Box<Syntax>, n: &str) -> Box<Syntax> {
        Box::new(Syntax::Member(parent, n.to_string()))
    }

    fn int(i: i64) -> Box<Syntax> {
        Box::new(Syntax::Literal(Literal::Int(i)))
    }

    #[test]
    fn test_dotted_ref() {
        assert_eq!(
            calc("self.division.name"),
            *member(member(name("self"), "division"), "name")
        );
    }

    #[test]
    fn test_precedence_mul_over_add() {
        assert_eq!(
            calc("self.a + self.b * 2"),
            Syntax::Binary(
                BinOp::Add,
                member(name("self"), "a"),
                Box::new(Syntax::Binary(BinOp::Mul, member(name("self"), "b"), int(2))),
            )
        );
    }

    #[test]
    fn test_left_associative_subtraction() {
        assert_eq!(
            calc("10 - 3 - 2"),
            Syntax::Binary(
                BinOp::Sub,
                Box::new(Syntax::Binary(BinOp::Sub, int(10), int(3))),
                int(2),
            )
        );
    }

    #[test]
    fn test_grouping() {
        assert_eq!(
            calc("(1 + 2) * 3"),
            Syntax::Binary(
                BinOp::Mul,
                Box::new(Syntax::Binary(BinOp::Add, int(1), int(2))),
                int(3),
            )
        );
    }

    #[test]
    fn test_filter_with_comma_or() {
        assert_eq!(
            calc("employees[age>30, age<5]"),
            Syntax::Filter(
                name("employees"),
                Box::new(Syntax::Binary(
                    BinOp::Or,
                    Box::new(Syntax::Binary(BinOp::Gt, name("age"), int(30))),
                    Box::new(Syntax::Binary(BinOp::Lt, name("age"), int(5))),
                )),
            )
        );
    }

    #[test]
    fn test_function_call_args() {
        assert_eq!(
            calc("round(self.x / 3, 2)"),
            Syntax::Call(
                "round".into(),
                vec![
                    Syntax::Binary(BinOp::Div, member(name("self"), "x"), int(3)),
                    Syntax::Literal(Literal::Int(2)),
                ],
            )
        );
    }

    #[test]
    fn test_aggregate_call() {
        assert_eq!(
            calc("max(employees.age)"),
            Syntax::Call("max".into(), vec![*member(name("employees"), "age")])
        );
    }

    #[test]
    fn test_ternary_condition_binds_loosest() {
        assert_eq!(
            calc("self.age > 30 -> 1 : 2"),
            Syntax::Ternary(
                Box::new(Syntax::Binary(BinOp::Gt, member(name("self"), "age"), int(30))),
                int(1),
                int(2),
            )
        );
    }

    #[test]
    fn test_nested_ternary_right_associative() {
        assert_eq!(
            calc("self.a -> 1 : self.b -> 2 : 3"),
            Syntax::Ternary(
                member(name("self"), "a"),
                int(1),
                Box::new(Syntax::Ternary(member(name("self"), "b"), int(2), int(3))),
            )
        );
    }

    #[test]
    fn test_switch() {
        assert_eq!(
            calc("self.name -> ('Bob': 22, 'Ned': 11)"),
            Syntax::Switch(
                member(name("self"), "name"),
                vec![
                    (Literal::Str("Bob".into()), Syntax::Literal(Literal::Int(22))),
                    (Literal::Str("Ned".into()), Syntax::Literal(Literal::Int(11))),
                ],
            )
        );
    }

    #[test]
    fn test_ternary_with_grouped_branch() {
        assert_eq!(
            calc("self.a -> (1 + 2) : 3"),
            Syntax::Ternary(
                member(name("self"), "a"),
                Box::new(Syntax::Binary(BinOp::Add, int(1), int(2))),
                int(3),
            )
        );
    }

    #[test]
    fn test_unary_minus() {
        assert_eq!(
            calc("2 * -3"),
            Syntax::Binary(BinOp::Mul, int(2), int(-3))
        );
        assert_eq!(
            calc("-self.x"),
            Syntax::Neg(member(name("self"), "x"))
        );
    }

    #[test]
    fn test_filter_then_member() {
        assert_eq!(
            calc("employees[age>30].name"),
            *member(
                Box::new(Syntax::Filter(
                    name("employees"),
                    Box::new(Syntax::Binary(BinOp::Gt, name("age"), int(30))),
                )),
                "name"
            )
        );
    }

    #[test]
    fn test_unbalanced_reports_token() {
        let err = parse_syntax(Grammar::Calc, tokenize("(self.a + 1").unwrap()).unwrap_err();
        match err {
            Error::BadExpression { token, .. } => assert_eq!(token, "("),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_dangling_operator() {
        assert!(parse_syntax(Grammar::Calc, tokenize("self.a +").unwrap()).is_err());
    }

    #[test]
    fn test_url_segments() {
        let syntax = parse_syntax(
            Grammar::Url,
            tokenize("/employees/ID5e1b3c9f0a1b2c3d4e5f6a7b/laptops[name='x']").unwrap(),
        )
        .unwrap();
        let id = ResourceId::from_hex("5e1b3c9f0a1b2c3d4e5f6a7b").unwrap();
        assert_eq!(
            syntax,
            Syntax::Filter(
                member(Box::new(Syntax::IdSeg(name("employees"), id)), "laptops"),
                Box::new(Syntax::Binary(
                    BinOp::Eq,
                    name("name"),
                    Box::new(Syntax::Literal(Literal::Str("x".into()))),
                )),
            )
        );
    }

    #[test]
    fn test_url_dotted() {
        let syntax = parse_syntax(Grammar::Url, tokenize("employees.laptops").unwrap()).unwrap();
        assert_eq!(syntax, *member(name("employees"), "laptops"));
    }

    #[test]
    fn test_canonical_rejects_filters() {
        assert!(parse_syntax(Grammar::Canonical, tokenize("/employees[age>1]").unwrap()).is_err());
        assert!(parse_syntax(Grammar::Canonical, tokenize("/employees.laptops").unwrap()).is_err());
    }

    #[test]
    fn test_bare_filter() {
        let syntax = parse_syntax(Grammar::Filter, tokenize("age>30 & name~'bo'").unwrap()).unwrap();
        assert!(matches!(syntax, Syntax::Binary(BinOp::And, _, _)));
    }
}
