use crate::error::{Error, Result};
use crate::types::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
    And,
    Or,
    Comma,
    Arrow,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Id(ResourceId),
    Op(Op),
}

/// A token with the source text it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub text: String,
    pub pos: usize,
}

impl Token {
    #[must_use]
    pub fn op(&self) -> Option<Op> {
        match self.tok {
            Tok::Op(op) => Some(op),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_op(&self, op: Op) -> bool {
        self.op() == Some(op)
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let tok = match text.as_str() {
                "true" => Tok::Bool(true),
                "false" => Tok::Bool(false),
                _ if ResourceId::is_encoded(&text) => Tok::Id(ResourceId::decode(&text)?),
                _ => Tok::Name(text.clone()),
            };
            tokens.push(Token {
                tok,
                text,
                pos: start,
            });
            continue;
        }

        if c.is_ascii_digit() {
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let tok = if is_float {
                Tok::Float(
                    text.parse()
                        .map_err(|_| Error::bad_expression("invalid number", &text))?,
                )
            } else {
                Tok::Int(
                    text.parse()
                        .map_err(|_| Error::bad_expression("invalid number", &text))?,
                )
            };
            tokens.push(Token {
                tok,
                text,
                pos: start,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut value = String::new();
            loop {
                match chars.get(i) {
                    None => {
                        let text: String = chars[start..].iter().collect();
                        return Err(Error::bad_expression("unterminated string", text));
                    }
                    Some('\\') if chars.get(i + 1).is_some() => {
                        value.push(chars[i + 1]);
                        i += 2;
                    }
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(&ch) => {
                        value.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token {
                tok: Tok::Str(value),
                text: chars[start..i].iter().collect(),
                pos: start,
            });
            continue;
        }

        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let (op, len) = match two.as_str() {
            ">=" => (Op::Ge, 2),
            "<=" => (Op::Le, 2),
            "->" => (Op::Arrow, 2),
            _ => match c {
                '+' => (Op::Plus, 1),
                '-' => (Op::Minus, 1),
                '*' => (Op::Star, 1),
                '/' => (Op::Slash, 1),
                '=' => (Op::Eq, 1),
                '>' => (Op::Gt, 1),
                '<' => (Op::Lt, 1),
                '~' => (Op::Like, 1),
                '&' => (Op::And, 1),
                '|' => (Op::Or, 1),
                ',' => (Op::Comma, 1),
                ':' => (Op::Colon, 1),
                '(' => (Op::LParen, 1),
                ')' => (Op::RParen, 1),
                '[' => (Op::LBracket, 1),
                ']' => (Op::RBracket, 1),
                '.' => (Op::Dot, 1),
                other => {
                    return Err(Error::bad_expression(
                        "unexpected character",
                        other.to_string(),
                    ));
                }
            },
        };
        i += len;
        tokens.push(Token {
            tok: Tok::Op(op),
            text: chars[start..i].iter().collect(),
            pos: start,
        });
    }

    Ok(tokens)
}
