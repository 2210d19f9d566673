//! Restricted SQL-WHERE filter over the documents table. Filters arrive as
//! ad-hoc strings; parsing them into an AST and re-emitting the predicate
//! keeps injection out and the surface identical regardless of backend.
//!
//! Supported: `=`, `!=`, `LIKE`, `LOWER()`, `IN (...)`, `AND`, `OR`,
//! parentheses, single-quoted strings with `''` escaping.

use std::fmt::Write as _;

use crate::error::{Error, Result};

const DOCUMENT_COLUMNS: &[&str] = &[
    "id",
    "uri",
    "title",
    "content",
    "metadata",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(String),
    Lower(Box<Operand>),
    Literal(Literal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Cmp {
        op: CmpOp,
        left: Operand,
        right: Operand,
    },
    In {
        operand: Operand,
        values: Vec<Literal>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// Parse a filter string into its AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::InvalidInput(format!(
            "unexpected trailing input in filter at token {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

/// Parse and compile a filter into a backend predicate string.
pub fn compile(input: &str) -> Result<String> {
    Ok(emit(&parse(input)?))
}

fn emit(expr: &Expr) -> String {
    match expr {
        Expr::Cmp { op, left, right } => {
            let op = match op {
                CmpOp::Eq => "=",
                CmpOp::Ne => "!=",
                CmpOp::Like => "LIKE",
            };
            format!("({} {} {})", emit_operand(left), op, emit_operand(right))
        }
        Expr::In { operand, values } => {
            let list = values
                .iter()
                .map(emit_literal)
                .collect::<Vec<_>>()
                .join(", ");
            format!("({} IN ({}))", emit_operand(operand), list)
        }
        Expr::And(l, r) => format!("({} AND {})", emit(l), emit(r)),
        Expr::Or(l, r) => format!("({} OR {})", emit(l), emit(r)),
    }
}

fn emit_operand(operand: &Operand) -> String {
    match operand {
        Operand::Column(name) => name.clone(),
        Operand::Lower(inner) => format!("lower({})", emit_operand(inner)),
        Operand::Literal(lit) => emit_literal(lit),
    }
}

fn emit_literal(lit: &Literal) -> String {
    match lit {
        Literal::Str(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('\'');
            for c in s.chars() {
                if c == '\'' {
                    out.push('\'');
                }
                out.push(c);
            }
            out.push('\'');
            out
        }
        Literal::Num(n) => {
            let mut out = String::new();
            let _ = write!(out, "{n}");
            out
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Eq,
    Ne,
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Like,
    In,
    Lower,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(Error::InvalidInput("stray '!' in filter".into()));
                }
            }
            '<' | '>' => {
                return Err(Error::InvalidInput(format!(
                    "operator '{c}' is not supported in filters"
                )));
            }
            '\'' => {
                // Single-quoted string; '' is an escaped quote.
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(Error::InvalidInput(
                                "unterminated string literal in filter".into(),
                            ))
                        }
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| Error::InvalidInput(format!("bad number '{text}' in filter")))?;
                tokens.push(Token::Num(num));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "LIKE" => Token::Like,
                    "IN" => Token::In,
                    "LOWER" => Token::Lower,
                    _ => Token::Ident(word),
                });
            }
            _ => {
                return Err(Error::InvalidInput(format!(
                    "unexpected character '{c}' in filter"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(Error::InvalidInput(format!(
                "expected {expected:?} in filter, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_primary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::LParen) {
            // Could be a parenthesized expression; operands never start a
            // primary with '(' in this grammar.
            self.next();
            let expr = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(expr);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;
        match self.next() {
            Some(Token::Eq) => Ok(Expr::Cmp {
                op: CmpOp::Eq,
                left,
                right: self.parse_operand()?,
            }),
            Some(Token::Ne) => Ok(Expr::Cmp {
                op: CmpOp::Ne,
                left,
                right: self.parse_operand()?,
            }),
            Some(Token::Like) => Ok(Expr::Cmp {
                op: CmpOp::Like,
                left,
                right: self.parse_operand()?,
            }),
            Some(Token::In) => {
                self.expect(Token::LParen)?;
                let mut values = Vec::new();
                loop {
                    match self.next() {
                        Some(Token::Str(s)) => values.push(Literal::Str(s)),
                        Some(Token::Num(n)) => values.push(Literal::Num(n)),
                        other => {
                            return Err(Error::InvalidInput(format!(
                                "expected literal in IN list, found {other:?}"
                            )))
                        }
                    }
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        other => {
                            return Err(Error::InvalidInput(format!(
                                "expected ',' or ')' in IN list, found {other:?}"
                            )))
                        }
                    }
                }
                Ok(Expr::In {
                    operand: left,
                    values,
                })
            }
            other => Err(Error::InvalidInput(format!(
                "expected comparison operator in filter, found {other:?}"
            ))),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Lower) => {
                self.expect(Token::LParen)?;
                let inner = self.parse_operand()?;
                self.expect(Token::RParen)?;
                Ok(Operand::Lower(Box::new(inner)))
            }
            Some(Token::Ident(name)) => {
                if !DOCUMENT_COLUMNS.contains(&name.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "unknown document column '{name}' in filter"
                    )));
                }
                Ok(Operand::Column(name))
            }
            Some(Token::Str(s)) => Ok(Operand::Literal(Literal::Str(s))),
            Some(Token::Num(n)) => Ok(Operand::Literal(Literal::Num(n))),
            other => Err(Error::InvalidInput(format!(
                "expected column or literal in filter, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_equality_compiles() {
        assert_eq!(compile("title = 'Python Guide'").unwrap(), "(title = 'Python Guide')");
    }

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(
            compile("title = 'O''Brien'").unwrap(),
            "(title = 'O''Brien')"
        );
    }

    #[test]
    fn lower_like_in_and_or_parens() {
        let compiled = compile(
            "(LOWER(title) LIKE '%guide%' OR uri IN ('a', 'b')) AND id != '1'",
        )
        .unwrap();
        assert_eq!(
            compiled,
            "(((lower(title) LIKE '%guide%') OR (uri IN ('a', 'b'))) AND (id != '1'))"
        );
    }

    #[test]
    fn unknown_column_rejected() {
        assert!(matches!(
            compile("password = 'x'"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn injection_shapes_rejected() {
        assert!(compile("title = 'x'; DROP TABLE documents").is_err());
        assert!(compile("title = 'x' -- comment").is_err());
        assert!(compile("title > 'x'").is_err());
    }

    #[test]
    fn unterminated_string_rejected() {
        assert!(compile("title = 'oops").is_err());
    }
}
