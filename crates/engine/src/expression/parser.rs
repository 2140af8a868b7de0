//! Tokenizer and recursive-descent parser for sandbox expressions.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or         := and (("or" | "||") and)*
//! and        := not (("and" | "&&") not)*
//! not        := ("not" | "!") not | comparison
//! comparison := sum (compare_op sum)*
//! sum        := term (("+" | "-") term)*
//! term       := unary (("*" | "/" | "//" | "%") unary)*
//! unary      := ("-" | "+") unary | postfix
//! postfix    := primary ("[" or "]")*
//! primary    := literal | identifier | identifier "(" args ")" | "(" or ")" | "[" args "]"
//! ```

use serde_json::{Number, Value};

use crate::error::{EngineError, EngineResult};

/// Nesting depth accepted before the parser gives up.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    List(Vec<Expr>),
    Negate(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `a < b <= c` keeps every operand so each is evaluated once.
    Compare(Box<Expr>, Vec<(CompareOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Str(String),
    Ident(String),
    Op(&'static str),
}

/// Parses expression text into a syntax tree.
pub fn parse(source: &str) -> EngineResult<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(EngineError::expression("empty expression"));
    }
    let mut parser = Parser {
        tokens,
        position: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(EngineError::expression(format!("unexpected {}", describe(token)))),
    }
}

const OPERATORS: [&str; 21] = [
    "//", "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!", "(", ")", "[", "]", ",", ".",
];

fn tokenize(source: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = source;

    while let Some(character) = rest.chars().next() {
        if character.is_whitespace() {
            rest = &rest[character.len_utf8()..];
            continue;
        }
        if character.is_ascii_digit() {
            let (number, remainder) = lex_number(rest)?;
            tokens.push(Token::Number(number));
            rest = remainder;
            continue;
        }
        if character == '\'' || character == '"' {
            let (text, remainder) = lex_string(rest, character)?;
            tokens.push(Token::Str(text));
            rest = remainder;
            continue;
        }
        if character == '_' || character.is_alphabetic() {
            let end = rest
                .char_indices()
                .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
                .map_or(rest.len(), |(index, _)| index);
            tokens.push(Token::Ident(rest[..end].to_string()));
            rest = &rest[end..];
            continue;
        }
        match OPERATORS.iter().find(|operator| rest.starts_with(**operator)) {
            Some(operator) => {
                tokens.push(Token::Op(*operator));
                rest = &rest[operator.len()..];
            }
            None => return Err(EngineError::expression(format!("unexpected character '{character}'"))),
        }
    }

    Ok(tokens)
}

fn lex_number(source: &str) -> EngineResult<(Number, &str)> {
    let bytes = source.as_bytes();
    let mut end = 0;
    let mut is_float = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' | b'_' => end += 1,
            b'.' if !is_float && bytes.get(end + 1).is_some_and(u8::is_ascii_digit) => {
                is_float = true;
                end += 1;
            }
            b'e' | b'E' if bytes.get(end + 1).is_some_and(|b| b.is_ascii_digit() || *b == b'-' || *b == b'+') => {
                is_float = true;
                end += 2;
            }
            _ => break,
        }
    }

    let literal: String = source[..end].chars().filter(|c| *c != '_').collect();
    let number = if is_float {
        literal.parse::<f64>().ok().and_then(Number::from_f64)
    } else {
        literal.parse::<i64>().ok().map(Number::from)
    };
    number
        .map(|number| (number, &source[end..]))
        .ok_or_else(|| EngineError::expression(format!("invalid number literal '{literal}'")))
}

fn lex_string(source: &str, quote: char) -> EngineResult<(String, &str)> {
    let mut text = String::new();
    let mut chars = source.char_indices().skip(1);
    while let Some((index, character)) = chars.next() {
        match character {
            c if c == quote => return Ok((text, &source[index + c.len_utf8()..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => text.push('\n'),
                Some((_, 't')) => text.push('\t'),
                Some((_, 'r')) => text.push('\r'),
                Some((_, other)) => text.push(other),
                None => break,
            },
            other => text.push(other),
        }
    }
    Err(EngineError::expression("unterminated string literal"))
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(number) => format!("number {number}"),
        Token::Str(_) => "string literal".to_string(),
        Token::Ident(name) => format!("'{name}'"),
        Token::Op(operator) => format!("'{operator}'"),
    }
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.position + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn at_op(&self, operator: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(op)) if *op == operator)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == keyword)
    }

    fn expect_op(&mut self, operator: &str) -> EngineResult<()> {
        if self.at_op(operator) {
            self.position += 1;
            return Ok(());
        }
        let found = self.peek().map_or_else(|| "end of expression".to_string(), describe);
        Err(EngineError::expression(format!("expected '{operator}', found {found}")))
    }

    fn enter(&mut self) -> EngineResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EngineError::expression("expression nested too deeply"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_and()?;
        while self.at_keyword("or") || self.at_op("||") {
            self.position += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_not()?;
        while self.at_keyword("and") || self.at_op("&&") {
            self.position += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> EngineResult<Expr> {
        if self.at_keyword("not") || self.at_op("!") {
            self.position += 1;
            self.enter()?;
            let operand = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> EngineResult<Expr> {
        let first = self.parse_sum()?;
        let mut rest = Vec::new();
        while let Some(op) = self.compare_op() {
            rest.push((op, self.parse_sum()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    /// Consumes a comparison operator if one is next.
    fn compare_op(&mut self) -> Option<CompareOp> {
        let (op, width) = match (self.peek()?, self.peek_at(1)) {
            (Token::Op("=="), _) => (CompareOp::Eq, 1),
            (Token::Op("!="), _) => (CompareOp::NotEq, 1),
            (Token::Op("<"), _) => (CompareOp::Lt, 1),
            (Token::Op("<="), _) => (CompareOp::LtEq, 1),
            (Token::Op(">"), _) => (CompareOp::Gt, 1),
            (Token::Op(">="), _) => (CompareOp::GtEq, 1),
            (Token::Ident(name), _) if name == "in" => (CompareOp::In, 1),
            (Token::Ident(name), Some(Token::Ident(next))) if name == "not" && next == "in" => (CompareOp::NotIn, 2),
            _ => return None,
        };
        self.position += width;
        Some(op)
    }

    fn parse_sum(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = if self.at_op("+") {
                BinaryOp::Add
            } else if self.at_op("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            self.position += 1;
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_term(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOp::Mul,
                Some(Token::Op("/")) => BinaryOp::Div,
                Some(Token::Op("//")) => BinaryOp::FloorDiv,
                Some(Token::Op("%")) => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.position += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> EngineResult<Expr> {
        if self.at_op("-") || self.at_op("+") {
            let negate = self.at_op("-");
            self.position += 1;
            self.enter()?;
            let operand = self.parse_unary()?;
            self.depth -= 1;
            return Ok(if negate {
                Expr::Negate(Box::new(operand))
            } else {
                operand
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> EngineResult<Expr> {
        let mut expr = self.parse_primary()?;
        while self.at_op("[") {
            self.position += 1;
            self.enter()?;
            let index = self.parse_or()?;
            self.depth -= 1;
            self.expect_op("]")?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
        }
        if self.at_op(".") {
            return Err(EngineError::expression("attribute access is not supported"));
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> EngineResult<Expr> {
        let token = self
            .advance()
            .ok_or_else(|| EngineError::expression("unexpected end of expression"))?;
        match token {
            Token::Number(number) => Ok(Expr::Literal(Value::Number(number))),
            Token::Str(text) => Ok(Expr::Literal(Value::String(text))),
            Token::Ident(name) => match name.as_str() {
                "True" | "true" => Ok(Expr::Literal(Value::Bool(true))),
                "False" | "false" => Ok(Expr::Literal(Value::Bool(false))),
                "None" | "null" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" | "in" => Err(EngineError::expression(format!("unexpected '{name}'"))),
                _ if self.at_op("(") => {
                    self.position += 1;
                    let args = self.parse_items(")")?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Variable(name)),
            },
            Token::Op("(") => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                self.expect_op(")")?;
                Ok(inner)
            }
            Token::Op("[") => Ok(Expr::List(self.parse_items("]")?)),
            other => Err(EngineError::expression(format!("unexpected {}", describe(&other)))),
        }
    }

    /// Parses a comma separated list up to and including `close`. A trailing comma is allowed.
    fn parse_items(&mut self, close: &str) -> EngineResult<Vec<Expr>> {
        self.enter()?;
        let mut items = Vec::new();
        while !self.at_op(close) {
            items.push(self.parse_or()?);
            if !self.at_op(",") {
                break;
            }
            self.position += 1;
        }
        self.expect_op(close)?;
        self.depth -= 1;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn var(name: &str) -> Box<Expr> {
        Box::new(Expr::Variable(name.to_string()))
    }

    fn lit(value: Value) -> Box<Expr> {
        Box::new(Expr::Literal(value))
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let expr = parse("a + 2 * 3").expect("parse");
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Add,
                var("a"),
                Box::new(Expr::Binary(BinaryOp::Mul, lit(json!(2)), lit(json!(3))))
            )
        );
    }

    #[test]
    fn not_binds_looser_than_comparison() {
        let expr = parse("not a == 1").expect("parse");
        assert_eq!(
            expr,
            Expr::Not(Box::new(Expr::Compare(var("a"), vec![(CompareOp::Eq, Expr::Literal(json!(1)))])))
        );
    }

    #[test]
    fn chained_comparisons_and_not_in() {
        let expr = parse("0 <= i < 10 and x not in ys").expect("parse");
        let Expr::And(left, right) = expr else {
            panic!("expected and");
        };
        assert!(matches!(*left, Expr::Compare(_, ref rest) if rest.len() == 2));
        assert!(matches!(*right, Expr::Compare(_, ref rest) if rest[0].0 == CompareOp::NotIn));
    }

    #[test]
    fn literals_and_calls() {
        assert_eq!(parse("1.5e2").expect("float"), Expr::Literal(json!(150.0)));
        assert_eq!(parse(r#"'it\'s'"#).expect("string"), Expr::Literal(json!("it's")));
        assert_eq!(
            parse("len([1, 2,])").expect("call"),
            Expr::Call("len".into(), vec![Expr::List(vec![Expr::Literal(json!(1)), Expr::Literal(json!(2))])])
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for source in ["", "1 +", "(1", "a.b", "'open", "1 2", "a ; b", "@"] {
            assert!(parse(source).is_err(), "{source}");
        }
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let source = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(parse(&source).is_err());
    }
}
