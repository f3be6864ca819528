use futures::future::BoxFuture;
use serde::Deserialize;

use strand_core::error::{Result, StrandError};
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolResult};

pub struct CalcTool;

#[derive(Deserialize)]
struct CalcInput {
    expression: String,
}

impl Tool for CalcTool {
    fn name(&self) -> &str {
        "calc"
    }

    fn description(&self) -> &str {
        "Evaluate a simple arithmetic expression. Supports numbers, + - * / // % ** and parentheses."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Arithmetic expression, e.g. (2 + 3) * 4"
                }
            },
            "required": ["expression"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: CalcInput = serde_json::from_value(input)
                .map_err(|e| StrandError::ToolValidation(e.to_string()))?;
            let value = evaluate(&params.expression).map_err(|message| StrandError::ToolExecution {
                tool: "calc".to_string(),
                message,
            })?;
            Ok(ToolResult::success(format_number(value)))
        })
    }
}

/// Evaluate an arithmetic expression.
///
/// Grammar, loosest binding first:
///
/// ```text
/// expr   := term (('+' | '-') term)*
/// term   := unary (('*' | '/' | '//' | '%') unary)*
/// unary  := ('+' | '-') unary | power
/// power  := atom ('**' unary)?
/// atom   := number | '(' expr ')'
/// ```
///
/// `**` is right-associative and binds tighter than a leading minus, so
/// `-2 ** 2` is `-4`. `//` floors and `%` takes the sign of the divisor.
pub fn evaluate(expression: &str) -> std::result::Result<f64, String> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("Unexpected token at position {}", parser.pos));
    }
    if !value.is_finite() {
        return Err("Result is not a finite number".to_string());
    }
    Ok(value)
}

/// Integral values print without a fractional part.
fn format_number(value: f64) -> String {
    if value.fract().abs() < 1e-12 && value.abs() < i64::MAX as f64 {
        format!("{}", value.round() as i64)
    } else {
        format!("{}", value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Pow,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                tokens.push(Token::DoubleSlash);
                i += 2;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
                    i += 1;
                }
                // Exponent suffix, e.g. 1e-3
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("Invalid number: {}", literal))?;
                tokens.push(Token::Num(value));
            }
            other => return Err(format!("Unsupported character: '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.peek();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expr(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.term()?;
        while let Some(tok) = self.peek() {
            match tok {
                Token::Plus => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Token::Minus => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.unary()?;
        while let Some(tok) = self.peek() {
            match tok {
                Token::Star => {
                    self.pos += 1;
                    value *= self.unary()?;
                }
                Token::Slash => {
                    self.pos += 1;
                    value /= nonzero(self.unary()?)?;
                }
                Token::DoubleSlash => {
                    self.pos += 1;
                    value = (value / nonzero(self.unary()?)?).floor();
                }
                Token::Percent => {
                    self.pos += 1;
                    let rhs = nonzero(self.unary()?)?;
                    value = value - rhs * (value / rhs).floor();
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn unary(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> std::result::Result<f64, String> {
        let base = self.atom()?;
        if self.peek() == Some(Token::Pow) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> std::result::Result<f64, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("Missing closing parenthesis".to_string()),
                }
            }
            Some(tok) => Err(format!("Unexpected token: {:?}", tok)),
            None => Err("Unexpected end of expression".to_string()),
        }
    }
}

fn nonzero(value: f64) -> std::result::Result<f64, String> {
    if value == 0.0 {
        Err("Division by zero".to_string())
    } else {
        Ok(value)
    }
}
