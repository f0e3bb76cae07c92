//! Safe arithmetic expression evaluation for billing formulas.
//!
//! Expressions are parsed into a frozen AST that admits only numeric
//! literals, unary `+ -`, binary `+ - * / // % **`, variables, and calls to
//! `min max abs round int float`. Nothing else parses; evaluation supplies
//! only the caller's bindings and the six functions.

use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExprError {
    #[error("unsafe expression: {0}")]
    Unsafe(String),
    #[error("expression evaluation failed: {0}")]
    Evaluation(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingValue {
    Num(f64),
    Str(String),
}

impl BindingValue {
    fn as_number(&self, context: &str) -> Result<f64, ExprError> {
        match self {
            BindingValue::Num(value) => Ok(*value),
            BindingValue::Str(text) => Err(ExprError::Evaluation(format!(
                "{context}: string value {text:?} is not numeric"
            ))),
        }
    }
}

impl From<f64> for BindingValue {
    fn from(value: f64) -> Self {
        BindingValue::Num(value)
    }
}

impl From<i64> for BindingValue {
    fn from(value: i64) -> Self {
        BindingValue::Num(value as f64)
    }
}

impl From<&str> for BindingValue {
    fn from(value: &str) -> Self {
        BindingValue::Str(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Min,
    Max,
    Abs,
    Round,
    Int,
    Float,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            "abs" => Some(Func::Abs),
            "round" => Some(Func::Round),
            "int" => Some(Func::Int),
            "float" => Some(Func::Float),
            _ => None,
        }
    }

    pub(crate) const NAMES: [&'static str; 6] = ["min", "max", "abs", "round", "int", "float"];
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Func::Min => "min",
            Func::Max => "max",
            Func::Abs => "abs",
            Func::Round => "round",
            Func::Int => "int",
            Func::Float => "float",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Num(f64),
    Var(String),
    Neg(Box<Node>),
    Bin(BinOp, Box<Node>, Box<Node>),
    Call {
        func: Func,
        args: Vec<Node>,
        named: Vec<(String, Node)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    LParen,
    RParen,
    Comma,
    Assign,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if bytes.get(i + 1) == Some(&b'*') {
                    tokens.push(Token::DoubleStar);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '/' => {
                if bytes.get(i + 1) == Some(&b'/') {
                    tokens.push(Token::DoubleSlash);
                    i += 2;
                } else {
                    tokens.push(Token::Slash);
                    i += 1;
                }
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    return Err(ExprError::Unsafe("comparisons are not allowed".to_string()));
                }
                tokens.push(Token::Assign);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len()
                    && matches!(bytes[i] as char, '0'..='9' | '.' | 'e' | 'E')
                {
                    // Accept exponent signs only right after e/E.
                    if matches!(bytes[i] as char, 'e' | 'E')
                        && matches!(bytes.get(i + 1).map(|b| *b as char), Some('+') | Some('-'))
                    {
                        i += 1;
                    }
                    i += 1;
                }
                let literal = &input[start..i];
                let value = literal.parse::<f64>().map_err(|_| {
                    ExprError::Unsafe(format!("invalid numeric literal: {literal}"))
                })?;
                tokens.push(Token::Num(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && matches!(bytes[i] as char, 'a'..='z' | 'A'..='Z' | '0'..='9' | '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
            }
            other => {
                return Err(ExprError::Unsafe(format!(
                    "character not allowed in expression: {other:?}"
                )));
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

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            other => Err(ExprError::Unsafe(format!(
                "expected {token:?}, found {other:?}"
            ))),
        }
    }

    // additive := multiplicative (('+' | '-') multiplicative)*
    fn parse_additive(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_multiplicative()?;
            node = Node::Bin(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::DoubleSlash) => BinOp::FloorDiv,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.next();
            let rhs = self.parse_unary()?;
            node = Node::Bin(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.next();
                Ok(Node::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.next();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // Power is right-associative; its right operand may be unary (2 ** -3).
    fn parse_power(&mut self) -> Result<Node, ExprError> {
        let base = self.parse_primary()?;
        if matches!(self.peek(), Some(Token::DoubleStar)) {
            self.next();
            let exponent = self.parse_unary()?;
            return Ok(Node::Bin(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        match self.next() {
            Some(Token::Num(value)) => Ok(Node::Num(value)),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.next();
                    let func = Func::from_name(&name).ok_or_else(|| {
                        ExprError::Unsafe(format!("function not allowed: {name}"))
                    })?;
                    return self.parse_call(func);
                }
                if name.starts_with("__") {
                    return Err(ExprError::Unsafe(
                        "dunder names are not allowed".to_string(),
                    ));
                }
                Ok(Node::Var(name))
            }
            Some(Token::LParen) => {
                let node = self.parse_additive()?;
                self.expect(Token::RParen)?;
                Ok(node)
            }
            other => Err(ExprError::Unsafe(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }

    fn parse_call(&mut self, func: Func) -> Result<Node, ExprError> {
        let mut args = Vec::new();
        let mut named = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.next();
            return Ok(Node::Call { func, args, named });
        }
        loop {
            // A named argument is `ident '=' expr`; bare `ident` stays positional.
            let is_named = matches!(
                (self.peek(), self.tokens.get(self.pos + 1)),
                (Some(Token::Ident(_)), Some(Token::Assign))
            );
            if is_named {
                let Some(Token::Ident(name)) = self.next() else {
                    unreachable!()
                };
                self.next();
                if !named.is_empty() || args.is_empty() {
                    // named may follow positionals or other named args; both fine
                }
                named.push((name, self.parse_additive()?));
            } else {
                if !named.is_empty() {
                    return Err(ExprError::Unsafe(
                        "positional argument follows named argument".to_string(),
                    ));
                }
                args.push(self.parse_additive()?);
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => {
                    return Err(ExprError::Unsafe(format!(
                        "expected ',' or ')' in call, found {other:?}"
                    )));
                }
            }
        }
        Ok(Node::Call { func, args, named })
    }
}

/// A validated, reusable billing expression.
#[derive(Debug, Clone)]
pub struct SafeExpression {
    root: Node,
}

impl SafeExpression {
    pub fn parse(expression: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Err(ExprError::Unsafe("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_additive()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::Unsafe(format!(
                "trailing tokens at position {}",
                parser.pos
            )));
        }
        Ok(Self { root })
    }

    /// Variables the expression reads (function names excluded).
    pub fn variable_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        collect_vars(&self.root, &mut names);
        names
    }

    pub fn eval_number(
        &self,
        bindings: &HashMap<String, BindingValue>,
    ) -> Result<f64, ExprError> {
        let value = eval_node(&self.root, bindings)?;
        if !value.is_finite() {
            return Err(ExprError::Evaluation(
                "expression result is not a finite number".to_string(),
            ));
        }
        Ok(value)
    }
}

/// Convenience: parse + extract in one go, as the dimension toposort needs.
pub fn extract_variable_names(expression: &str) -> Result<HashSet<String>, ExprError> {
    Ok(SafeExpression::parse(expression)?.variable_names())
}

/// The whitelisted function names, for callers that must ignore them when
/// interpreting identifiers (dimension dependency analysis).
pub fn builtin_function_names() -> [&'static str; 6] {
    Func::NAMES
}

fn collect_vars(node: &Node, out: &mut HashSet<String>) {
    match node {
        Node::Num(_) => {}
        Node::Var(name) => {
            out.insert(name.clone());
        }
        Node::Neg(inner) => collect_vars(inner, out),
        Node::Bin(_, lhs, rhs) => {
            collect_vars(lhs, out);
            collect_vars(rhs, out);
        }
        Node::Call { args, named, .. } => {
            for arg in args {
                collect_vars(arg, out);
            }
            for (_, arg) in named {
                collect_vars(arg, out);
            }
        }
    }
}

fn eval_node(node: &Node, bindings: &HashMap<String, BindingValue>) -> Result<f64, ExprError> {
    match node {
        Node::Num(value) => Ok(*value),
        Node::Var(name) => bindings
            .get(name)
            .ok_or_else(|| ExprError::Evaluation(format!("name {name:?} is not defined")))?
            .as_number(&format!("variable {name}")),
        Node::Neg(inner) => Ok(-eval_node(inner, bindings)?),
        Node::Bin(op, lhs, rhs) => {
            let left = eval_node(lhs, bindings)?;
            let right = eval_node(rhs, bindings)?;
            match op {
                BinOp::Add => Ok(left + right),
                BinOp::Sub => Ok(left - right),
                BinOp::Mul => Ok(left * right),
                BinOp::Div => {
                    if right == 0.0 {
                        return Err(ExprError::Evaluation("division by zero".to_string()));
                    }
                    Ok(left / right)
                }
                BinOp::FloorDiv => {
                    if right == 0.0 {
                        return Err(ExprError::Evaluation(
                            "integer division by zero".to_string(),
                        ));
                    }
                    Ok((left / right).floor())
                }
                BinOp::Mod => {
                    if right == 0.0 {
                        return Err(ExprError::Evaluation("modulo by zero".to_string()));
                    }
                    // Result carries the divisor's sign.
                    Ok(left - right * (left / right).floor())
                }
                BinOp::Pow => Ok(left.powf(right)),
            }
        }
        Node::Call { func, args, named } => eval_call(*func, args, named, bindings),
    }
}

fn eval_call(
    func: Func,
    args: &[Node],
    named: &[(String, Node)],
    bindings: &HashMap<String, BindingValue>,
) -> Result<f64, ExprError> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval_arg(arg, bindings)?);
    }
    let mut named_values: HashMap<&str, BindingValue> = HashMap::new();
    for (name, arg) in named {
        named_values.insert(name.as_str(), eval_arg(arg, bindings)?);
    }

    match func {
        Func::Min | Func::Max => {
            if !named_values.is_empty() {
                return Err(ExprError::Evaluation(format!(
                    "{func}() does not accept named arguments"
                )));
            }
            if values.is_empty() {
                return Err(ExprError::Evaluation(format!("{func}() needs arguments")));
            }
            let mut numbers = Vec::with_capacity(values.len());
            for value in &values {
                numbers.push(value.as_number(&format!("{func}() argument"))?);
            }
            let folded = numbers
                .into_iter()
                .reduce(|a, b| match func {
                    Func::Min => a.min(b),
                    _ => a.max(b),
                })
                .unwrap_or(0.0);
            Ok(folded)
        }
        Func::Abs => {
            let value = single_arg(func, &values, &mut named_values, &["x"])?;
            Ok(value.as_number("abs() argument")?.abs())
        }
        Func::Round => {
            let number = match values.first() {
                Some(value) => value.clone(),
                None => named_values
                    .remove("number")
                    .ok_or_else(|| ExprError::Evaluation("round() needs an argument".to_string()))?,
            };
            let ndigits = match values.get(1) {
                Some(value) => Some(value.as_number("round() ndigits")?),
                None => match named_values.remove("ndigits") {
                    Some(value) => Some(value.as_number("round() ndigits")?),
                    None => None,
                },
            };
            let number = number.as_number("round() argument")?;
            Ok(match ndigits {
                Some(digits) => {
                    let scale = 10f64.powi(digits as i32);
                    round_half_even(number * scale) / scale
                }
                None => round_half_even(number),
            })
        }
        Func::Int => {
            let value = single_arg(func, &values, &mut named_values, &["x"])?;
            match value {
                BindingValue::Num(number) => Ok(number.trunc()),
                BindingValue::Str(text) => text.trim().parse::<f64>().map(|n| n.trunc()).map_err(
                    |_| ExprError::Evaluation(format!("int() got invalid literal {text:?}")),
                ),
            }
        }
        Func::Float => {
            let value = single_arg(func, &values, &mut named_values, &["x"])?;
            match value {
                BindingValue::Num(number) => Ok(number),
                BindingValue::Str(text) => text.trim().parse::<f64>().map_err(|_| {
                    ExprError::Evaluation(format!("float() got invalid literal {text:?}"))
                }),
            }
        }
    }
}

fn eval_arg(
    node: &Node,
    bindings: &HashMap<String, BindingValue>,
) -> Result<BindingValue, ExprError> {
    // String bindings survive as call arguments (int/float coerce them);
    // everything else evaluates numerically.
    if let Node::Var(name) = node {
        if let Some(value) = bindings.get(name) {
            return Ok(value.clone());
        }
        return Err(ExprError::Evaluation(format!(
            "name {name:?} is not defined"
        )));
    }
    Ok(BindingValue::Num(eval_node(node, bindings)?))
}

fn single_arg<'a>(
    func: Func,
    values: &[BindingValue],
    named: &mut HashMap<&'a str, BindingValue>,
    named_aliases: &[&'a str],
) -> Result<BindingValue, ExprError> {
    if let Some(value) = values.first() {
        return Ok(value.clone());
    }
    for alias in named_aliases {
        if let Some(value) = named.remove(alias) {
            return Ok(value);
        }
    }
    Err(ExprError::Evaluation(format!("{func}() needs an argument")))
}

fn round_half_even(value: f64) -> f64 {
    let floor = value.floor();
    let diff = value - floor;
    if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num_bindings(pairs: &[(&str, f64)]) -> HashMap<String, BindingValue> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), BindingValue::Num(*value)))
            .collect()
    }

    #[test]
    fn arithmetic_with_variables() {
        let expr = SafeExpression::parse("base + duration_seconds * per_second").unwrap();
        let cost = expr
            .eval_number(&num_bindings(&[
                ("base", 0.1),
                ("duration_seconds", 4.0),
                ("per_second", 0.05),
            ]))
            .unwrap();
        assert!((cost - 0.3).abs() < 1e-12);
    }

    #[test]
    fn power_is_right_associative() {
        let expr = SafeExpression::parse("2 ** 3 ** 2").unwrap();
        assert_eq!(expr.eval_number(&HashMap::new()).unwrap(), 512.0);
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        let expr = SafeExpression::parse("-2 ** 2").unwrap();
        assert_eq!(expr.eval_number(&HashMap::new()).unwrap(), -4.0);
    }

    #[test]
    fn modulo_follows_divisor_sign() {
        let expr = SafeExpression::parse("-7 % 3").unwrap();
        assert_eq!(expr.eval_number(&HashMap::new()).unwrap(), 2.0);
    }

    #[test]
    fn floor_division() {
        let expr = SafeExpression::parse("7 // 2").unwrap();
        assert_eq!(expr.eval_number(&HashMap::new()).unwrap(), 3.0);
    }

    #[test]
    fn whitelisted_functions() {
        let expr = SafeExpression::parse("min(3, max(1, 2)) + abs(-2) + round(2.5)").unwrap();
        // round(2.5) == 2 under banker's rounding
        assert_eq!(expr.eval_number(&HashMap::new()).unwrap(), 6.0);
    }

    #[test]
    fn round_accepts_named_ndigits() {
        let expr = SafeExpression::parse("round(2.678, ndigits=2)").unwrap();
        assert!((expr.eval_number(&HashMap::new()).unwrap() - 2.68).abs() < 1e-12);
    }

    #[test]
    fn unknown_function_is_unsafe() {
        assert!(matches!(
            SafeExpression::parse("open(1)"),
            Err(ExprError::Unsafe(_))
        ));
    }

    #[test]
    fn dunder_names_rejected() {
        assert!(matches!(
            SafeExpression::parse("__import__"),
            Err(ExprError::Unsafe(_))
        ));
    }

    #[test]
    fn comparisons_rejected() {
        assert!(matches!(
            SafeExpression::parse("a == b"),
            Err(ExprError::Unsafe(_))
        ));
    }

    #[test]
    fn division_by_zero_is_an_evaluation_error() {
        let expr = SafeExpression::parse("1 / x").unwrap();
        assert!(matches!(
            expr.eval_number(&num_bindings(&[("x", 0.0)])),
            Err(ExprError::Evaluation(_))
        ));
    }

    #[test]
    fn undefined_variable_is_an_evaluation_error() {
        let expr = SafeExpression::parse("tokens * 2").unwrap();
        assert!(matches!(
            expr.eval_number(&HashMap::new()),
            Err(ExprError::Evaluation(_))
        ));
    }

    #[test]
    fn string_binding_coerces_through_float() {
        let expr = SafeExpression::parse("float(value) * 2").unwrap();
        let mut bindings = HashMap::new();
        bindings.insert("value".to_string(), BindingValue::Str("1.5".to_string()));
        assert_eq!(expr.eval_number(&bindings).unwrap(), 3.0);
    }

    #[test]
    fn string_binding_in_arithmetic_fails() {
        let expr = SafeExpression::parse("value * 2").unwrap();
        let mut bindings = HashMap::new();
        bindings.insert("value".to_string(), BindingValue::Str("oops".to_string()));
        assert!(expr.eval_number(&bindings).is_err());
    }

    #[test]
    fn variable_names_exclude_functions() {
        let names = extract_variable_names("min(a, b) + round(c)").unwrap();
        assert_eq!(
            names,
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect()
        );
    }
}
