//! Script/variable collaborator.
//!
//! The expression language itself is external to the interpreter; the
//! session only needs the [`ScriptContext`] contract. [`SimpleScript`] is the
//! built-in implementation: nested scopes of string variables plus a small
//! expression evaluator (literals, dotted names, comparisons, `&&`/`||`/`!`,
//! `+`, parentheses).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VxiError};

/// Variable scope levels, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    Session,
    Application,
    Document,
    Dialog,
    Anonymous,
}

impl ScopeLevel {
    pub fn name(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Application => "application",
            Self::Document => "document",
            Self::Dialog => "dialog",
            Self::Anonymous => "anonymous",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "session" => Some(Self::Session),
            "application" => Some(Self::Application),
            "document" => Some(Self::Document),
            "dialog" => Some(Self::Dialog),
            _ => None,
        }
    }
}

/// Contract the interpreter uses to talk to the scripting engine.
pub trait ScriptContext: Send {
    fn push_scope(&mut self, level: ScopeLevel);

    fn pop_scope(&mut self) -> Option<ScopeLevel>;

    /// Levels currently on the stack, outermost first.
    fn scopes(&self) -> Vec<ScopeLevel>;

    /// Declare `name` in the innermost scope, shadowing outer ones.
    fn declare(&mut self, name: &str, value: &str) -> Result<()>;

    /// Read a variable. `dialog.x` style prefixes select a scope.
    fn get(&self, name: &str) -> Option<String>;

    /// Assign a variable; undeclared names are created in the innermost scope.
    fn set(&mut self, name: &str, value: &str) -> Result<()>;

    fn eval(&mut self, expr: &str) -> Result<String>;

    fn last_error(&self) -> Option<String>;

    fn eval_bool(&mut self, expr: &str) -> Result<bool> {
        let value = self.eval(expr)?;
        Ok(!matches!(value.as_str(), "" | "false" | "0"))
    }

    /// Run a small script: `;`/newline separated `[var] name = expr` statements.
    fn exec(&mut self, source: &str) -> Result<()> {
        for stmt in source.split(|c| c == ';' || c == '\n') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            let (declare, stmt) = match stmt.strip_prefix("var ") {
                Some(rest) => (true, rest.trim()),
                None => (false, stmt),
            };
            let Some((name, expr)) = split_assignment(stmt) else {
                self.eval(stmt)?;
                continue;
            };
            let value = self.eval(expr)?;
            if declare {
                self.declare(name, &value)?;
            } else {
                self.set(name, &value)?;
            }
        }
        Ok(())
    }
}

fn split_assignment(stmt: &str) -> Option<(&str, &str)> {
    let pos = stmt.find('=')?;
    let next = stmt[pos + 1..].chars().next();
    let prev = stmt[..pos].chars().last();
    if next == Some('=') || matches!(prev, Some('!' | '<' | '>' | '=')) {
        return None;
    }
    let name = stmt[..pos].trim();
    let valid = |c: char| c.is_alphanumeric() || matches!(c, '_' | '.' | '$');
    if name.is_empty() || !name.chars().all(valid) {
        return None;
    }
    Some((name, stmt[pos + 1..].trim()))
}

/// Built-in scoped string variables with a tiny expression evaluator.
#[derive(Debug)]
pub struct SimpleScript {
    scopes: Vec<(ScopeLevel, HashMap<String, String>)>,
    last_error: Option<String>,
}

impl Default for SimpleScript {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleScript {
    /// Starts with the session scope in place.
    pub fn new() -> Self {
        Self {
            scopes: vec![(ScopeLevel::Session, HashMap::new())],
            last_error: None,
        }
    }

    fn split_scope<'a>(&self, name: &'a str) -> (Option<ScopeLevel>, &'a str) {
        if let Some((prefix, rest)) = name.split_once('.') {
            if let Some(level) = ScopeLevel::from_prefix(prefix) {
                return (Some(level), rest);
            }
        }
        (None, name)
    }

    fn scope_mut(&mut self, level: ScopeLevel) -> Option<&mut HashMap<String, String>> {
        self.scopes
            .iter_mut()
            .rev()
            .find(|(l, _)| *l == level)
            .map(|(_, vars)| vars)
    }

    fn fail<T>(&mut self, err: VxiError) -> Result<T> {
        self.last_error = Some(err.to_string());
        Err(err)
    }
}

impl ScriptContext for SimpleScript {
    fn push_scope(&mut self, level: ScopeLevel) {
        self.scopes.push((level, HashMap::new()));
    }

    fn pop_scope(&mut self) -> Option<ScopeLevel> {
        // The session scope lives as long as the context.
        if self.scopes.len() <= 1 {
            return None;
        }
        self.scopes.pop().map(|(level, _)| level)
    }

    fn scopes(&self) -> Vec<ScopeLevel> {
        self.scopes.iter().map(|(l, _)| *l).collect()
    }

    fn declare(&mut self, name: &str, value: &str) -> Result<()> {
        let (level, bare) = self.split_scope(name);
        let bare = bare.to_string();
        let scope = match level {
            Some(level) => self.scope_mut(level),
            None => self.scopes.last_mut().map(|(_, vars)| vars),
        };
        match scope {
            Some(vars) => {
                vars.insert(bare, value.to_string());
                Ok(())
            }
            None => self.fail(VxiError::Semantic(format!("no scope for {name}"))),
        }
    }

    fn get(&self, name: &str) -> Option<String> {
        let (level, bare) = self.split_scope(name);
        self.scopes
            .iter()
            .rev()
            .filter(|(l, _)| level.map_or(true, |want| *l == want))
            .find_map(|(_, vars)| vars.get(bare).cloned())
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let (level, bare) = self.split_scope(name);
        if level.is_some() {
            return self.declare(name, value);
        }
        if let Some((_, vars)) = self
            .scopes
            .iter_mut()
            .rev()
            .find(|(_, vars)| vars.contains_key(bare))
        {
            vars.insert(bare.to_string(), value.to_string());
            return Ok(());
        }
        self.declare(name, value)
    }

    fn eval(&mut self, expr: &str) -> Result<String> {
        let result = Parser::new(expr, self).and_then(|mut p| p.parse_all());
        match result {
            Ok(value) => Ok(value.into_string()),
            Err(err) => self.fail(err),
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}

// ── Expression evaluation ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Value {
    fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Bool(_) => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty() && s != "false",
        }
    }

    fn into_string(self) -> String {
        match self {
            Value::Str(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", n as i64),
            Value::Num(n) => n.to_string(),
        }
    }

    fn loosely_equals(&self, other: &Value) -> bool {
        match (self.as_num(), other.as_num()) {
            (Some(a), Some(b)) => a == b,
            _ => self.clone().into_string() == other.clone().into_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                i = start;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(VxiError::Semantic(format!("unterminated string in {src}")));
                }
                tokens.push(Token::Str(chars[start..i].iter().collect()));
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
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse()
                    .map_err(|_| VxiError::Semantic(format!("bad number {text}")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = ["==", "!=", "<=", ">=", "&&", "||"]
                    .into_iter()
                    .find(|op| two == *op);
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '+' => "+",
                    '-' => "-",
                    '<' => "<",
                    '>' => ">",
                    '!' => "!",
                    _ => {
                        return Err(VxiError::Semantic(format!(
                            "unexpected character '{c}' in {src}"
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    vars: &'a SimpleScript,
}

impl<'a> Parser<'a> {
    fn new(src: &str, vars: &'a SimpleScript) -> Result<Self> {
        Ok(Self {
            tokens: tokenize(src)?,
            pos: 0,
            vars,
        })
    }

    fn parse_all(&mut self) -> Result<Value> {
        if self.tokens.is_empty() {
            return Ok(Value::Str(String::new()));
        }
        let value = self.or()?;
        if self.pos != self.tokens.len() {
            return Err(VxiError::Semantic(format!(
                "unexpected trailing token {:?}",
                self.tokens[self.pos]
            )));
        }
        Ok(value)
    }

    fn peek_op(&self, op: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Op(o)) if *o == op)
    }

    fn or(&mut self) -> Result<Value> {
        let mut lhs = self.and()?;
        while self.peek_op("||") {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Value::Bool(lhs.truthy() || rhs.truthy());
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Value> {
        let mut lhs = self.comparison()?;
        while self.peek_op("&&") {
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Value::Bool(lhs.truthy() && rhs.truthy());
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Value> {
        let lhs = self.additive()?;
        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if self.peek_op(op) {
                self.pos += 1;
                let rhs = self.additive()?;
                let result = match op {
                    "==" => lhs.loosely_equals(&rhs),
                    "!=" => !lhs.loosely_equals(&rhs),
                    _ => {
                        let (a, b) = match (lhs.as_num(), rhs.as_num()) {
                            (Some(a), Some(b)) => (a, b),
                            _ => {
                                return Err(VxiError::Semantic(format!(
                                    "'{op}' needs numeric operands"
                                )))
                            }
                        };
                        match op {
                            "<" => a < b,
                            ">" => a > b,
                            "<=" => a <= b,
                            _ => a >= b,
                        }
                    }
                };
                return Ok(Value::Bool(result));
            }
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Value> {
        let mut lhs = self.unary()?;
        loop {
            if self.peek_op("+") {
                self.pos += 1;
                let rhs = self.unary()?;
                // Numeric addition only when a numeric literal is involved.
                let numeric = matches!(lhs, Value::Num(_)) || matches!(rhs, Value::Num(_));
                lhs = match (numeric, lhs.as_num(), rhs.as_num()) {
                    (true, Some(a), Some(b)) => Value::Num(a + b),
                    _ => Value::Str(lhs.into_string() + &rhs.into_string()),
                };
            } else if self.peek_op("-") {
                self.pos += 1;
                let rhs = self.unary()?;
                match (lhs.as_num(), rhs.as_num()) {
                    (Some(a), Some(b)) => lhs = Value::Num(a - b),
                    _ => return Err(VxiError::Semantic("'-' needs numeric operands".into())),
                }
            } else {
                return Ok(lhs);
            }
        }
    }

    fn unary(&mut self) -> Result<Value> {
        if self.peek_op("!") {
            self.pos += 1;
            let v = self.unary()?;
            return Ok(Value::Bool(!v.truthy()));
        }
        if self.peek_op("-") {
            self.pos += 1;
            let v = self.unary()?;
            return v
                .as_num()
                .map(|n| Value::Num(-n))
                .ok_or_else(|| VxiError::Semantic("unary '-' needs a number".into()));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| VxiError::Semantic("unexpected end of expression".into()))?;
        self.pos += 1;
        match token {
            Token::Str(s) => Ok(Value::Str(s)),
            Token::Num(n) => Ok(Value::Num(n)),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "undefined" => Ok(Value::Str(String::new())),
                _ => self
                    .vars
                    .get(&name)
                    .map(Value::Str)
                    .ok_or_else(|| VxiError::Semantic(format!("undefined variable {name}"))),
            },
            Token::LParen => {
                let v = self.or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(v)
                    }
                    _ => Err(VxiError::Semantic("missing ')'".into())),
                }
            }
            other => Err(VxiError::Semantic(format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_shadow_and_unwind() {
        let mut s = SimpleScript::new();
        s.push_scope(ScopeLevel::Application);
        s.declare("x", "outer").unwrap();
        s.push_scope(ScopeLevel::Dialog);
        s.declare("x", "inner").unwrap();
        assert_eq!(s.get("x").as_deref(), Some("inner"));
        assert_eq!(s.get("application.x").as_deref(), Some("outer"));
        assert_eq!(s.pop_scope(), Some(ScopeLevel::Dialog));
        assert_eq!(s.get("x").as_deref(), Some("outer"));
    }

    #[test]
    fn set_updates_nearest_declaration() {
        let mut s = SimpleScript::new();
        s.push_scope(ScopeLevel::Document);
        s.declare("count", "1").unwrap();
        s.push_scope(ScopeLevel::Dialog);
        s.set("count", "2").unwrap();
        s.pop_scope();
        assert_eq!(s.get("count").as_deref(), Some("2"));
    }

    #[test]
    fn session_scope_cannot_be_popped() {
        let mut s = SimpleScript::new();
        assert_eq!(s.pop_scope(), None);
        assert_eq!(s.scopes(), vec![ScopeLevel::Session]);
    }

    #[test]
    fn evaluates_comparisons_and_concatenation() {
        let mut s = SimpleScript::new();
        s.declare("pin", "1234").unwrap();
        assert_eq!(s.eval("pin == 1234").unwrap(), "true");
        assert_eq!(s.eval("pin != '1234'").unwrap(), "false");
        assert_eq!(s.eval("'pin is ' + pin").unwrap(), "pin is 1234");
        assert_eq!(s.eval("pin + 1").unwrap(), "1235");
        assert_eq!(s.eval("(1 < 2) && !false").unwrap(), "true");
        assert!(s.eval_bool("pin > 1000 || false").unwrap());
    }

    #[test]
    fn undefined_variables_are_semantic_errors() {
        let mut s = SimpleScript::new();
        let err = s.eval("nope + 1").unwrap_err();
        assert_eq!(err.event_name(), "error.semantic");
        assert!(s.last_error().unwrap().contains("nope"));
    }

    #[test]
    fn exec_runs_statements() {
        let mut s = SimpleScript::new();
        s.exec("var a = 2; b = a + 3\nvar c = b == 5").unwrap();
        assert_eq!(s.get("b").as_deref(), Some("5"));
        assert_eq!(s.get("c").as_deref(), Some("true"));
    }
}
