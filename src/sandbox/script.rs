//! Endpoint script evaluator
//!
//! A restricted, loop-free expression language for generated bodies:
//!
//! ```text
//! let name = actions.upper(input)
//! if_missing = input.field          // member access on objects
//! return actions.concat("hi ", name)
//! throw "bad input"
//! ```
//!
//! Capabilities are only reachable as `actions.<name>(args...)`. The value
//! of a body is its `return`, else its last bare expression, else `null`.

use serde_json::{Number, Value};
use std::collections::HashMap;

use super::lexer::{syntax, tokenize, Spanned, Token};
use super::{ExecutionError, Sandbox};
use crate::capabilities::{render, CapabilitySet};

const CAPABILITY_ROOT: &str = "actions";
const INPUT: &str = "input";
/// Parenthesised or argument nesting allowed in one body.
const MAX_NESTING: usize = 32;
/// Operator, member and call nodes allowed in one body. Evaluation recurses
/// once per node, so this bounds the evaluator's stack as well.
const MAX_NODES: usize = 256;

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Member(Box<Expr>, String),
    Call(Box<Expr>, Vec<Expr>),
    Add(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Let(String, Expr),
    Return(Expr),
    Throw(Expr),
    Expr(Expr),
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    nodes: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            nodes: 0,
        }
    }

    fn node(&mut self) -> Result<(), ExecutionError> {
        self.nodes += 1;
        if self.nodes > MAX_NODES {
            return Err(syntax(self.line(), &format!("body exceeds {} operations", MAX_NODES)));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExecutionError> {
        let line = self.line();
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(syntax(line, &format!("expected {:?}, found {:?}", expected, token))),
            None => Err(syntax(line, &format!("expected {:?}, found end of input", expected))),
        }
    }

    fn skip_separators(&mut self) {
        while self.peek() == Some(&Token::Separator) {
            self.pos += 1;
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, ExecutionError> {
        let mut statements = Vec::new();
        self.skip_separators();
        while self.peek().is_some() {
            statements.push(self.statement()?);
            match self.peek() {
                None | Some(Token::Separator) => self.skip_separators(),
                Some(other) => {
                    let other = other.clone();
                    return Err(syntax(self.line(), &format!("unexpected {:?}", other)));
                }
            }
        }
        Ok(statements)
    }

    fn statement(&mut self) -> Result<Stmt, ExecutionError> {
        match self.peek() {
            Some(Token::Ident(word)) if word == "let" || word == "const" || word == "var" => {
                self.pos += 1;
                let line = self.line();
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    _ => return Err(syntax(line, "expected a name after 'let'")),
                };
                self.expect(Token::Assign)?;
                Ok(Stmt::Let(name, self.expression()?))
            }
            Some(Token::Ident(word)) if word == "return" => {
                self.pos += 1;
                match self.peek() {
                    None | Some(Token::Separator) => Ok(Stmt::Return(Expr::Literal(Value::Null))),
                    _ => Ok(Stmt::Return(self.expression()?)),
                }
            }
            Some(Token::Ident(word)) if word == "throw" => {
                self.pos += 1;
                Ok(Stmt::Throw(self.expression()?))
            }
            _ => Ok(Stmt::Expr(self.expression()?)),
        }
    }

    fn expression(&mut self) -> Result<Expr, ExecutionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(syntax(self.line(), &format!("expression nested deeper than {}", MAX_NESTING)));
        }
        let mut left = self.postfix()?;
        while self.peek() == Some(&Token::Plus) {
            self.pos += 1;
            self.node()?;
            let right = self.postfix()?;
            left = Expr::Add(Box::new(left), Box::new(right));
        }
        self.depth -= 1;
        Ok(left)
    }

    fn postfix(&mut self) -> Result<Expr, ExecutionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    self.node()?;
                    let line = self.line();
                    match self.next() {
                        Some(Token::Ident(field)) => expr = Expr::Member(Box::new(expr), field),
                        _ => return Err(syntax(line, "expected a name after '.'")),
                    }
                }
                Some(Token::LParen) => {
                    self.pos += 1;
                    self.node()?;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    expr = Expr::Call(Box::new(expr), args);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExecutionError> {
        let line = self.line();
        match self.next() {
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Var(word),
            }),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(other) => Err(syntax(line, &format!("unexpected {:?}", other))),
            None => Err(syntax(line, "unexpected end of input")),
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Literal(value) => value.to_string(),
        Expr::Var(name) => name.clone(),
        Expr::Member(target, field) => format!("{}.{}", describe(target), field),
        Expr::Call(target, _) => format!("{}(...)", describe(target)),
        Expr::Add(left, right) => format!("{} + {}", describe(left), describe(right)),
    }
}

struct Scope<'a> {
    input: &'a Value,
    capabilities: &'a CapabilitySet,
    locals: HashMap<String, Value>,
}

enum Flow {
    Continue(Value),
    Return(Value),
}

impl Scope<'_> {
    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ExecutionError> {
        match stmt {
            Stmt::Let(name, expr) => {
                let value = self.eval(expr)?;
                if name == INPUT || name == CAPABILITY_ROOT {
                    return Err(ExecutionError::new(format!("TypeError: cannot redeclare '{}'", name)));
                }
                self.locals.insert(name.clone(), value);
                Ok(Flow::Continue(Value::Null))
            }
            Stmt::Return(expr) => Ok(Flow::Return(self.eval(expr)?)),
            Stmt::Throw(expr) => Err(ExecutionError::new(render(&self.eval(expr)?))),
            Stmt::Expr(expr) => Ok(Flow::Continue(self.eval(expr)?)),
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Value, ExecutionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) if name == INPUT => Ok(self.input.clone()),
            Expr::Var(name) if name == CAPABILITY_ROOT => Err(ExecutionError::new(
                "TypeError: 'actions' can only be used to call a capability",
            )),
            Expr::Var(name) => self
                .locals
                .get(name)
                .cloned()
                .ok_or_else(|| ExecutionError::new(format!("ReferenceError: {} is not defined", name))),
            Expr::Member(target, field) => {
                let value = self.eval(target)?;
                match value {
                    Value::Object(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
                    Value::String(s) if field == "length" => Ok(Value::from(s.chars().count())),
                    Value::Array(items) if field == "length" => Ok(Value::from(items.len())),
                    Value::Null => Err(ExecutionError::new(format!(
                        "TypeError: cannot read property '{}' of null ({})",
                        field,
                        describe(target)
                    ))),
                    _ => Ok(Value::Null),
                }
            }
            Expr::Call(target, args) => self.call(target, args),
            Expr::Add(left, right) => {
                let (left, right) = (self.eval(left)?, self.eval(right)?);
                match (&left, &right) {
                    (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
                        (Some(a), Some(b)) => Ok(a
                            .checked_add(b)
                            .map(Value::from)
                            .unwrap_or_else(|| number(a as f64 + b as f64))),
                        _ => Ok(number(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))),
                    },
                    _ => Ok(Value::String(format!("{}{}", render(&left), render(&right)))),
                }
            }
        }
    }

    fn call(&self, target: &Expr, args: &[Expr]) -> Result<Value, ExecutionError> {
        let name = match target {
            Expr::Member(root, name) if **root == Expr::Var(CAPABILITY_ROOT.to_string()) => name,
            other => {
                if let Expr::Member(receiver, field) = other {
                    if self.eval(receiver)?.is_null() {
                        return Err(ExecutionError::new(format!(
                            "TypeError: cannot read property '{}' of null ({})",
                            field,
                            describe(receiver)
                        )));
                    }
                }
                return Err(ExecutionError::new(format!(
                    "TypeError: {} is not a function",
                    describe(other)
                )))
            }
        };

        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| ExecutionError::new(format!("TypeError: actions.{} is not a function", name)))?;

        let values = args.iter().map(|arg| self.eval(arg)).collect::<Result<Vec<_>, _>>()?;
        capability
            .call(&values)
            .map_err(|e| ExecutionError::new(format!("actions.{} failed: {:#}", name, e)))
    }
}

/// Sandbox for endpoint scripts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptSandbox;

impl ScriptSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Sandbox for ScriptSandbox {
    fn validate(&self, code: &str) -> Result<(), ExecutionError> {
        Parser::new(tokenize(code)?).program().map(|_| ())
    }

    fn run(&self, code: &str, input: &Value, capabilities: &CapabilitySet) -> Result<Value, ExecutionError> {
        let program = Parser::new(tokenize(code)?).program()?;
        let mut scope = Scope {
            input,
            capabilities,
            locals: HashMap::new(),
        };

        let mut last = Value::Null;
        for stmt in &program {
            match scope.exec(stmt)? {
                Flow::Return(value) => return Ok(value),
                Flow::Continue(value) => {
                    if matches!(stmt, Stmt::Expr(_)) {
                        last = value;
                    }
                }
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilitySet;
    use serde_json::json;

    fn run(code: &str, input: Value) -> Result<Value, ExecutionError> {
        ScriptSandbox::new().run(code, &input, &CapabilitySet::builtins())
    }

    #[test]
    fn test_return_capability_call() {
        assert_eq!(run("actions.return(input)", json!("hi")).unwrap(), json!("hi"));
        assert_eq!(run("return actions.upper(input)", json!("hi")).unwrap(), json!("HI"));
    }

    #[test]
    fn test_locals_and_concatenation() {
        let code = "let name = actions.upper(input.name)\nlet greeting = 'hello ' + name\nreturn greeting + '!'";
        assert_eq!(run(code, json!({ "name": "ada" })).unwrap(), json!("hello ADA!"));
    }

    #[test]
    fn test_numbers_add() {
        assert_eq!(run("return 2 + 3", Value::Null).unwrap(), json!(5));
        assert_eq!(run("return 1.5 + 1", Value::Null).unwrap(), json!(2.5));
        assert_eq!(run("return input.length + 1", json!("abc")).unwrap(), json!(4));
    }

    #[test]
    fn test_empty_body_is_null() {
        assert_eq!(run("", json!("x")).unwrap(), Value::Null);
        assert_eq!(run("let x = 1", json!("x")).unwrap(), Value::Null);
    }

    #[test]
    fn test_throw_raises() {
        let err = run("throw 'bad input'", Value::Null).unwrap_err();
        assert_eq!(err.message, "bad input");
    }

    #[test]
    fn test_member_of_null_raises() {
        let err = run("input.doesNotExist.willCrash()", json!({})).unwrap_err();
        assert!(err.message.contains("cannot read property 'willCrash'"), "{}", err.message);
    }

    #[test]
    fn test_unknown_capability_and_identifier() {
        let err = run("actions.teleport(input)", Value::Null).unwrap_err();
        assert!(err.message.contains("actions.teleport is not a function"));

        let err = run("return missing", Value::Null).unwrap_err();
        assert!(err.message.contains("missing is not defined"));

        let err = run("input.trim()", json!("x")).unwrap_err();
        assert!(err.message.contains("input.trim is not a function"));
    }

    #[test]
    fn test_capability_error_propagates() {
        let err = run("actions.parse('{')", Value::Null).unwrap_err();
        assert!(err.message.starts_with("actions.parse failed"));
    }

    #[test]
    fn test_syntax_errors() {
        let sandbox = ScriptSandbox::new();
        assert!(sandbox.validate("return actions.upper(").is_err());
        assert!(sandbox.validate("let = 3").is_err());
        assert!(sandbox.validate("return input\nreturn 'second'").is_ok());
        assert!(run("return 1 2", Value::Null).is_err());
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let nested = format!("return {}input{}", "(".repeat(3000), ")".repeat(3000));
        let err = run(&nested, json!(1)).unwrap_err();
        assert!(err.message.starts_with("SyntaxError"), "{}", err.message);
        assert!(err.message.contains("nested deeper"));

        let sum = format!("return 1{}", "+1".repeat(20_000));
        let err = run(&sum, Value::Null).unwrap_err();
        assert!(err.message.contains("exceeds"), "{}", err.message);

        let chain = format!("return input{}", ".a".repeat(20_000));
        assert!(run(&chain, json!({})).is_err());

        let calls = format!("return {}input{}", "actions.return(".repeat(3000), ")".repeat(3000));
        assert!(run(&calls, json!(1)).is_err());
    }

    #[test]
    fn test_moderate_nesting_still_runs() {
        let nested = format!("return {}input{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(run(&nested, json!(7)).unwrap(), json!(7));

        let sum = format!("return 0{}", "+1".repeat(100));
        assert_eq!(run(&sum, Value::Null).unwrap(), json!(100));
    }

    #[test]
    fn test_cannot_shadow_input() {
        let err = run("let input = 'x'", json!("y")).unwrap_err();
        assert!(err.message.contains("cannot redeclare 'input'"));
    }
}
