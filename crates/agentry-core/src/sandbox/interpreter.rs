//! Tree-walking evaluator for one sandboxed run.
//!
//! A fresh [`Interpreter`] is built per execution; the compiled [`Program`] it
//! walks is shared and immutable.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use super::ast::{BinaryOp, Expr, PathStep, Program, Stmt, UnaryOp};
use super::budget::{estimate_size, Budget};
use super::builtins::{self, display, to_f64, type_name};
use super::capability::Capability;
use super::error::{SandboxError, SandboxResult};
use super::host::HostModules;
use super::parser::number;

/// Control-flow outcome of executing a statement.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Slot {
    value: Value,
    size: usize,
}

enum Key {
    Field(String),
    Position(usize),
}

pub struct Interpreter<'a> {
    origin: &'a str,
    granted: &'a BTreeSet<Capability>,
    hosts: &'a HostModules,
    budget: Budget,
    scopes: Vec<HashMap<String, Slot>>,
    /// Line of the statement being executed, for error reports.
    line: usize,
}

impl<'a> Interpreter<'a> {
    /// `granted` is the set of modules the function may call at runtime.
    pub fn new(
        origin: &'a str,
        granted: &'a BTreeSet<Capability>,
        hosts: &'a HostModules,
        budget: Budget,
    ) -> Self {
        Self {
            origin,
            granted,
            hosts,
            budget,
            scopes: vec![HashMap::new()],
            line: 0,
        }
    }

    /// Runs `program` to completion; `null` if it finishes without `return`.
    pub fn run(mut self, program: &Program, input: &Value) -> SandboxResult<Value> {
        self.declare("input", input.clone())?;
        if let Value::Object(fields) = input {
            for (key, value) in fields {
                self.declare(key, value.clone())?;
            }
        }

        let result = match self.block_in_scope(&program.body)? {
            Flow::Return(value) => value,
            _ => Value::Null,
        };
        self.budget.reserve(estimate_size(&result))?;
        Ok(result)
    }

    // -- variables ----------------------------------------------------------

    fn declare(&mut self, name: &str, value: Value) -> SandboxResult<()> {
        let size = estimate_size(&value);
        let old = self
            .scopes
            .last()
            .and_then(|scope| scope.get(name))
            .map_or(0, |slot| slot.size);
        self.budget.account(old, size)?;
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), Slot { value, size });
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> SandboxResult<&Value> {
        let line = self.line;
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .map(|slot| &slot.value)
            .ok_or_else(|| SandboxError::runtime(line, format!("undefined variable '{name}'")))
    }

    fn slot_mut(&mut self, name: &str) -> SandboxResult<&mut Slot> {
        let line = self.line;
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
            .ok_or_else(|| SandboxError::runtime(line, format!("assignment to undefined variable '{name}'")))
    }

    fn assign(&mut self, name: &str, keys: Vec<Key>, value: Value) -> SandboxResult<()> {
        let line = self.line;
        let slot = self.slot_mut(name)?;
        if keys.is_empty() {
            slot.value = value;
        } else {
            set_path(&mut slot.value, &keys, value, line)?;
        }
        let old = slot.size;
        let new = estimate_size(&slot.value);
        slot.size = new;
        self.budget.account(old, new)
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            let freed: usize = scope.values().map(|slot| slot.size).sum();
            self.budget.release(freed);
        }
    }

    // -- statements ---------------------------------------------------------

    fn block_in_scope(&mut self, body: &[Stmt]) -> SandboxResult<Flow> {
        self.push_scope();
        let flow = self.block(body);
        self.pop_scope();
        flow
    }

    fn block(&mut self, body: &[Stmt]) -> SandboxResult<Flow> {
        for stmt in body {
            match self.stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn stmt(&mut self, stmt: &Stmt) -> SandboxResult<Flow> {
        self.budget.tick()?;
        self.line = stmt.line();
        match stmt {
            Stmt::Import { .. } => Ok(Flow::Normal),
            Stmt::Let { name, value, .. } => {
                let value = self.eval(value)?;
                self.declare(name, value)?;
                Ok(Flow::Normal)
            }
            Stmt::Assign {
                name,
                path,
                value,
                line,
            } => {
                let mut keys = Vec::with_capacity(path.len());
                for step in path {
                    keys.push(match step {
                        PathStep::Member(field) => Key::Field(field.clone()),
                        PathStep::Index(index) => {
                            let index = self.eval(index)?;
                            key_of(&index, *line)?
                        }
                    });
                }
                let value = self.eval(value)?;
                self.assign(name, keys, value)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                branches,
                otherwise,
                ..
            } => {
                for (cond, body) in branches {
                    if truthy(&self.eval(cond)?) {
                        return self.block_in_scope(body);
                    }
                }
                match otherwise {
                    Some(body) => self.block_in_scope(body),
                    None => Ok(Flow::Normal),
                }
            }
            Stmt::While { cond, body, .. } => {
                loop {
                    self.budget.tick()?;
                    if !truthy(&self.eval(cond)?) {
                        break;
                    }
                    match self.block_in_scope(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                var,
                iter,
                body,
                line,
            } => {
                let items: Vec<Value> = match self.eval(iter)? {
                    Value::Array(items) => items,
                    Value::Object(map) => map.into_iter().map(|(k, _)| Value::String(k)).collect(),
                    Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                    other => {
                        return Err(SandboxError::runtime(
                            *line,
                            format!("cannot iterate over {}", type_name(&other)),
                        ))
                    }
                };
                for item in items {
                    self.budget.tick()?;
                    self.push_scope();
                    let flow = match self.declare(var, item) {
                        Ok(()) => self.block(body),
                        Err(e) => Err(e),
                    };
                    self.pop_scope();
                    match flow? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return { value, .. } => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break { .. } => Ok(Flow::Break),
            Stmt::Continue { .. } => Ok(Flow::Continue),
            Stmt::Expr { expr, .. } => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
        }
    }

    // -- expressions --------------------------------------------------------

    fn eval(&mut self, expr: &Expr) -> SandboxResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => self.lookup(name).cloned(),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                let value = Value::Array(values);
                self.budget.reserve(estimate_size(&value))?;
                Ok(value)
            }
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, item) in fields {
                    let value = self.eval(item)?;
                    map.insert(key.clone(), value);
                }
                let value = Value::Object(map);
                self.budget.reserve(estimate_size(&value))?;
                Ok(value)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => Ok(number(-to_f64(&value, self.line, "unary '-'")?)),
                }
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                if !truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                if truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right)
            }
            Expr::Member(base, key) => match self.eval(base)? {
                Value::Object(mut map) => Ok(map.remove(key).unwrap_or(Value::Null)),
                other => Err(SandboxError::runtime(
                    self.line,
                    format!("cannot read '{key}' of {}", type_name(&other)),
                )),
            },
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                index_value(base, &index, self.line)
            }
            Expr::Call { name, args, line } => {
                let args = self.eval_args(args)?;
                builtins::call_core(name, args, *line, &self.budget)
            }
            Expr::ModuleCall {
                module,
                function,
                args,
                line,
            } => {
                let cap = self.check_capability(module, *line)?;
                let args = self.eval_args(args)?;
                if cap.is_builtin() {
                    return builtins::call_module(cap, function, args, *line, &self.budget, self.origin);
                }
                let provider = self.hosts.get(cap).ok_or_else(|| {
                    SandboxError::runtime(*line, format!("module '{cap}' has no provider installed"))
                })?;
                let value = provider
                    .call(function, &args)
                    .map_err(|message| SandboxError::runtime(*line, message))?;
                self.budget.reserve(estimate_size(&value))?;
                Ok(value)
            }
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> SandboxResult<Vec<Value>> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }

    /// Runtime half of capability enforcement; the analyzer has already run.
    fn check_capability(&self, module: &str, line: usize) -> SandboxResult<Capability> {
        let cap: Capability = module
            .parse()
            .map_err(|reason| SandboxError::Violation { line, reason })?;
        if !self.granted.contains(&cap) {
            return Err(SandboxError::Violation {
                line,
                reason: format!("module '{module}' is not granted"),
            });
        }
        Ok(cap)
    }

    fn binary(&self, op: BinaryOp, left: Value, right: Value) -> SandboxResult<Value> {
        let line = self.line;
        match op {
            BinaryOp::Add => match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                    finite(a + b, line)
                }
                (Value::Array(mut a), Value::Array(b)) => {
                    let size: usize = a.iter().chain(b.iter()).map(estimate_size).sum();
                    self.budget.reserve(24 + size)?;
                    a.extend(b);
                    Ok(Value::Array(a))
                }
                (l @ Value::String(_), r) | (l, r @ Value::String(_)) => {
                    let (l, r) = (display(&l), display(&r));
                    self.budget.reserve(24 + l.len() + r.len())?;
                    Ok(Value::String(l + &r))
                }
                (l, r) => Err(SandboxError::runtime(
                    line,
                    format!("cannot add {} and {}", type_name(&l), type_name(&r)),
                )),
            },
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                let a = to_f64(&left, line, "arithmetic")?;
                let b = to_f64(&right, line, "arithmetic")?;
                let result = match op {
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div if b == 0.0 => {
                        return Err(SandboxError::runtime(line, "division by zero"))
                    }
                    BinaryOp::Div => a / b,
                    BinaryOp::Rem if b == 0.0 => {
                        return Err(SandboxError::runtime(line, "modulo by zero"))
                    }
                    _ => a % b,
                };
                finite(result, line)
            }
            BinaryOp::Eq => Ok(Value::Bool(loose_eq(&left, &right))),
            BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(&left, &right))),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                let ordering = compare(&left, &right, line)?;
                Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering == Ordering::Less,
                    BinaryOp::LtEq => ordering != Ordering::Greater,
                    BinaryOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }))
            }
            BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(truthy(&left) && truthy(&right))),
        }
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality that treats `2` and `2.0` as the same number.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value, line: usize) -> SandboxResult<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))
            .ok_or_else(|| SandboxError::runtime(line, "numbers are not comparable")),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (l, r) => Err(SandboxError::runtime(
            line,
            format!("cannot compare {} with {}", type_name(l), type_name(r)),
        )),
    }
}

fn key_of(index: &Value, line: usize) -> SandboxResult<Key> {
    match index {
        Value::String(s) => Ok(Key::Field(s.clone())),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x >= 0.0 && x.fract() == 0.0 => Ok(Key::Position(x as usize)),
            _ => Err(SandboxError::runtime(line, format!("invalid index {n}"))),
        },
        other => Err(SandboxError::runtime(
            line,
            format!("cannot index with {}", type_name(other)),
        )),
    }
}

fn index_value(base: Value, index: &Value, line: usize) -> SandboxResult<Value> {
    match (base, key_of(index, line)?) {
        (Value::Object(mut map), Key::Field(key)) => Ok(map.remove(&key).unwrap_or(Value::Null)),
        (Value::Array(mut items), Key::Position(i)) => {
            if i >= items.len() {
                return Err(SandboxError::runtime(
                    line,
                    format!("index {i} out of range for array of length {}", items.len()),
                ));
            }
            Ok(items.swap_remove(i))
        }
        (Value::String(s), Key::Position(i)) => Ok(s
            .chars()
            .nth(i)
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        (other, _) => Err(SandboxError::runtime(
            line,
            format!("cannot index into {}", type_name(&other)),
        )),
    }
}

fn set_path(target: &mut Value, keys: &[Key], value: Value, line: usize) -> SandboxResult<()> {
    let Some((last, parents)) = keys.split_last() else {
        *target = value;
        return Ok(());
    };
    let mut current = target;
    for key in parents {
        current = child_mut(current, key, line)?;
    }
    match (current, last) {
        (Value::Object(map), Key::Field(field)) => {
            map.insert(field.clone(), value);
            Ok(())
        }
        (Value::Array(items), Key::Position(i)) if *i < items.len() => {
            items[*i] = value;
            Ok(())
        }
        (Value::Array(items), Key::Position(i)) if *i == items.len() => {
            items.push(value);
            Ok(())
        }
        (other, _) => Err(SandboxError::runtime(
            line,
            format!("cannot assign into {}", type_name(other)),
        )),
    }
}

fn child_mut<'v>(value: &'v mut Value, key: &Key, line: usize) -> SandboxResult<&'v mut Value> {
    match (value, key) {
        (Value::Object(map), Key::Field(field)) => map
            .get_mut(field)
            .ok_or_else(|| SandboxError::runtime(line, format!("no field '{field}'"))),
        (Value::Array(items), Key::Position(i)) => {
            let len = items.len();
            items
                .get_mut(*i)
                .ok_or_else(|| SandboxError::runtime(line, format!("index {i} out of range for length {len}")))
        }
        (other, _) => Err(SandboxError::runtime(
            line,
            format!("cannot index into {}", type_name(other)),
        )),
    }
}

/// Arithmetic results must stay representable as JSON numbers.
fn finite(result: f64, line: usize) -> SandboxResult<Value> {
    if result.is_finite() {
        Ok(number(result))
    } else {
        Err(SandboxError::runtime(line, "numeric overflow"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::parser::parse;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn run_with(source: &str, input: Value, granted: &[Capability], mb: u64, ms: u64) -> SandboxResult<Value> {
        let program = parse(source).expect("parse");
        let granted: BTreeSet<Capability> = granted.iter().copied().collect();
        let hosts = HostModules::new();
        let budget = Budget::new(mb, Duration::from_millis(ms), Arc::new(AtomicBool::new(false)));
        Interpreter::new("test", &granted, &hosts, budget).run(&program, &input)
    }

    fn run(source: &str, input: Value) -> SandboxResult<Value> {
        run_with(source, input, &[], 16, 5_000)
    }

    #[test]
    fn test_double() {
        let out = run("return { result: x * 2 };", json!({"x": 21})).unwrap();
        assert_eq!(out, json!({"result": 42}));
    }

    #[test]
    fn test_overflow_is_a_runtime_error() {
        for source in ["return x * 10;", "return x + x;", "return -x - x;"] {
            let err = run(source, json!({"x": 1e308})).unwrap_err();
            assert!(
                matches!(&err, SandboxError::Runtime { message, .. } if message == "numeric overflow"),
                "{source}: {err:?}"
            );
        }
        assert!(run("return x * 10;", json!({"x": 1e300})).is_ok());
    }

    #[test]
    fn test_no_return_yields_null() {
        assert_eq!(run("let a = 1;", json!({})).unwrap(), Value::Null);
    }

    #[test]
    fn test_input_binding() {
        assert_eq!(run("return input;", json!(7)).unwrap(), json!(7));
        assert_eq!(run("return input.a + a;", json!({"a": 1})).unwrap(), json!(2));
    }

    #[test]
    fn test_loops_and_control_flow() {
        let source = r#"
            let total = 0;
            for n in range(10) {
                if n % 2 == 0 { continue; }
                if n > 7 { break; }
                total = total + n;
            }
            let i = 0;
            while i < 3 { i = i + 1; }
            return [total, i];
        "#;
        assert_eq!(run(source, json!({})).unwrap(), json!([16, 3]));
    }

    #[test]
    fn test_nested_assignment() {
        let source = r#"
            let out = { items: [1, 2], meta: {} };
            out.items[1] = 5;
            out.items[2] = 6;
            out.meta.tag = "x";
            return out;
        "#;
        assert_eq!(
            run(source, json!({})).unwrap(),
            json!({"items": [1, 5, 6], "meta": {"tag": "x"}})
        );
    }

    #[test]
    fn test_block_scoping() {
        let err = run("if true { let inner = 1; } return inner;", json!({})).unwrap_err();
        assert!(matches!(err, SandboxError::Runtime { .. }));
        let out = run("let a = 1; if true { a = 2; } return a;", json!({})).unwrap();
        assert_eq!(out, json!(2));
    }

    #[test]
    fn test_string_concat_and_equality() {
        assert_eq!(run("return \"n=\" + 3;", json!({})).unwrap(), json!("n=3"));
        assert_eq!(run("return x == 2;", json!({"x": 2.0})).unwrap(), json!(true));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(
            run("return 1 / 0;", json!({})).unwrap_err(),
            SandboxError::Runtime { .. }
        ));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let err = run_with("while true { }", json!({}), &[], 16, 50).unwrap_err();
        assert_eq!(err, SandboxError::Timeout { limit_ms: 50 });
    }

    #[test]
    fn test_growing_string_hits_memory_limit() {
        let source = r#"
            let s = "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx";
            while true { s = s + s; }
        "#;
        let err = run_with(source, json!({}), &[], 1, 5_000).unwrap_err();
        assert!(matches!(err, SandboxError::MemoryLimit { .. }));
    }

    #[test]
    fn test_runtime_capability_check() {
        // analyzer bypassed: the interpreter still refuses ungranted modules
        let err = run("return math.floor(1.5);", json!({})).unwrap_err();
        assert!(matches!(err, SandboxError::Violation { .. }));
        let out = run_with("import math; return math.floor(1.5);", json!({}), &[Capability::Math], 16, 1_000)
            .unwrap();
        assert_eq!(out, json!(1));
    }

    #[test]
    fn test_error_builtin_aborts() {
        let err = run("if x < 0 { error(\"negative\"); } return x;", json!({"x": -1})).unwrap_err();
        assert_eq!(err, SandboxError::runtime(1, "negative"));
    }
}
