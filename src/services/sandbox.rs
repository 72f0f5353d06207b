//! Sandbox Runtime (spec §4.4 "SR").
//!
//! Turns a `Template.execution_script` into something the Executor Core can
//! run inside a capability-restricted environment. Two independent pieces:
//! a static policy checker (regex source scanners, grounded on the
//! reference codebase's `infrastructure::validators` style) and a
//! restricted expression DSL interpreted by a hand-written tree-walking VM
//! (SPEC_FULL.md §4.4 "Substrate decision": not WASM, not offline codegen).
//!
//! The DSL's grammar is deliberately minimal: expression statements, `let`
//! bindings, `if`/`for`, method calls restricted to the capability
//! surface's method names, and literals. Any identifier not bound by `let`
//! or present in the capability surface fails to resolve at parse time.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::domain::errors::TaskError;

// ---------------------------------------------------------------------
// Static policy checker
// ---------------------------------------------------------------------

/// Configurable thresholds for the static policy check (spec §4.4 step 2).
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub max_source_bytes: usize,
    pub max_array_literal_len: usize,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self { max_source_bytes: 50 * 1024, max_array_literal_len: 10_000 }
    }
}

struct PolicyRule {
    pattern: Regex,
    message: &'static str,
}

fn policy_rules() -> Vec<PolicyRule> {
    let rule = |pattern: &str, message: &'static str| PolicyRule { pattern: Regex::new(pattern).unwrap(), message };
    vec![
        rule(r"\b(fs|process|child_process|net|dgram|tls)\s*\.", "direct filesystem/process/network module access is not permitted"),
        rule(r"\beval\s*\(|\bFunction\s*\(|\bnew\s+Function\b", "dynamic code evaluation is not permitted"),
        rule(r"\bglobalThis\b|\bprocess\.\w|\b__proto__\b", "access to host process object or globals is not permitted"),
        rule(r"while\s*\(\s*true\s*\)", "infinite loops are not permitted"),
        rule(r"setInterval\s*\(\s*[^,]+,\s*0\s*\)", "zero-interval timers are not permitted"),
        rule(r#"log\s*\(\s*["'][^"']*["']\s*,\s*(?:"debug"|"info"|"warn"|"error")\s*\)"#, "log() takes (level, message), not (message, level)"),
    ]
}

/// `ValidateAndPrepareScript` (spec §4.4): returns the (possibly
/// auto-escaped) source on success, or an error message describing why the
/// script was rejected.
pub fn validate_and_prepare_script(source: &str, policy: &SandboxPolicy) -> Result<String, String> {
    if source.len() > policy.max_source_bytes {
        return Err(format!("script exceeds source size cap of {} bytes", policy.max_source_bytes));
    }

    let prepared = match parse(source) {
        Ok(_) => source.to_string(),
        Err(first_err) => {
            let escaped = auto_escape(source);
            match parse(&escaped) {
                Ok(_) => escaped,
                Err(_) => return Err(format!("script failed to compile: {first_err}")),
            }
        }
    };

    for rule in policy_rules() {
        if rule.pattern.is_match(&prepared) {
            return Err(rule.message.to_string());
        }
    }

    if let Some(len) = oversized_array_literal(&prepared, policy.max_array_literal_len) {
        return Err(format!("array literal of {len} elements exceeds configured threshold"));
    }

    Ok(prepared)
}

/// Deterministic auto-escape pass targeting unbalanced backticks inside
/// `log`/`updateProgress` calls (spec §4.4 step 1).
fn auto_escape(source: &str) -> String {
    let backtick_count = source.matches('`').count();
    if backtick_count % 2 == 1 {
        format!("{source}`")
    } else {
        source.to_string()
    }
}

fn oversized_array_literal(source: &str, max_len: usize) -> Option<usize> {
    let re = Regex::new(r"\[([^\[\]]*)\]").unwrap();
    for caps in re.captures_iter(source) {
        let elements = caps[1].split(',').filter(|s| !s.trim().is_empty()).count();
        if elements > max_len {
            return Some(elements);
        }
    }
    None
}

// ---------------------------------------------------------------------
// DSL: lexer, AST, parser
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    Call { name: String, args: Vec<Expr> },
    MethodCall { receiver: Box<Expr>, method: String, args: Vec<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Let { name: String, value: Expr },
    Expr(Expr),
    If { cond: Expr, then_branch: Vec<Stmt>, else_branch: Vec<Stmt> },
    For { binding: String, iterable: Expr, body: Vec<Stmt> },
}

/// A parsed, capability-checked program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    statements: Vec<Stmt>,
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Ident(&'a str),
    Number(f64),
    Str(String),
    Let,
    If,
    Else,
    For,
    In,
    True,
    False,
    Symbol(&'a str),
}

fn tokenize(source: &str) -> Result<Vec<Token<'_>>, String> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i] as char).is_ascii_digit() || bytes.get(i) == Some(&b'.') {
                i += 1;
            }
            let text = &source[start..i];
            let n: f64 = text.parse().map_err(|_| format!("invalid number literal '{text}'"))?;
            tokens.push(Token::Number(n));
            continue;
        }
        if c == '"' || c == '\'' || c == '`' {
            let quote = c;
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] as char != quote {
                i += 1;
            }
            if i >= bytes.len() {
                return Err("unterminated string literal".to_string());
            }
            tokens.push(Token::Str(source[start..i].to_string()));
            i += 1;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && ((bytes[i] as char).is_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = &source[start..i];
            tokens.push(match word {
                "let" => Token::Let,
                "if" => Token::If,
                "else" => Token::Else,
                "for" => Token::For,
                "in" => Token::In,
                "true" => Token::True,
                "false" => Token::False,
                other => Token::Ident(other),
            });
            continue;
        }
        // two-char operators
        if i + 1 < bytes.len() {
            let two = &source[i..i + 2];
            if matches!(two, "==" | "!=" | "<=" | ">=" | "&&" | "||") {
                tokens.push(Token::Symbol(two));
                i += 2;
                continue;
            }
        }
        if "(){}[],.;<>=!".contains(c) {
            tokens.push(Token::Symbol(&source[i..i + 1]));
            i += 1;
            continue;
        }
        return Err(format!("unexpected character '{c}' in script"));
    }
    Ok(tokens)
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token<'a>>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token<'a>> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token<'a>> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect_symbol(&mut self, sym: &str) -> Result<(), String> {
        match self.advance() {
            Some(Token::Symbol(s)) if s == sym => Ok(()),
            other => Err(format!("expected '{sym}', found {other:?}")),
        }
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>, String> {
        let mut statements = Vec::new();
        while self.peek().is_some() {
            statements.push(self.parse_stmt()?);
        }
        Ok(statements)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, String> {
        self.expect_symbol("{")?;
        let mut statements = Vec::new();
        while !matches!(self.peek(), Some(Token::Symbol("}")) | None) {
            statements.push(self.parse_stmt()?);
        }
        self.expect_symbol("}")?;
        Ok(statements)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, String> {
        match self.peek() {
            Some(Token::Let) => {
                self.advance();
                let name = match self.advance() {
                    Some(Token::Ident(name)) => name.to_string(),
                    other => return Err(format!("expected identifier after 'let', found {other:?}")),
                };
                self.expect_symbol("=")?;
                let value = self.parse_expr()?;
                self.consume_semicolon();
                Ok(Stmt::Let { name, value })
            }
            Some(Token::If) => {
                self.advance();
                self.expect_symbol("(")?;
                let cond = self.parse_expr()?;
                self.expect_symbol(")")?;
                let then_branch = self.parse_block()?;
                let else_branch = if matches!(self.peek(), Some(Token::Else)) {
                    self.advance();
                    self.parse_block()?
                } else {
                    Vec::new()
                };
                Ok(Stmt::If { cond, then_branch, else_branch })
            }
            Some(Token::For) => {
                self.advance();
                self.expect_symbol("(")?;
                let binding = match self.advance() {
                    Some(Token::Ident(name)) => name.to_string(),
                    other => return Err(format!("expected loop variable, found {other:?}")),
                };
                match self.advance() {
                    Some(Token::In) => {}
                    other => return Err(format!("expected 'in', found {other:?}")),
                }
                let iterable = self.parse_expr()?;
                self.expect_symbol(")")?;
                let body = self.parse_block()?;
                Ok(Stmt::For { binding, iterable, body })
            }
            Some(_) => {
                let expr = self.parse_expr()?;
                self.consume_semicolon();
                Ok(Stmt::Expr(expr))
            }
            None => Err("unexpected end of script".to_string()),
        }
    }

    fn consume_semicolon(&mut self) {
        if matches!(self.peek(), Some(Token::Symbol(";"))) {
            self.advance();
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Symbol("||"))) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_comparison()?;
        while matches!(self.peek(), Some(Token::Symbol("&&"))) {
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Symbol("==")) => Some(BinOp::Eq),
            Some(Token::Symbol("!=")) => Some(BinOp::Neq),
            Some(Token::Symbol("<")) => Some(BinOp::Lt),
            Some(Token::Symbol(">")) => Some(BinOp::Gt),
            Some(Token::Symbol("<=")) => Some(BinOp::Le),
            Some(Token::Symbol(">=")) => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_primary()?;
            return Ok(Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) });
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let mut expr = match self.advance() {
            Some(Token::Number(n)) => Expr::Number(n),
            Some(Token::Str(s)) => Expr::Str(s),
            Some(Token::True) => Expr::Bool(true),
            Some(Token::False) => Expr::Bool(false),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::Symbol("("))) {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::Symbol(")"))) {
                        loop {
                            args.push(self.parse_expr()?);
                            if matches!(self.peek(), Some(Token::Symbol(","))) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect_symbol(")")?;
                    Expr::Call { name: name.to_string(), args }
                } else {
                    Expr::Ident(name.to_string())
                }
            }
            Some(Token::Symbol("(")) => {
                let inner = self.parse_expr()?;
                self.expect_symbol(")")?;
                inner
            }
            other => return Err(format!("unexpected token {other:?} in expression")),
        };

        while let Some(Token::Symbol(".")) = self.peek() {
            self.advance();
            let method = match self.advance() {
                Some(Token::Ident(name)) => name.to_string(),
                other => return Err(format!("expected method name after '.', found {other:?}")),
            };
            self.expect_symbol("(")?;
            let mut args = Vec::new();
            if !matches!(self.peek(), Some(Token::Symbol(")"))) {
                loop {
                    args.push(self.parse_expr()?);
                    if matches!(self.peek(), Some(Token::Symbol(","))) {
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
            self.expect_symbol(")")?;
            expr = Expr::MethodCall { receiver: Box::new(expr), method, args };
        }
        Ok(expr)
    }
}

/// Parse `source` into a [`Program`], failing if any identifier is neither
/// `let`-bound in its own statement sequence nor later resolved against the
/// capability surface at interpretation time (spec §4.4: "fail at compile
/// or first use").
pub fn parse(source: &str) -> Result<Program, String> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens);
    let statements = parser.parse_program()?;
    Ok(Program { statements })
}

// ---------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------

/// The capability surface injected into every executor (spec §4.4). Method
/// dispatch is restricted to whatever this implementation recognizes;
/// anything else is rejected at first use.
#[async_trait]
pub trait CapabilitySurface: Send + Sync {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, TaskError>;
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: BinOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        BinOp::Eq => lhs == rhs,
        BinOp::Neq => lhs != rhs,
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            let (Some(l), Some(r)) = (lhs.as_f64(), rhs.as_f64()) else { return false };
            match op {
                BinOp::Lt => l < r,
                BinOp::Gt => l > r,
                BinOp::Le => l <= r,
                BinOp::Ge => l >= r,
                _ => unreachable!(),
            }
        }
        BinOp::And => truthy(lhs) && truthy(rhs),
        BinOp::Or => truthy(lhs) || truthy(rhs),
    }
}

/// Executes a parsed [`Program`] against a capability surface, threading an
/// environment of `let`-bound values. Every suspension point (capability
/// method call) is a genuine `.await` so execution is cooperatively
/// scheduled on the tokio runtime (spec §4.5 implementation note).
pub struct Interpreter<'a, C: CapabilitySurface> {
    capabilities: &'a C,
}

impl<'a, C: CapabilitySurface> Interpreter<'a, C> {
    pub fn new(capabilities: &'a C) -> Self {
        Self { capabilities }
    }

    pub async fn run(&self, program: &Program) -> Result<(), TaskError> {
        let mut env = HashMap::new();
        for stmt in &program.statements {
            self.exec(stmt, &mut env).await?;
        }
        Ok(())
    }

    fn exec<'b>(&'b self, stmt: &'b Stmt, env: &'b mut HashMap<String, Value>) -> futures::future::BoxFuture<'b, Result<(), TaskError>> {
        Box::pin(async move {
            match stmt {
                Stmt::Let { name, value } => {
                    let result = self.eval(value, env).await?;
                    env.insert(name.clone(), result);
                    Ok(())
                }
                Stmt::Expr(expr) => {
                    self.eval(expr, env).await?;
                    Ok(())
                }
                Stmt::If { cond, then_branch, else_branch } => {
                    let cond_value = self.eval(cond, env).await?;
                    let branch = if truthy(&cond_value) { then_branch } else { else_branch };
                    for s in branch {
                        self.exec(s, env).await?;
                    }
                    Ok(())
                }
                Stmt::For { binding, iterable, body } => {
                    let items = self.eval(iterable, env).await?;
                    let Value::Array(items) = items else {
                        return Err(TaskError::CompileError(format!("'{binding}' iterates over a non-array value")));
                    };
                    for item in items {
                        env.insert(binding.clone(), item);
                        for s in body {
                            self.exec(s, env).await?;
                        }
                    }
                    Ok(())
                }
            }
        })
    }

    fn eval<'b>(&'b self, expr: &'b Expr, env: &'b mut HashMap<String, Value>) -> futures::future::BoxFuture<'b, Result<Value, TaskError>> {
        Box::pin(async move {
            match expr {
                Expr::Number(n) => Ok(serde_json::json!(n)),
                Expr::Str(s) => Ok(Value::String(s.clone())),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Ident(name) => env
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TaskError::CompileError(format!("unresolved identifier '{name}'"))),
                Expr::Binary { op, lhs, rhs } => {
                    let l = self.eval(lhs, env).await?;
                    let r = self.eval(rhs, env).await?;
                    Ok(Value::Bool(compare(*op, &l, &r)))
                }
                Expr::Call { name, args } => {
                    let mut arg_values = Vec::with_capacity(args.len());
                    for arg in args {
                        arg_values.push(self.eval(arg, env).await?);
                    }
                    self.capabilities.call(name, arg_values).await
                }
                Expr::MethodCall { receiver, method, args } => {
                    // Only identifier receivers are meaningful here: the
                    // capability surface is a flat namespace of methods,
                    // not an object graph, per spec §4.4.
                    if !matches!(receiver.as_ref(), Expr::Ident(_)) {
                        return Err(TaskError::CompileError("method receivers must be capability names".to_string()));
                    }
                    let mut arg_values = Vec::with_capacity(args.len());
                    for arg in args {
                        arg_values.push(self.eval(arg, env).await?);
                    }
                    self.capabilities.call(method, arg_values).await
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingCapabilities {
        calls: tokio::sync::Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl CapabilitySurface for RecordingCapabilities {
        async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, TaskError> {
            self.calls.lock().await.push((method.to_string(), args));
            Ok(Value::Null)
        }
    }

    #[test]
    fn policy_rejects_filesystem_access() {
        let policy = SandboxPolicy::default();
        let result = validate_and_prepare_script("fs.readFileSync('/etc/passwd');", &policy);
        assert!(result.is_err());
    }

    #[test]
    fn policy_rejects_eval() {
        let policy = SandboxPolicy::default();
        assert!(validate_and_prepare_script("eval('1+1');", &policy).is_err());
    }

    #[test]
    fn policy_rejects_infinite_loop() {
        let policy = SandboxPolicy::default();
        assert!(validate_and_prepare_script("while (true) { log(\"info\", \"x\"); }", &policy).is_err());
    }

    #[test]
    fn policy_rejects_oversized_source() {
        let policy = SandboxPolicy { max_source_bytes: 10, ..SandboxPolicy::default() };
        assert!(validate_and_prepare_script("let x = 1; let y = 2;", &policy).is_err());
    }

    #[test]
    fn valid_script_passes() {
        let policy = SandboxPolicy::default();
        let source = r#"let percent = 50; updateProgress(percent, "halfway");"#;
        assert!(validate_and_prepare_script(source, &policy).is_ok());
    }

    #[test]
    fn auto_escape_recovers_unbalanced_backtick() {
        let policy = SandboxPolicy::default();
        // Missing closing backtick — should be auto-escaped and recompiled.
        let source = "let msg = `hello; log(\"info\", msg);";
        let result = validate_and_parse(source, &policy);
        assert!(result.is_ok());
    }

    fn validate_and_parse(source: &str, policy: &SandboxPolicy) -> Result<(), String> {
        let prepared = validate_and_prepare_script(source, policy)?;
        parse(&prepared)?;
        Ok(())
    }

    #[tokio::test]
    async fn interpreter_resolves_let_bindings_and_dispatches_calls() {
        let program = parse(r#"let percent = 50; updateProgress(percent, "halfway");"#).unwrap();
        let caps = RecordingCapabilities { calls: tokio::sync::Mutex::new(Vec::new()) };
        let interpreter = Interpreter::new(&caps);
        interpreter.run(&program).await.unwrap();
        let calls = caps.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "updateProgress");
    }

    #[tokio::test]
    async fn interpreter_fails_on_unresolved_identifier() {
        let program = parse("log(undefinedVar);").unwrap();
        let caps = RecordingCapabilities { calls: tokio::sync::Mutex::new(Vec::new()) };
        let interpreter = Interpreter::new(&caps);
        let result = interpreter.run(&program).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn interpreter_runs_if_and_for() {
        let program = parse(
            r#"
            if (true) {
                log("info", "entered");
            }
            "#,
        )
        .unwrap();
        let caps = RecordingCapabilities { calls: tokio::sync::Mutex::new(Vec::new()) };
        let interpreter = Interpreter::new(&caps);
        interpreter.run(&program).await.unwrap();
        assert_eq!(caps.calls.lock().await.len(), 1);
    }
}
