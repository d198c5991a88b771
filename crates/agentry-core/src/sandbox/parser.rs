//! Recursive-descent parser producing a [`Program`].

use serde_json::Value;

use super::ast::{BinaryOp, Expr, PathStep, Program, Stmt, UnaryOp};
use super::error::{SandboxError, SandboxResult};
use super::lexer::{tokenize, Spanned, Token};

/// Bound on syntax tree depth. Blocks, nested expressions, and every operator
/// or postfix step folded into a chain each count one level, so neither
/// `((((x))))` nor `1 + 1 + ... + 1` can build a tree deep enough to exhaust
/// the native stack in later passes.
const MAX_NESTING: usize = 128;

pub fn parse(source: &str) -> SandboxResult<Program> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };
    let mut body = Vec::new();
    while !parser.at(&Token::Eof) {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn line(&self) -> usize {
        let idx = self.pos.min(self.tokens.len() - 1);
        self.tokens[idx].line
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> SandboxResult<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn ident(&mut self, what: &str) -> SandboxResult<String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(self.error(format!("expected {what}, found {other:?}"))),
        }
    }

    fn enter(&mut self) -> SandboxResult<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    // -- statements ---------------------------------------------------------

    fn block(&mut self) -> SandboxResult<Vec<Stmt>> {
        self.enter()?;
        self.expect(Token::LBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.at(&Token::RBrace) {
            if self.at(&Token::Eof) {
                return Err(self.error("unterminated block"));
            }
            body.push(self.statement()?);
        }
        self.advance();
        self.leave();
        Ok(body)
    }

    fn statement(&mut self) -> SandboxResult<Stmt> {
        let line = self.line();
        match self.peek() {
            Token::Import => {
                self.advance();
                let module = self.ident("module name")?;
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Import { module, line })
            }
            Token::Let => {
                self.advance();
                let name = self.ident("variable name")?;
                self.expect(Token::Assign, "'='")?;
                let value = self.expression()?;
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Let { name, value, line })
            }
            Token::If => self.if_statement(),
            Token::While => {
                self.advance();
                let cond = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::While { cond, body, line })
            }
            Token::For => {
                self.advance();
                let var = self.ident("loop variable")?;
                self.expect(Token::In, "'in'")?;
                let iter = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::For {
                    var,
                    iter,
                    body,
                    line,
                })
            }
            Token::Return => {
                self.advance();
                let value = if self.at(&Token::Semicolon) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Return { value, line })
            }
            Token::Break => {
                self.advance();
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Break { line })
            }
            Token::Continue => {
                self.advance();
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Continue { line })
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&Token::Assign) {
                    let (name, path) = self.assign_target(expr)?;
                    let value = self.expression()?;
                    self.expect(Token::Semicolon, "';'")?;
                    return Ok(Stmt::Assign {
                        name,
                        path,
                        value,
                        line,
                    });
                }
                self.expect(Token::Semicolon, "';'")?;
                Ok(Stmt::Expr { expr, line })
            }
        }
    }

    fn if_statement(&mut self) -> SandboxResult<Stmt> {
        let line = self.line();
        let mut branches = Vec::new();
        let mut otherwise = None;

        self.expect(Token::If, "'if'")?;
        let cond = self.expression()?;
        branches.push((cond, self.block()?));

        while self.eat(&Token::Else) {
            if self.eat(&Token::If) {
                let cond = self.expression()?;
                branches.push((cond, self.block()?));
            } else {
                otherwise = Some(self.block()?);
                break;
            }
        }

        Ok(Stmt::If {
            branches,
            otherwise,
            line,
        })
    }

    fn assign_target(&self, expr: Expr) -> SandboxResult<(String, Vec<PathStep>)> {
        let mut path = Vec::new();
        let mut current = expr;
        loop {
            match current {
                Expr::Var(name) => {
                    path.reverse();
                    return Ok((name, path));
                }
                Expr::Member(base, key) => {
                    path.push(PathStep::Member(key));
                    current = *base;
                }
                Expr::Index(base, index) => {
                    path.push(PathStep::Index(*index));
                    current = *base;
                }
                _ => return Err(self.error("invalid assignment target")),
            }
        }
    }

    // -- expressions --------------------------------------------------------

    fn expression(&mut self) -> SandboxResult<Expr> {
        self.enter()?;
        let expr = self.or();
        self.leave();
        expr
    }

    fn binary_level(
        &mut self,
        ops: &[(Token, BinaryOp)],
        next: fn(&mut Self) -> SandboxResult<Expr>,
    ) -> SandboxResult<Expr> {
        let mut left = next(self)?;
        let mut folded = 0;
        'outer: loop {
            for (token, op) in ops {
                if self.eat(token) {
                    self.enter()?;
                    folded += 1;
                    let right = next(self)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            break;
        }
        self.nesting -= folded;
        Ok(left)
    }

    fn or(&mut self) -> SandboxResult<Expr> {
        self.binary_level(&[(Token::OrOr, BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> SandboxResult<Expr> {
        self.binary_level(&[(Token::AndAnd, BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> SandboxResult<Expr> {
        self.binary_level(
            &[(Token::Eq, BinaryOp::Eq), (Token::NotEq, BinaryOp::NotEq)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> SandboxResult<Expr> {
        self.binary_level(
            &[
                (Token::LtEq, BinaryOp::LtEq),
                (Token::GtEq, BinaryOp::GtEq),
                (Token::Lt, BinaryOp::Lt),
                (Token::Gt, BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> SandboxResult<Expr> {
        self.binary_level(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> SandboxResult<Expr> {
        self.binary_level(
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> SandboxResult<Expr> {
        if self.eat(&Token::Minus) {
            self.enter()?;
            let operand = self.unary()?;
            self.leave();
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        if self.eat(&Token::Bang) {
            self.enter()?;
            let operand = self.unary()?;
            self.leave();
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> SandboxResult<Expr> {
        let mut expr = self.primary()?;
        let mut folded = 0;
        loop {
            if self.eat(&Token::Dot) {
                self.enter()?;
                folded += 1;
                let key = self.ident("property name")?;
                expr = Expr::Member(Box::new(expr), key);
            } else if self.eat(&Token::LBracket) {
                self.enter()?;
                folded += 1;
                let index = self.expression()?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        self.nesting -= folded;
        Ok(expr)
    }

    fn arguments(&mut self) -> SandboxResult<Vec<Expr>> {
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expression()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma, "',' or ')'")?;
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> SandboxResult<Expr> {
        let line = self.line();
        match self.advance() {
            Token::Number(n) if !n.is_finite() => Err(SandboxError::Syntax {
                line,
                message: "number literal out of range".to_string(),
            }),
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                let expr = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma, "',' or ']'")?;
                        // trailing comma
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                let mut fields = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Token::Ident(k) | Token::Str(k) => k,
                            other => {
                                return Err(self.error(format!("expected object key, found {other:?}")))
                            }
                        };
                        self.expect(Token::Colon, "':'")?;
                        fields.push((key, self.expression()?));
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                        self.expect(Token::Comma, "',' or '}'")?;
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                    }
                }
                Ok(Expr::Object(fields))
            }
            Token::Ident(name) => {
                if self.at(&Token::LParen) {
                    let args = self.arguments()?;
                    return Ok(Expr::Call { name, args, line });
                }
                let is_module_call = self.at(&Token::Dot)
                    && matches!(self.peek_at(1), Token::Ident(_))
                    && self.peek_at(2) == &Token::LParen;
                if is_module_call {
                    self.advance();
                    let function = self.ident("function name")?;
                    let args = self.arguments()?;
                    return Ok(Expr::ModuleCall {
                        module: name,
                        function,
                        args,
                        line,
                    });
                }
                Ok(Expr::Var(name))
            }
            other => Err(SandboxError::Syntax {
                line,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }
}

/// Integral doubles become JSON integers so `2 * 21` reads back as `42`.
pub(crate) fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_let_and_return() {
        let program = parse("let y = x * 2;\nreturn y;").unwrap();
        assert_eq!(program.body.len(), 2);
        assert!(matches!(program.body[1], Stmt::Return { line: 2, .. }));
    }

    #[test]
    fn test_precedence() {
        let program = parse("return 1 + 2 * 3;").unwrap();
        let Stmt::Return {
            value: Some(Expr::Binary(BinaryOp::Add, _, right)),
            ..
        } = &program.body[0]
        else {
            panic!("expected addition at the root");
        };
        assert!(matches!(**right, Expr::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn test_module_call_vs_member() {
        let program = parse("let a = math.floor(x); let b = obj.field;").unwrap();
        assert!(matches!(
            &program.body[0],
            Stmt::Let { value: Expr::ModuleCall { module, function, .. }, .. }
                if module == "math" && function == "floor"
        ));
        assert!(matches!(
            &program.body[1],
            Stmt::Let { value: Expr::Member(_, key), .. } if key == "field"
        ));
    }

    #[test]
    fn test_else_if_chain() {
        let program =
            parse("if x > 1 { return 1; } else if x > 0 { return 0; } else { return -1; }")
                .unwrap();
        let Stmt::If {
            branches, otherwise, ..
        } = &program.body[0]
        else {
            panic!("expected if");
        };
        assert_eq!(branches.len(), 2);
        assert!(otherwise.is_some());
    }

    #[test]
    fn test_nested_assignment_target() {
        let program = parse("out.items[0] = 5;").unwrap();
        let Stmt::Assign { name, path, .. } = &program.body[0] else {
            panic!("expected assignment");
        };
        assert_eq!(name, "out");
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn test_object_literal_with_quoted_key() {
        let program = parse(r#"return { result: 1, "the key": 2, };"#).unwrap();
        let Stmt::Return {
            value: Some(Expr::Object(fields)),
            ..
        } = &program.body[0]
        else {
            panic!("expected object");
        };
        assert_eq!(fields[1].0, "the key");
    }

    #[test]
    fn test_missing_semicolon_reports_line() {
        let err = parse("let a = 1;\nlet b = 2\n").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { line: 3, .. }));
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(parse("1 = 2;").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let source = format!("return {}1{};", "(".repeat(200), ")".repeat(200));
        assert!(parse(&source).is_err());
    }

    #[test]
    fn test_long_operator_chain_is_rejected() {
        let source = format!("return {}1;", "1 + ".repeat(50_000));
        assert!(matches!(parse(&source), Err(SandboxError::Syntax { .. })));

        let mixed = format!("return x{};", " * 2 - 1".repeat(25_000));
        assert!(matches!(parse(&mixed), Err(SandboxError::Syntax { .. })));
    }

    #[test]
    fn test_long_postfix_chain_is_rejected() {
        let members = format!("return a{};", ".b".repeat(50_000));
        assert!(matches!(parse(&members), Err(SandboxError::Syntax { .. })));

        let indexes = format!("return x{};", "[0]".repeat(50_000));
        assert!(matches!(parse(&indexes), Err(SandboxError::Syntax { .. })));
    }

    #[test]
    fn test_moderate_chains_still_parse() {
        let sum = format!("return {}1;", "x + ".repeat(40));
        assert!(parse(&sum).is_ok());
        assert!(parse("return a.b.c[0].d[1][2] + a.b;").is_ok());
        // folded operators are released once the chain is built
        let lines = format!("let s = 0;\n{}return s;", "s = s + 1 + 1 + 1;\n".repeat(500));
        assert!(parse(&lines).is_ok());
    }

    #[test]
    fn test_out_of_range_literal_is_rejected() {
        let source = format!("return 1{};", "0".repeat(400));
        assert!(matches!(parse(&source), Err(SandboxError::Syntax { .. })));
    }

    #[test]
    fn test_integral_numbers_normalize() {
        assert_eq!(number(42.0), serde_json::json!(42));
        assert_eq!(number(2.5), serde_json::json!(2.5));
    }
}
