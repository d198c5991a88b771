//! Static capability analysis, run on every store before code is accepted.
//!
//! Default-deny: a module is usable only if it is known, granted in the
//! allow-list, and imported. Anything else is rejected before the code is
//! ever run.

use std::collections::BTreeSet;

use super::ast::{Expr, PathStep, Program, Stmt};
use super::builtins::{is_core_builtin, module_functions};
use super::capability::Capability;
use super::error::{SandboxError, SandboxResult};

/// What the analyzer learned about a program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    /// Capabilities the program imports.
    pub imports: BTreeSet<Capability>,
}

pub fn analyze(program: &Program, allowed: &BTreeSet<Capability>) -> SandboxResult<Analysis> {
    let mut analyzer = Analyzer {
        allowed,
        imports: BTreeSet::new(),
        loop_depth: 0,
    };
    // imports are hoisted: a call may precede its import statement
    for stmt in &program.body {
        if let Stmt::Import { module, line } = stmt {
            let cap = analyzer.permit(module, *line)?;
            analyzer.imports.insert(cap);
        }
    }
    analyzer.block(&program.body)?;
    Ok(Analysis {
        imports: analyzer.imports,
    })
}

struct Analyzer<'a> {
    allowed: &'a BTreeSet<Capability>,
    imports: BTreeSet<Capability>,
    loop_depth: usize,
}

impl Analyzer<'_> {
    fn permit(&self, module: &str, line: usize) -> SandboxResult<Capability> {
        let cap: Capability = module
            .parse()
            .map_err(|reason| SandboxError::Violation { line, reason })?;
        if !self.allowed.contains(&cap) {
            return Err(SandboxError::Violation {
                line,
                reason: format!("module '{module}' is not in the allowed capabilities"),
            });
        }
        Ok(cap)
    }

    fn block(&mut self, body: &[Stmt]) -> SandboxResult<()> {
        body.iter().try_for_each(|stmt| self.stmt(stmt))
    }

    fn stmt(&mut self, stmt: &Stmt) -> SandboxResult<()> {
        match stmt {
            Stmt::Import { module, line } => {
                let cap = self.permit(module, *line)?;
                if !self.imports.contains(&cap) {
                    return Err(SandboxError::Syntax {
                        line: *line,
                        message: "import must appear at the top level".into(),
                    });
                }
                Ok(())
            }
            Stmt::Let { value, .. } => self.expr(value),
            Stmt::Assign { path, value, .. } => {
                for step in path {
                    if let PathStep::Index(index) = step {
                        self.expr(index)?;
                    }
                }
                self.expr(value)
            }
            Stmt::If {
                branches,
                otherwise,
                ..
            } => {
                for (cond, body) in branches {
                    self.expr(cond)?;
                    self.block(body)?;
                }
                match otherwise {
                    Some(body) => self.block(body),
                    None => Ok(()),
                }
            }
            Stmt::While { cond, body, .. } => {
                self.expr(cond)?;
                self.loop_body(body)
            }
            Stmt::For { iter, body, .. } => {
                self.expr(iter)?;
                self.loop_body(body)
            }
            Stmt::Return { value, .. } => match value {
                Some(expr) => self.expr(expr),
                None => Ok(()),
            },
            Stmt::Break { line } | Stmt::Continue { line } => {
                if self.loop_depth == 0 {
                    return Err(SandboxError::Syntax {
                        line: *line,
                        message: "break/continue outside of a loop".into(),
                    });
                }
                Ok(())
            }
            Stmt::Expr { expr, .. } => self.expr(expr),
        }
    }

    fn loop_body(&mut self, body: &[Stmt]) -> SandboxResult<()> {
        self.loop_depth += 1;
        let result = self.block(body);
        self.loop_depth -= 1;
        result
    }

    fn expr(&mut self, expr: &Expr) -> SandboxResult<()> {
        match expr {
            Expr::Literal(_) | Expr::Var(_) => Ok(()),
            Expr::Array(items) => items.iter().try_for_each(|e| self.expr(e)),
            Expr::Object(fields) => fields.iter().try_for_each(|(_, e)| self.expr(e)),
            Expr::Unary(_, operand) => self.expr(operand),
            Expr::Binary(_, left, right) => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::Member(base, _) => self.expr(base),
            Expr::Index(base, index) => {
                self.expr(base)?;
                self.expr(index)
            }
            Expr::Call { name, args, line } => {
                if !is_core_builtin(name) {
                    return Err(SandboxError::Syntax {
                        line: *line,
                        message: format!("unknown function '{name}'"),
                    });
                }
                args.iter().try_for_each(|e| self.expr(e))
            }
            Expr::ModuleCall {
                module,
                function,
                args,
                line,
            } => {
                let cap = self.permit(module, *line)?;
                if !self.imports.contains(&cap) {
                    return Err(SandboxError::Syntax {
                        line: *line,
                        message: format!("module '{module}' used without 'import {module};'"),
                    });
                }
                if let Some(known) = module_functions(cap) {
                    if !known.contains(&function.as_str()) {
                        return Err(SandboxError::Syntax {
                            line: *line,
                            message: format!("unknown function '{module}.{function}'"),
                        });
                    }
                }
                args.iter().try_for_each(|e| self.expr(e))
            }
        }
    }
}
