//! Syntax tree for the function language.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    /// `len(x)`
    Call {
        name: String,
        args: Vec<Expr>,
        line: usize,
    },
    /// `math.floor(x)`
    ModuleCall {
        module: String,
        function: String,
        args: Vec<Expr>,
        line: usize,
    },
}

/// Assignment destination: a variable followed by zero or more member/index steps.
#[derive(Debug, Clone, PartialEq)]
pub enum PathStep {
    Member(String),
    Index(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Import {
        module: String,
        line: usize,
    },
    Let {
        name: String,
        value: Expr,
        line: usize,
    },
    Assign {
        name: String,
        path: Vec<PathStep>,
        value: Expr,
        line: usize,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
        line: usize,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    Return {
        value: Option<Expr>,
        line: usize,
    },
    Break {
        line: usize,
    },
    Continue {
        line: usize,
    },
    Expr {
        expr: Expr,
        line: usize,
    },
}

impl Stmt {
    pub fn line(&self) -> usize {
        match self {
            Stmt::Import { line, .. }
            | Stmt::Let { line, .. }
            | Stmt::Assign { line, .. }
            | Stmt::If { line, .. }
            | Stmt::While { line, .. }
            | Stmt::For { line, .. }
            | Stmt::Return { line, .. }
            | Stmt::Break { line }
            | Stmt::Continue { line }
            | Stmt::Expr { line, .. } => *line,
        }
    }
}

/// A parsed function body.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}
