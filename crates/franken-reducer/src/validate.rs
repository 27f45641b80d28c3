//! Static validation of shader jobs.
//!
//! Catches candidates that cannot possibly compile before they cost an
//! oracle round trip: undecodable job files, a missing entry point, and
//! identifiers used outside the scope of any declaration. Identifiers with
//! the `gl_` prefix are built-ins. Call targets are not checked since most
//! of them are built-in functions and constructors.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::finder::DEFAULT_ENTRY_POINT;
use crate::job::ShaderJob;
use crate::program_tree::{AstDecl, AstExpr, AstStmt, ProgramAst};

const BUILTIN_PREFIX: &str = "gl_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("job file could not be decoded: {0}")]
    Decode(String),
    #[error("program has no `{entry_point}` function")]
    MissingEntryPoint { entry_point: String },
    #[error("identifier `{name}` is used outside the scope of any declaration")]
    UndeclaredIdentifier { name: String },
    #[error("`{name}` is declared twice in the same scope")]
    DuplicateDeclaration { name: String },
}

/// Decodes a serialized job and validates its program.
pub fn validate_job_json(serialized: &str) -> Result<ShaderJob, ValidationError> {
    let job = ShaderJob::from_json(serialized)
        .map_err(|error| ValidationError::Decode(error.to_string()))?;
    validate_program(&job.program)?;
    Ok(job)
}

pub fn validate_program(program: &ProgramAst) -> Result<(), ValidationError> {
    let has_entry = program.declarations.iter().any(|decl| {
        matches!(decl, AstDecl::Function { name, .. } if name == DEFAULT_ENTRY_POINT)
    });
    if !has_entry {
        return Err(ValidationError::MissingEntryPoint {
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
        });
    }

    let mut scopes = Scopes::default();
    for decl in &program.declarations {
        match decl {
            AstDecl::Global { name, init, .. } => {
                if let Some(init) = init {
                    scopes.check_expr(init)?;
                }
                scopes.declare(name)?;
            }
            AstDecl::Function { params, body, .. } => {
                scopes.push();
                for param in params {
                    scopes.declare(&param.name)?;
                }
                for stmt in body {
                    scopes.check_stmt(stmt)?;
                }
                scopes.pop();
            }
        }
    }
    Ok(())
}

struct Scopes {
    frames: Vec<BTreeSet<String>>,
}

impl Default for Scopes {
    fn default() -> Self {
        Self {
            frames: vec![BTreeSet::new()],
        }
    }
}

impl Scopes {
    fn push(&mut self) {
        self.frames.push(BTreeSet::new());
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn declare(&mut self, name: &str) -> Result<(), ValidationError> {
        let Some(frame) = self.frames.last_mut() else {
            return Ok(());
        };
        if !frame.insert(name.to_string()) {
            return Err(ValidationError::DuplicateDeclaration {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn is_visible(&self, name: &str) -> bool {
        name.starts_with(BUILTIN_PREFIX) || self.frames.iter().any(|frame| frame.contains(name))
    }

    fn check_stmt(&mut self, stmt: &AstStmt) -> Result<(), ValidationError> {
        match stmt {
            AstStmt::Block { body } => {
                self.push();
                let outcome = body.iter().try_for_each(|inner| self.check_stmt(inner));
                self.pop();
                outcome
            }
            AstStmt::Expr { expr } => self.check_expr(expr),
            AstStmt::Var { name, init, .. } => {
                if let Some(init) = init {
                    self.check_expr(init)?;
                }
                self.declare(name)
            }
            AstStmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.check_expr(cond)?;
                self.check_nested(then)?;
                match otherwise {
                    Some(otherwise) => self.check_nested(otherwise),
                    None => Ok(()),
                }
            }
            AstStmt::While { cond, body } => {
                self.check_expr(cond)?;
                self.check_nested(body)
            }
            AstStmt::Return { value } => match value {
                Some(value) => self.check_expr(value),
                None => Ok(()),
            },
            AstStmt::Discard | AstStmt::Empty => Ok(()),
        }
    }

    /// Branch and loop bodies get their own scope even without braces.
    fn check_nested(&mut self, stmt: &AstStmt) -> Result<(), ValidationError> {
        self.push();
        let outcome = self.check_stmt(stmt);
        self.pop();
        outcome
    }

    fn check_expr(&self, expr: &AstExpr) -> Result<(), ValidationError> {
        match expr {
            AstExpr::Int { .. } | AstExpr::Float { .. } | AstExpr::Bool { .. } => Ok(()),
            AstExpr::Ident { name } => {
                if self.is_visible(name) {
                    Ok(())
                } else {
                    Err(ValidationError::UndeclaredIdentifier { name: name.clone() })
                }
            }
            AstExpr::Unary { operand, .. } => self.check_expr(operand),
            AstExpr::Binary { lhs, rhs, .. } => {
                self.check_expr(lhs)?;
                self.check_expr(rhs)
            }
            AstExpr::Call { args, .. } => args.iter().try_for_each(|arg| self.check_expr(arg)),
            AstExpr::Paren { inner } => self.check_expr(inner),
            AstExpr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                self.check_expr(cond)?;
                self.check_expr(then)?;
                self.check_expr(otherwise)
            }
        }
    }
}
