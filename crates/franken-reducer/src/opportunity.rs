//! Reduction opportunities: atomic, revertible shrinking edits over a
//! [`ProgramTree`].
//!
//! Opportunities found in one scan can be invalidated by an edit committed
//! earlier in the same scan, so every kind carries an explicit precondition
//! that is re-checked against the current tree before applying.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::program_tree::{NodeData, NodeId, ProgramTree, StructuralError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    SimplifyExpr,
    RemoveStatement,
    RemoveDeclaration,
    CollapseStatement,
}

impl OpportunityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SimplifyExpr => "simplify_expr",
            Self::RemoveStatement => "remove_statement",
            Self::RemoveDeclaration => "remove_declaration",
            Self::CollapseStatement => "collapse_statement",
        }
    }
}

impl fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Literal used to stand in for a larger expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LiteralValue {
    Int(i64),
    Float(String),
    Bool(bool),
}

impl LiteralValue {
    fn into_node(self) -> NodeData {
        match self {
            Self::Int(value) => NodeData::Int(value),
            Self::Float(text) => NodeData::Float(text),
            Self::Bool(value) => NodeData::Bool(value),
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(text) => f.write_str(text),
            Self::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// What a simplified expression becomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprCandidate {
    /// A direct child of the original expression.
    Operand(NodeId),
    /// A fresh literal, materialized when the opportunity is applied.
    Literal(LiteralValue),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReductionOpportunity {
    SimplifyExpr {
        parent: NodeId,
        original: NodeId,
        candidate: ExprCandidate,
        depth: u32,
    },
    RemoveStatement {
        block: NodeId,
        statement: NodeId,
        depth: u32,
    },
    RemoveDeclaration {
        unit: NodeId,
        declaration: NodeId,
        depth: u32,
    },
    /// Replaces a compound statement with one of its inner statements.
    CollapseStatement {
        parent: NodeId,
        original: NodeId,
        inner: NodeId,
        depth: u32,
    },
}

/// Record of an applied edit, sufficient to reverse it exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedEdit {
    Replaced {
        parent: NodeId,
        original: NodeId,
        replacement: NodeId,
    },
    Removed {
        parent: NodeId,
        child: NodeId,
        index: usize,
    },
}

impl AppliedEdit {
    pub fn revert(&self, tree: &mut ProgramTree) -> Result<(), StructuralError> {
        match self {
            Self::Replaced {
                parent,
                original,
                replacement,
            } => tree.replace_child(*parent, *replacement, *original),
            Self::Removed {
                parent,
                child,
                index,
            } => tree.insert_child(*parent, *index, *child),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReductionError {
    #[error("precondition of `{description}` does not hold in the current tree")]
    PreconditionViolated { description: String },
    #[error(transparent)]
    Structural(#[from] StructuralError),
}

impl ReductionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PreconditionViolated { .. } => "precondition_violated",
            Self::Structural(_) => "structural_error",
        }
    }
}

impl ReductionOpportunity {
    pub fn kind(&self) -> OpportunityKind {
        match self {
            Self::SimplifyExpr { .. } => OpportunityKind::SimplifyExpr,
            Self::RemoveStatement { .. } => OpportunityKind::RemoveStatement,
            Self::RemoveDeclaration { .. } => OpportunityKind::RemoveDeclaration,
            Self::CollapseStatement { .. } => OpportunityKind::CollapseStatement,
        }
    }

    pub fn depth(&self) -> u32 {
        match self {
            Self::SimplifyExpr { depth, .. }
            | Self::RemoveStatement { depth, .. }
            | Self::RemoveDeclaration { depth, .. }
            | Self::CollapseStatement { depth, .. } => *depth,
        }
    }

    /// Whether the nodes this opportunity refers to are still where the
    /// finder saw them.
    pub fn precondition_holds(&self, tree: &ProgramTree) -> bool {
        match self {
            Self::SimplifyExpr {
                parent,
                original,
                candidate,
                ..
            } => {
                tree.has_child(*parent, *original)
                    && match candidate {
                        ExprCandidate::Operand(operand) => tree.has_child(*original, *operand),
                        ExprCandidate::Literal(_) => true,
                    }
            }
            Self::RemoveStatement {
                block, statement, ..
            } => tree.has_child(*block, *statement),
            Self::RemoveDeclaration {
                unit, declaration, ..
            } => tree.has_child(*unit, *declaration),
            Self::CollapseStatement {
                parent,
                original,
                inner,
                ..
            } => tree.has_child(*parent, *original) && tree.has_child(*original, *inner),
        }
    }

    /// Applies the edit. Calling this when the precondition fails is a
    /// programming error; the tree is left untouched and an error returned.
    pub fn apply(&self, tree: &mut ProgramTree) -> Result<AppliedEdit, ReductionError> {
        if !self.precondition_holds(tree) {
            return Err(ReductionError::PreconditionViolated {
                description: self.describe(tree),
            });
        }
        let edit = match self {
            Self::SimplifyExpr {
                parent,
                original,
                candidate,
                ..
            } => {
                let replacement = match candidate {
                    ExprCandidate::Operand(operand) => *operand,
                    ExprCandidate::Literal(literal) => {
                        tree.alloc_detached(literal.clone().into_node())
                    }
                };
                tree.replace_child(*parent, *original, replacement)?;
                AppliedEdit::Replaced {
                    parent: *parent,
                    original: *original,
                    replacement,
                }
            }
            Self::RemoveStatement {
                block, statement, ..
            } => {
                let index = tree.remove_child(*block, *statement)?;
                AppliedEdit::Removed {
                    parent: *block,
                    child: *statement,
                    index,
                }
            }
            Self::RemoveDeclaration {
                unit, declaration, ..
            } => {
                let index = tree.remove_child(*unit, *declaration)?;
                AppliedEdit::Removed {
                    parent: *unit,
                    child: *declaration,
                    index,
                }
            }
            Self::CollapseStatement {
                parent,
                original,
                inner,
                ..
            } => {
                tree.replace_child(*parent, *original, *inner)?;
                AppliedEdit::Replaced {
                    parent: *parent,
                    original: *original,
                    replacement: *inner,
                }
            }
        };
        Ok(edit)
    }

    pub fn describe(&self, tree: &ProgramTree) -> String {
        match self {
            Self::SimplifyExpr {
                original,
                candidate,
                ..
            } => {
                let target = match candidate {
                    ExprCandidate::Operand(operand) => tree.snippet(*operand),
                    ExprCandidate::Literal(literal) => literal.to_string(),
                };
                format!(
                    "{}: `{}` -> `{target}`",
                    self.kind(),
                    tree.snippet(*original)
                )
            }
            Self::RemoveStatement { statement, .. } => {
                format!("{}: `{}`", self.kind(), tree.snippet(*statement))
            }
            Self::RemoveDeclaration { declaration, .. } => {
                format!("{}: `{}`", self.kind(), tree.snippet(*declaration))
            }
            Self::CollapseStatement {
                original, inner, ..
            } => format!(
                "{}: `{}` -> `{}`",
                self.kind(),
                tree.snippet(*original),
                tree.snippet(*inner)
            ),
        }
    }
}
