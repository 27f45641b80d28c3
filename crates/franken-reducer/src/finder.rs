//! Opportunity finder.
//!
//! Walks the live tree in pre-order and emits every applicable opportunity,
//! then orders them shallow-first. The output depends only on the tree, so
//! re-running the finder on an unchanged tree yields the same sequence.

use serde::{Deserialize, Serialize};

use crate::opportunity::{ExprCandidate, LiteralValue, ReductionOpportunity};
use crate::program_tree::{NodeCategory, NodeData, NodeId, ProgramTree, SlotKind, UnaryOp};

pub const DEFAULT_ENTRY_POINT: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinderConfig {
    pub simplify_expressions: bool,
    pub remove_statements: bool,
    pub remove_declarations: bool,
    pub collapse_statements: bool,
    /// Function that is never removed.
    pub entry_point: String,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            simplify_expressions: true,
            remove_statements: true,
            remove_declarations: true,
            collapse_statements: true,
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpportunityFinder {
    config: FinderConfig,
}

impl OpportunityFinder {
    pub fn new(config: FinderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    pub fn find(&self, tree: &ProgramTree) -> Vec<ReductionOpportunity> {
        let mut found = Vec::new();
        for id in tree.preorder() {
            let Ok(node) = tree.node(id) else {
                continue;
            };
            let Some(parent) = node.parent() else {
                continue;
            };
            let depth = tree.depth(id);
            match node.data().category() {
                NodeCategory::Expression if self.config.simplify_expressions => {
                    self.expression_opportunities(tree, parent, id, depth, &mut found);
                }
                NodeCategory::Statement => {
                    self.statement_opportunities(tree, parent, id, depth, &mut found);
                }
                NodeCategory::Declaration if self.config.remove_declarations => {
                    let is_entry = matches!(
                        node.data(),
                        NodeData::Function { name, .. } if *name == self.config.entry_point
                    );
                    if !is_entry {
                        found.push(ReductionOpportunity::RemoveDeclaration {
                            unit: parent,
                            declaration: id,
                            depth,
                        });
                    }
                }
                _ => {}
            }
        }
        found.sort_by_key(ReductionOpportunity::depth);
        found
    }

    fn expression_opportunities(
        &self,
        tree: &ProgramTree,
        parent: NodeId,
        id: NodeId,
        depth: u32,
        found: &mut Vec<ReductionOpportunity>,
    ) {
        let Ok(data) = tree.data(id) else {
            return;
        };
        let Ok(children) = tree.children(id) else {
            return;
        };
        let operands: &[NodeId] = match data {
            NodeData::Unary(_) | NodeData::Paren | NodeData::Binary(_) | NodeData::Call(_) => {
                children
            }
            NodeData::Ternary => children.get(1..).unwrap_or_default(),
            _ => &[],
        };
        for operand in operands {
            found.push(ReductionOpportunity::SimplifyExpr {
                parent,
                original: id,
                candidate: ExprCandidate::Operand(*operand),
                depth,
            });
        }
        if !data.is_literal() && tree.subtree_size(id) > 1 {
            found.push(ReductionOpportunity::SimplifyExpr {
                parent,
                original: id,
                candidate: ExprCandidate::Literal(literal_for(tree, id)),
                depth,
            });
        }
    }

    fn statement_opportunities(
        &self,
        tree: &ProgramTree,
        parent: NodeId,
        id: NodeId,
        depth: u32,
        found: &mut Vec<ReductionOpportunity>,
    ) {
        let Ok(parent_data) = tree.data(parent) else {
            return;
        };
        if self.config.remove_statements && matches!(parent_data, NodeData::Block) {
            found.push(ReductionOpportunity::RemoveStatement {
                block: parent,
                statement: id,
                depth,
            });
        }
        if !self.config.collapse_statements || !in_statement_slot(tree, parent, id) {
            return;
        }
        let (Ok(data), Ok(children)) = (tree.data(id), tree.children(id)) else {
            return;
        };
        let inner: &[NodeId] = match data {
            NodeData::If | NodeData::While => children.get(1..).unwrap_or_default(),
            NodeData::Block if children.len() == 1 => children,
            _ => &[],
        };
        for inner in inner {
            found.push(ReductionOpportunity::CollapseStatement {
                parent,
                original: id,
                inner: *inner,
                depth,
            });
        }
    }
}

/// Function bodies sit in a body slot and must stay blocks.
fn in_statement_slot(tree: &ProgramTree, parent: NodeId, id: NodeId) -> bool {
    let (Ok(parent_data), Ok(siblings)) = (tree.data(parent), tree.children(parent)) else {
        return false;
    };
    siblings
        .iter()
        .position(|sibling| *sibling == id)
        .and_then(|index| parent_data.slot_kind(index))
        == Some(SlotKind::Statement)
}

/// Picks a literal of a plausible type for the expression at `id`.
fn literal_for(tree: &ProgramTree, id: NodeId) -> LiteralValue {
    match tree.data(id) {
        Ok(NodeData::Binary(op)) if op.yields_bool() => return LiteralValue::Bool(true),
        Ok(NodeData::Unary(UnaryOp::Not)) => return LiteralValue::Bool(true),
        _ => {}
    }
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
        let Ok(node) = tree.node(current) else {
            continue;
        };
        if matches!(node.data(), NodeData::Float(_)) {
            return LiteralValue::Float("1.0".to_string());
        }
        stack.extend(node.children().iter().copied());
    }
    LiteralValue::Int(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opportunity::OpportunityKind;
    use crate::program_tree::{AstDecl, AstExpr, AstStmt, BinaryOp, ProgramAst};

    fn program() -> ProgramAst {
        ProgramAst::new(vec![
            AstDecl::global("float", "unused", None),
            AstDecl::function(
                "void",
                "main",
                Vec::new(),
                vec![
                    AstStmt::var(
                        "float",
                        "x",
                        Some(AstExpr::binary(
                            BinaryOp::Add,
                            AstExpr::float("1.0"),
                            AstExpr::ident("unused"),
                        )),
                    ),
                    AstStmt::if_else(
                        AstExpr::binary(BinaryOp::Lt, AstExpr::ident("x"), AstExpr::float("2.0")),
                        AstStmt::block(vec![AstStmt::Discard]),
                        Some(AstStmt::Empty),
                    ),
                ],
            ),
        ])
    }

    #[test]
    fn finder_is_deterministic() {
        let tree = ProgramTree::from_ast(&program());
        let finder = OpportunityFinder::default();
        assert_eq!(finder.find(&tree), finder.find(&tree));
    }

    #[test]
    fn opportunities_are_ordered_shallow_first() {
        let tree = ProgramTree::from_ast(&program());
        let found = OpportunityFinder::default().find(&tree);
        assert!(!found.is_empty());
        assert!(found.windows(2).all(|pair| pair[0].depth() <= pair[1].depth()));
        assert_eq!(found[0].kind(), OpportunityKind::RemoveDeclaration);
    }

    #[test]
    fn entry_point_is_never_removed() {
        let tree = ProgramTree::from_ast(&program());
        let removals = OpportunityFinder::default()
            .find(&tree)
            .into_iter()
            .filter(|op| op.kind() == OpportunityKind::RemoveDeclaration)
            .collect::<Vec<_>>();
        assert_eq!(removals.len(), 1);
        assert!(removals[0].describe(&tree).contains("unused"));
    }

    #[test]
    fn every_opportunity_strictly_shrinks_the_tree() {
        let tree = ProgramTree::from_ast(&program());
        let before = tree.node_count();
        for opportunity in OpportunityFinder::default().find(&tree) {
            let mut scratch = tree.clone();
            opportunity.apply(&mut scratch).expect("fresh opportunity applies");
            assert!(
                scratch.node_count() < before,
                "{} did not shrink the tree",
                opportunity.describe(&tree)
            );
        }
    }

    #[test]
    fn literal_candidates_follow_expression_type() {
        let tree = ProgramTree::from_ast(&program());
        let literals = OpportunityFinder::default()
            .find(&tree)
            .into_iter()
            .filter_map(|op| match op {
                ReductionOpportunity::SimplifyExpr {
                    candidate: ExprCandidate::Literal(literal),
                    ..
                } => Some(literal),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(literals.contains(&LiteralValue::Float("1.0".to_string())));
        assert!(literals.contains(&LiteralValue::Bool(true)));
    }

    #[test]
    fn function_body_block_is_not_collapsed() {
        let ast = ProgramAst::new(vec![AstDecl::function(
            "void",
            "main",
            Vec::new(),
            vec![AstStmt::Discard],
        )]);
        let tree = ProgramTree::from_ast(&ast);
        let found = OpportunityFinder::default().find(&tree);
        assert!(
            found
                .iter()
                .all(|op| op.kind() != OpportunityKind::CollapseStatement)
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind(), OpportunityKind::RemoveStatement);
    }

    #[test]
    fn disabled_kinds_are_skipped() {
        let tree = ProgramTree::from_ast(&program());
        let finder = OpportunityFinder::new(FinderConfig {
            simplify_expressions: false,
            remove_statements: false,
            remove_declarations: false,
            collapse_statements: true,
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
        });
        let found = finder.find(&tree);
        assert!(!found.is_empty());
        assert!(
            found
                .iter()
                .all(|op| op.kind() == OpportunityKind::CollapseStatement)
        );
    }

    #[test]
    fn minimal_program_has_no_opportunities() {
        let ast = ProgramAst::new(vec![AstDecl::function("void", "main", Vec::new(), Vec::new())]);
        let tree = ProgramTree::from_ast(&ast);
        assert!(OpportunityFinder::default().find(&tree).is_empty());
    }
}
