//! Program representation for the reducer.
//!
//! Two forms exist side by side:
//!
//! - [`ProgramAst`]: an owned, serde-serializable nested AST. This is what a
//!   job file carries and what the oracle receives.
//! - [`ProgramTree`]: an arena of nodes addressed by [`NodeId`] indices, built
//!   once per job from a `ProgramAst` and mutated in place by reduction
//!   opportunities.
//!
//! Parent links in the arena are plain indices. They are never used for
//! ownership or traversal, only to answer "is this node still attached where
//! I found it". Detached nodes stay in the arena until the tree is compacted
//! through [`ProgramTree::compact`].

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Serialized AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Not => "!",
            Self::BitNot => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Assign,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
            Self::Assign => "=",
        }
    }

    /// Comparison and logical operators produce a boolean.
    pub fn yields_bool(self) -> bool {
        matches!(
            self,
            Self::Lt
                | Self::Le
                | Self::Gt
                | Self::Ge
                | Self::Eq
                | Self::Ne
                | Self::And
                | Self::Or
        )
    }

    /// Binding strength when rendered; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Assign => PREC_ASSIGN,
            Self::Or => 3,
            Self::And => 4,
            Self::Eq | Self::Ne => 5,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 6,
            Self::Add | Self::Sub => 7,
            Self::Mul | Self::Div | Self::Mod => 8,
        }
    }
}

const PREC_ASSIGN: u8 = 1;
const PREC_TERNARY: u8 = 2;
const PREC_UNARY: u8 = 9;
const PREC_PRIMARY: u8 = 10;

/// Expression forms of the shader subset understood by the reducer.
///
/// Float literals keep their source text so that every AST type stays `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AstExpr {
    Int {
        value: i64,
    },
    Float {
        text: String,
    },
    Bool {
        value: bool,
    },
    Ident {
        name: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<AstExpr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<AstExpr>,
        rhs: Box<AstExpr>,
    },
    Call {
        callee: String,
        #[serde(default)]
        args: Vec<AstExpr>,
    },
    Paren {
        inner: Box<AstExpr>,
    },
    Ternary {
        cond: Box<AstExpr>,
        then: Box<AstExpr>,
        otherwise: Box<AstExpr>,
    },
}

impl AstExpr {
    pub fn int(value: i64) -> Self {
        Self::Int { value }
    }

    pub fn float(text: impl Into<String>) -> Self {
        Self::Float { text: text.into() }
    }

    pub fn boolean(value: bool) -> Self {
        Self::Bool { value }
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Self::Ident { name: name.into() }
    }

    pub fn unary(op: UnaryOp, operand: AstExpr) -> Self {
        Self::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOp, lhs: AstExpr, rhs: AstExpr) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(callee: impl Into<String>, args: Vec<AstExpr>) -> Self {
        Self::Call {
            callee: callee.into(),
            args,
        }
    }

    pub fn paren(inner: AstExpr) -> Self {
        Self::Paren {
            inner: Box::new(inner),
        }
    }

    pub fn ternary(cond: AstExpr, then: AstExpr, otherwise: AstExpr) -> Self {
        Self::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }
}

impl AstExpr {
    fn precedence(&self) -> u8 {
        match self {
            Self::Binary { op, .. } => op.precedence(),
            Self::Ternary { .. } => PREC_TERNARY,
            Self::Unary { .. } => PREC_UNARY,
            Self::Int { value } if *value < 0 => PREC_UNARY,
            Self::Float { text } if text.starts_with('-') => PREC_UNARY,
            _ => PREC_PRIMARY,
        }
    }

    /// Whether the rendered text begins with a minus sign.
    fn leads_with_minus(&self) -> bool {
        match self {
            Self::Int { value } => *value < 0,
            Self::Float { text } => text.starts_with('-'),
            Self::Unary { op, .. } => *op == UnaryOp::Neg,
            _ => false,
        }
    }

    /// Writes the expression, parenthesized when it binds looser than `min`.
    fn write_with(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        let wrap = self.precedence() < min;
        if wrap {
            f.write_str("(")?;
        }
        match self {
            Self::Int { value } => write!(f, "{value}")?,
            Self::Float { text } => f.write_str(text)?,
            Self::Bool { value } => write!(f, "{value}")?,
            Self::Ident { name } => f.write_str(name)?,
            Self::Unary { op, operand } => {
                f.write_str(op.as_str())?;
                if *op == UnaryOp::Neg && operand.leads_with_minus() {
                    // `--x` would lex as a decrement.
                    f.write_str("(")?;
                    operand.write_with(f, 0)?;
                    f.write_str(")")?;
                } else {
                    operand.write_with(f, PREC_UNARY)?;
                }
            }
            Self::Binary { op, lhs, rhs } => {
                let prec = op.precedence();
                // Assignment groups to the right, everything else to the left.
                let (lhs_min, rhs_min) = if *op == BinaryOp::Assign {
                    (prec + 1, prec)
                } else {
                    (prec, prec + 1)
                };
                lhs.write_with(f, lhs_min)?;
                write!(f, " {} ", op.as_str())?;
                rhs.write_with(f, rhs_min)?;
            }
            Self::Call { callee, args } => {
                write!(f, "{callee}(")?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    arg.write_with(f, PREC_ASSIGN)?;
                }
                f.write_str(")")?;
            }
            Self::Paren { inner } => {
                f.write_str("(")?;
                inner.write_with(f, 0)?;
                f.write_str(")")?;
            }
            Self::Ternary {
                cond,
                then,
                otherwise,
            } => {
                cond.write_with(f, PREC_TERNARY + 1)?;
                f.write_str(" ? ")?;
                then.write_with(f, PREC_ASSIGN)?;
                f.write_str(" : ")?;
                otherwise.write_with(f, PREC_TERNARY)?;
            }
        }
        if wrap {
            f.write_str(")")?;
        }
        Ok(())
    }
}

impl fmt::Display for AstExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_with(f, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AstStmt {
    Block {
        #[serde(default)]
        body: Vec<AstStmt>,
    },
    Expr {
        expr: AstExpr,
    },
    Var {
        ty: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        init: Option<AstExpr>,
    },
    If {
        cond: AstExpr,
        then: Box<AstStmt>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Box<AstStmt>>,
    },
    While {
        cond: AstExpr,
        body: Box<AstStmt>,
    },
    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<AstExpr>,
    },
    Discard,
    Empty,
}

impl AstStmt {
    pub fn block(body: Vec<AstStmt>) -> Self {
        Self::Block { body }
    }

    pub fn expr(expr: AstExpr) -> Self {
        Self::Expr { expr }
    }

    pub fn var(ty: impl Into<String>, name: impl Into<String>, init: Option<AstExpr>) -> Self {
        Self::Var {
            ty: ty.into(),
            name: name.into(),
            init,
        }
    }

    pub fn if_else(cond: AstExpr, then: AstStmt, otherwise: Option<AstStmt>) -> Self {
        Self::If {
            cond,
            then: Box::new(then),
            otherwise: otherwise.map(Box::new),
        }
    }

    pub fn while_loop(cond: AstExpr, body: AstStmt) -> Self {
        Self::While {
            cond,
            body: Box::new(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub ty: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AstDecl {
    Global {
        ty: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        init: Option<AstExpr>,
    },
    Function {
        return_type: String,
        name: String,
        #[serde(default)]
        params: Vec<Param>,
        #[serde(default)]
        body: Vec<AstStmt>,
    },
}

impl AstDecl {
    pub fn global(ty: impl Into<String>, name: impl Into<String>, init: Option<AstExpr>) -> Self {
        Self::Global {
            ty: ty.into(),
            name: name.into(),
            init,
        }
    }

    pub fn function(
        return_type: impl Into<String>,
        name: impl Into<String>,
        params: Vec<Param>,
        body: Vec<AstStmt>,
    ) -> Self {
        Self::Function {
            return_type: return_type.into(),
            name: name.into(),
            params,
            body,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Global { name, .. } | Self::Function { name, .. } => name,
        }
    }
}

/// A whole translation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramAst {
    #[serde(default)]
    pub declarations: Vec<AstDecl>,
}

impl ProgramAst {
    pub fn new(declarations: Vec<AstDecl>) -> Self {
        Self { declarations }
    }

    /// Human-readable shader text. Not the wire format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for decl in &self.declarations {
            render_decl(&mut out, decl);
        }
        out
    }
}

fn render_decl(out: &mut String, decl: &AstDecl) {
    match decl {
        AstDecl::Global { ty, name, init } => {
            out.push_str(&format_var(ty, name, init.as_ref()));
            out.push('\n');
        }
        AstDecl::Function {
            return_type,
            name,
            params,
            body,
        } => {
            let params = params
                .iter()
                .map(|param| format!("{} {}", param.ty, param.name))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("{return_type} {name}({params})\n{{\n"));
            for stmt in body {
                render_stmt(out, stmt, 1);
            }
            out.push_str("}\n");
        }
    }
}

fn format_var(ty: &str, name: &str, init: Option<&AstExpr>) -> String {
    match init {
        Some(init) => format!("{ty} {name} = {init};"),
        None => format!("{ty} {name};"),
    }
}

fn render_stmt(out: &mut String, stmt: &AstStmt, indent: usize) {
    let pad = "    ".repeat(indent);
    match stmt {
        AstStmt::Block { body } => {
            out.push_str(&format!("{pad}{{\n"));
            for inner in body {
                render_stmt(out, inner, indent + 1);
            }
            out.push_str(&format!("{pad}}}\n"));
        }
        AstStmt::Expr { expr } => out.push_str(&format!("{pad}{expr};\n")),
        AstStmt::Var { ty, name, init } => {
            out.push_str(&format!("{pad}{}\n", format_var(ty, name, init.as_ref())));
        }
        AstStmt::If {
            cond,
            then,
            otherwise,
        } => {
            out.push_str(&format!("{pad}if ({cond})\n"));
            if otherwise.is_some() && ends_in_open_if(then) {
                // Braces keep the `else` from binding to the inner `if`.
                out.push_str(&format!("{pad}{{\n"));
                render_stmt(out, then, indent + 1);
                out.push_str(&format!("{pad}}}\n"));
            } else {
                render_stmt(out, then, indent + 1);
            }
            if let Some(otherwise) = otherwise {
                out.push_str(&format!("{pad}else\n"));
                render_stmt(out, otherwise, indent + 1);
            }
        }
        AstStmt::While { cond, body } => {
            out.push_str(&format!("{pad}while ({cond})\n"));
            render_stmt(out, body, indent + 1);
        }
        AstStmt::Return { value } => match value {
            Some(value) => out.push_str(&format!("{pad}return {value};\n")),
            None => out.push_str(&format!("{pad}return;\n")),
        },
        AstStmt::Discard => out.push_str(&format!("{pad}discard;\n")),
        AstStmt::Empty => out.push_str(&format!("{pad};\n")),
    }
}

/// Whether `stmt` ends in an `if` without an `else` that a following `else`
/// would attach to.
fn ends_in_open_if(stmt: &AstStmt) -> bool {
    match stmt {
        AstStmt::If {
            otherwise: None, ..
        } => true,
        AstStmt::If {
            otherwise: Some(otherwise),
            ..
        } => ends_in_open_if(otherwise),
        AstStmt::While { body, .. } => ends_in_open_if(body),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Stable index of a node inside a [`ProgramTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// Id for arena slot `index`, if it fits in 32 bits.
    fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index).ok().map(Self)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Per-node payload. Children live in [`Node::children`], in slot order.
///
/// Slot shapes:
/// - `Unit`: declarations
/// - `Global`, `Var`, `Return`: optional expression
/// - `Function`: one body block
/// - `Block`: statements
/// - `If`: condition, then-branch, optional else-branch
/// - `While`: condition, body
/// - `ExprStmt`, `Unary`, `Paren`: one expression
/// - `Binary`: two expressions; `Ternary`: three; `Call`: arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    Unit,
    Global {
        ty: String,
        name: String,
    },
    Function {
        return_type: String,
        name: String,
        params: Vec<Param>,
    },
    Block,
    ExprStmt,
    Var {
        ty: String,
        name: String,
    },
    If,
    While,
    Return,
    Discard,
    Empty,
    Int(i64),
    Float(String),
    Bool(bool),
    Ident(String),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Call(String),
    Paren,
    Ternary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Unit,
    Declaration,
    Statement,
    Expression,
}

impl NodeData {
    pub fn category(&self) -> NodeCategory {
        match self {
            Self::Unit => NodeCategory::Unit,
            Self::Global { .. } | Self::Function { .. } => NodeCategory::Declaration,
            Self::Block
            | Self::ExprStmt
            | Self::Var { .. }
            | Self::If
            | Self::While
            | Self::Return
            | Self::Discard
            | Self::Empty => NodeCategory::Statement,
            Self::Int(_)
            | Self::Float(_)
            | Self::Bool(_)
            | Self::Ident(_)
            | Self::Unary(_)
            | Self::Binary(_)
            | Self::Call(_)
            | Self::Paren
            | Self::Ternary => NodeCategory::Expression,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_) | Self::Bool(_))
    }

    /// Nodes whose child list may grow or shrink.
    pub fn is_variadic(&self) -> bool {
        matches!(self, Self::Unit | Self::Block)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Global { .. } => "global",
            Self::Function { .. } => "function",
            Self::Block => "block",
            Self::ExprStmt => "expr_stmt",
            Self::Var { .. } => "var",
            Self::If => "if",
            Self::While => "while",
            Self::Return => "return",
            Self::Discard => "discard",
            Self::Empty => "empty",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Ident(_) => "ident",
            Self::Unary(_) => "unary",
            Self::Binary(_) => "binary",
            Self::Call(_) => "call",
            Self::Paren => "paren",
            Self::Ternary => "ternary",
        }
    }

    /// Kind of node a child slot of this node accepts, or `None` for leaves.
    pub fn slot_kind(&self, index: usize) -> Option<SlotKind> {
        match self {
            Self::Unit => Some(SlotKind::Declaration),
            Self::Function { .. } => Some(SlotKind::Body),
            Self::Block => Some(SlotKind::Statement),
            Self::If | Self::While if index == 0 => Some(SlotKind::Expression),
            Self::If | Self::While => Some(SlotKind::Statement),
            Self::Global { .. }
            | Self::Var { .. }
            | Self::Return
            | Self::ExprStmt
            | Self::Unary(_)
            | Self::Binary(_)
            | Self::Call(_)
            | Self::Paren
            | Self::Ternary => Some(SlotKind::Expression),
            Self::Discard
            | Self::Empty
            | Self::Int(_)
            | Self::Float(_)
            | Self::Bool(_)
            | Self::Ident(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Declaration,
    Statement,
    /// Function bodies only accept blocks.
    Body,
    Expression,
}

impl SlotKind {
    pub fn accepts(self, data: &NodeData) -> bool {
        match self {
            Self::Declaration => data.category() == NodeCategory::Declaration,
            Self::Statement => data.category() == NodeCategory::Statement,
            Self::Body => matches!(data, NodeData::Block),
            Self::Expression => data.category() == NodeCategory::Expression,
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declaration => f.write_str("declaration"),
            Self::Statement => f.write_str("statement"),
            Self::Body => f.write_str("body"),
            Self::Expression => f.write_str("expression"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    data: NodeData,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl Node {
    pub fn data(&self) -> &NodeData {
        &self.data
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
}

/// Fail-fast consistency errors raised by structural edits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("node {node} does not exist in this tree")]
    UnknownNode { node: NodeId },
    #[error("node {node} is not a live child of {parent}")]
    NotAChild { parent: NodeId, node: NodeId },
    #[error("{slot} slot of {parent} cannot hold a `{found}` node")]
    SlotMismatch {
        parent: NodeId,
        slot: SlotKind,
        found: &'static str,
    },
    #[error("node {node} is still attached elsewhere")]
    ReplacementAttached { node: NodeId },
    #[error("children of {parent} cannot be inserted or removed")]
    NotVariadic { parent: NodeId },
    #[error("index {index} is out of bounds for {parent} with {len} children")]
    IndexOutOfBounds {
        parent: NodeId,
        index: usize,
        len: usize,
    },
    #[error("node {node} has a malformed `{kind}` shape")]
    Malformed { node: NodeId, kind: &'static str },
}

/// Exclusively-owned mutable program tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl ProgramTree {
    pub fn from_ast(ast: &ProgramAst) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        let root = tree.push(NodeData::Unit, None);
        tree.root = root;
        for decl in &ast.declarations {
            tree.lower_decl(decl, root);
        }
        tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, StructuralError> {
        self.nodes
            .get(id.index())
            .ok_or(StructuralError::UnknownNode { node: id })
    }

    pub fn data(&self, id: NodeId) -> Result<&NodeData, StructuralError> {
        self.node(id).map(Node::data)
    }

    pub fn children(&self, id: NodeId) -> Result<&[NodeId], StructuralError> {
        self.node(id).map(Node::children)
    }

    /// Whether `id` is reachable from the root through consistent links.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        for _ in 0..=self.nodes.len() {
            if current == self.root {
                return true;
            }
            let Some(node) = self.nodes.get(current.index()) else {
                return false;
            };
            let Some(parent) = node.parent else {
                return false;
            };
            let Some(parent_node) = self.nodes.get(parent.index()) else {
                return false;
            };
            if !parent_node.children.contains(&current) {
                return false;
            }
            current = parent;
        }
        false
    }

    /// Membership test over live structure only.
    pub fn has_child(&self, parent: NodeId, node: NodeId) -> bool {
        let (Some(parent_node), Some(child_node)) =
            (self.nodes.get(parent.index()), self.nodes.get(node.index()))
        else {
            return false;
        };
        child_node.parent == Some(parent)
            && parent_node.children.contains(&node)
            && self.is_attached(parent)
    }

    /// Replaces `original` in its slot under `parent` with `replacement`.
    ///
    /// `replacement` must be detached or a direct child of `original`; the
    /// latter is how a node is collapsed into one of its own children.
    pub fn replace_child(
        &mut self,
        parent: NodeId,
        original: NodeId,
        replacement: NodeId,
    ) -> Result<(), StructuralError> {
        self.node(parent)?;
        self.node(original)?;
        let replacement_node = self.node(replacement)?;
        if !self.has_child(parent, original) {
            return Err(StructuralError::NotAChild {
                parent,
                node: original,
            });
        }
        let position = self.nodes[parent.index()]
            .children
            .iter()
            .position(|child| *child == original)
            .ok_or(StructuralError::NotAChild {
                parent,
                node: original,
            })?;
        self.check_slot(parent, position, replacement)?;
        if replacement == original || replacement == self.root {
            return Err(StructuralError::ReplacementAttached { node: replacement });
        }
        match replacement_node.parent {
            None => {}
            Some(owner) if owner == original => {}
            Some(_) => return Err(StructuralError::ReplacementAttached { node: replacement }),
        }
        for child in &replacement_node.children {
            let linked = self.nodes[child.index()].parent == Some(replacement);
            if !linked && *child != original {
                return Err(StructuralError::ReplacementAttached { node: *child });
            }
        }

        self.nodes[parent.index()].children[position] = replacement;
        self.nodes[original.index()].parent = None;
        self.nodes[replacement.index()].parent = Some(parent);
        self.relink_children(replacement);
        Ok(())
    }

    /// Detaches `node` from a variadic parent, returning its former index.
    pub fn remove_child(&mut self, parent: NodeId, node: NodeId) -> Result<usize, StructuralError> {
        if !self.data(parent)?.is_variadic() {
            return Err(StructuralError::NotVariadic { parent });
        }
        if !self.has_child(parent, node) {
            return Err(StructuralError::NotAChild { parent, node });
        }
        let position = self.nodes[parent.index()]
            .children
            .iter()
            .position(|child| *child == node)
            .ok_or(StructuralError::NotAChild { parent, node })?;
        self.nodes[parent.index()].children.remove(position);
        self.nodes[node.index()].parent = None;
        Ok(position)
    }

    /// Attaches a detached `node` at `index` in a variadic parent.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        index: usize,
        node: NodeId,
    ) -> Result<(), StructuralError> {
        let parent_node = self.node(parent)?;
        if !parent_node.data.is_variadic() {
            return Err(StructuralError::NotVariadic { parent });
        }
        let len = parent_node.children.len();
        if index > len {
            return Err(StructuralError::IndexOutOfBounds { parent, index, len });
        }
        self.check_slot(parent, index, node)?;
        let inserted = self.node(node)?;
        if inserted.parent.is_some() || node == self.root {
            return Err(StructuralError::ReplacementAttached { node });
        }
        for child in &inserted.children {
            if self.nodes[child.index()].parent != Some(node) {
                return Err(StructuralError::ReplacementAttached { node: *child });
            }
        }
        self.nodes[parent.index()].children.insert(index, node);
        self.nodes[node.index()].parent = Some(parent);
        Ok(())
    }

    /// Adds a childless, detached node to the arena.
    pub fn alloc_detached(&mut self, data: NodeData) -> NodeId {
        self.push(data, None)
    }

    /// Number of live nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.preorder().len()
    }

    /// Number of nodes in the subtree rooted at `id`, attached or not.
    pub fn subtree_size(&self, id: NodeId) -> usize {
        let mut count = 0;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current.index()) else {
                continue;
            };
            count += 1;
            stack.extend(node.children.iter().copied());
        }
        count
    }

    /// Distance from the root, which has depth zero.
    pub fn depth(&self, id: NodeId) -> u32 {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.nodes.get(current.index()).and_then(Node::parent) {
            depth += 1;
            current = parent;
            if depth as usize > self.nodes.len() {
                break;
            }
        }
        depth
    }

    /// Live nodes in deterministic pre-order.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![self.root];
        while let Some(current) = stack.pop() {
            order.push(current);
            if let Some(node) = self.nodes.get(current.index()) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        order
    }

    pub fn to_ast(&self) -> Result<ProgramAst, StructuralError> {
        let declarations = self.nodes[self.root.index()]
            .children
            .iter()
            .map(|decl| self.raise_decl(*decl))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProgramAst { declarations })
    }

    pub fn render(&self) -> Result<String, StructuralError> {
        self.to_ast().map(|ast| ast.render())
    }

    /// Rebuilds the arena without detached garbage.
    pub fn compact(&self) -> Result<Self, StructuralError> {
        self.to_ast().map(|ast| Self::from_ast(&ast))
    }

    /// `sha256:` digest of the canonical JSON form of the live program.
    pub fn canonical_hash(&self) -> Result<String, StructuralError> {
        let ast = self.to_ast()?;
        Ok(hash_program(&ast))
    }

    /// One-line rendering of a node for logs and opportunity descriptions.
    pub fn snippet(&self, id: NodeId) -> String {
        let Ok(data) = self.data(id) else {
            return format!("<{id}>");
        };
        let text = match data.category() {
            NodeCategory::Expression => self.raise_expr(id).map(|expr| expr.to_string()),
            NodeCategory::Statement => self.raise_stmt(id).map(|stmt| {
                let mut out = String::new();
                render_stmt(&mut out, &stmt, 0);
                out
            }),
            NodeCategory::Declaration => self.raise_decl(id).map(|decl| {
                let mut out = String::new();
                render_decl(&mut out, &decl);
                out
            }),
            NodeCategory::Unit => Ok("<unit>".to_string()),
        };
        let text = text.unwrap_or_else(|_| format!("<{}>", data.kind_name()));
        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.chars().count() > 60 {
            let truncated = line.chars().take(57).collect::<String>();
            format!("{truncated}...")
        } else {
            line
        }
    }

    fn push(&mut self, data: NodeData, parent: Option<NodeId>) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        debug_assert!(id.is_some(), "arena exceeded u32::MAX nodes");
        let id = id.unwrap_or(NodeId(u32::MAX));
        self.nodes.push(Node {
            data,
            children: Vec::new(),
            parent,
        });
        if let Some(parent) = parent {
            self.nodes[parent.index()].children.push(id);
        }
        id
    }

    fn check_slot(
        &self,
        parent: NodeId,
        index: usize,
        candidate: NodeId,
    ) -> Result<(), StructuralError> {
        let parent_data = self.data(parent)?;
        let candidate_data = self.data(candidate)?;
        let slot = parent_data
            .slot_kind(index)
            .ok_or(StructuralError::NotVariadic { parent })?;
        if !slot.accepts(candidate_data) {
            return Err(StructuralError::SlotMismatch {
                parent,
                slot,
                found: candidate_data.kind_name(),
            });
        }
        Ok(())
    }

    fn relink_children(&mut self, id: NodeId) {
        let children = self.nodes[id.index()].children.clone();
        for child in children {
            self.nodes[child.index()].parent = Some(id);
        }
    }

    fn lower_decl(&mut self, decl: &AstDecl, parent: NodeId) {
        match decl {
            AstDecl::Global { ty, name, init } => {
                let id = self.push(
                    NodeData::Global {
                        ty: ty.clone(),
                        name: name.clone(),
                    },
                    Some(parent),
                );
                if let Some(init) = init {
                    self.lower_expr(init, id);
                }
            }
            AstDecl::Function {
                return_type,
                name,
                params,
                body,
            } => {
                let id = self.push(
                    NodeData::Function {
                        return_type: return_type.clone(),
                        name: name.clone(),
                        params: params.clone(),
                    },
                    Some(parent),
                );
                let block = self.push(NodeData::Block, Some(id));
                for stmt in body {
                    self.lower_stmt(stmt, block);
                }
            }
        }
    }

    fn lower_stmt(&mut self, stmt: &AstStmt, parent: NodeId) {
        match stmt {
            AstStmt::Block { body } => {
                let id = self.push(NodeData::Block, Some(parent));
                for inner in body {
                    self.lower_stmt(inner, id);
                }
            }
            AstStmt::Expr { expr } => {
                let id = self.push(NodeData::ExprStmt, Some(parent));
                self.lower_expr(expr, id);
            }
            AstStmt::Var { ty, name, init } => {
                let id = self.push(
                    NodeData::Var {
                        ty: ty.clone(),
                        name: name.clone(),
                    },
                    Some(parent),
                );
                if let Some(init) = init {
                    self.lower_expr(init, id);
                }
            }
            AstStmt::If {
                cond,
                then,
                otherwise,
            } => {
                let id = self.push(NodeData::If, Some(parent));
                self.lower_expr(cond, id);
                self.lower_stmt(then, id);
                if let Some(otherwise) = otherwise {
                    self.lower_stmt(otherwise, id);
                }
            }
            AstStmt::While { cond, body } => {
                let id = self.push(NodeData::While, Some(parent));
                self.lower_expr(cond, id);
                self.lower_stmt(body, id);
            }
            AstStmt::Return { value } => {
                let id = self.push(NodeData::Return, Some(parent));
                if let Some(value) = value {
                    self.lower_expr(value, id);
                }
            }
            AstStmt::Discard => {
                self.push(NodeData::Discard, Some(parent));
            }
            AstStmt::Empty => {
                self.push(NodeData::Empty, Some(parent));
            }
        }
    }

    fn lower_expr(&mut self, expr: &AstExpr, parent: NodeId) {
        match expr {
            AstExpr::Int { value } => {
                self.push(NodeData::Int(*value), Some(parent));
            }
            AstExpr::Float { text } => {
                self.push(NodeData::Float(text.clone()), Some(parent));
            }
            AstExpr::Bool { value } => {
                self.push(NodeData::Bool(*value), Some(parent));
            }
            AstExpr::Ident { name } => {
                self.push(NodeData::Ident(name.clone()), Some(parent));
            }
            AstExpr::Unary { op, operand } => {
                let id = self.push(NodeData::Unary(*op), Some(parent));
                self.lower_expr(operand, id);
            }
            AstExpr::Binary { op, lhs, rhs } => {
                let id = self.push(NodeData::Binary(*op), Some(parent));
                self.lower_expr(lhs, id);
                self.lower_expr(rhs, id);
            }
            AstExpr::Call { callee, args } => {
                let id = self.push(NodeData::Call(callee.clone()), Some(parent));
                for arg in args {
                    self.lower_expr(arg, id);
                }
            }
            AstExpr::Paren { inner } => {
                let id = self.push(NodeData::Paren, Some(parent));
                self.lower_expr(inner, id);
            }
            AstExpr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                let id = self.push(NodeData::Ternary, Some(parent));
                self.lower_expr(cond, id);
                self.lower_expr(then, id);
                self.lower_expr(otherwise, id);
            }
        }
    }

    fn child_at(&self, id: NodeId, index: usize) -> Result<NodeId, StructuralError> {
        let node = self.node(id)?;
        node.children
            .get(index)
            .copied()
            .ok_or(StructuralError::Malformed {
                node: id,
                kind: node.data.kind_name(),
            })
    }

    fn optional_expr(&self, id: NodeId) -> Result<Option<AstExpr>, StructuralError> {
        match self.children(id)?.first() {
            Some(child) => self.raise_expr(*child).map(Some),
            None => Ok(None),
        }
    }

    fn raise_decl(&self, id: NodeId) -> Result<AstDecl, StructuralError> {
        let node = self.node(id)?;
        match &node.data {
            NodeData::Global { ty, name } => Ok(AstDecl::Global {
                ty: ty.clone(),
                name: name.clone(),
                init: self.optional_expr(id)?,
            }),
            NodeData::Function {
                return_type,
                name,
                params,
            } => {
                let body = self.child_at(id, 0)?;
                let body = match self.raise_stmt(body)? {
                    AstStmt::Block { body } => body,
                    _ => {
                        return Err(StructuralError::Malformed {
                            node: id,
                            kind: "function",
                        });
                    }
                };
                Ok(AstDecl::Function {
                    return_type: return_type.clone(),
                    name: name.clone(),
                    params: params.clone(),
                    body,
                })
            }
            other => Err(StructuralError::Malformed {
                node: id,
                kind: other.kind_name(),
            }),
        }
    }

    fn raise_stmt(&self, id: NodeId) -> Result<AstStmt, StructuralError> {
        let node = self.node(id)?;
        let stmt = match &node.data {
            NodeData::Block => AstStmt::Block {
                body: node
                    .children
                    .iter()
                    .map(|child| self.raise_stmt(*child))
                    .collect::<Result<Vec<_>, _>>()?,
            },
            NodeData::ExprStmt => AstStmt::Expr {
                expr: self.raise_expr(self.child_at(id, 0)?)?,
            },
            NodeData::Var { ty, name } => AstStmt::Var {
                ty: ty.clone(),
                name: name.clone(),
                init: self.optional_expr(id)?,
            },
            NodeData::If => AstStmt::If {
                cond: self.raise_expr(self.child_at(id, 0)?)?,
                then: Box::new(self.raise_stmt(self.child_at(id, 1)?)?),
                otherwise: match node.children.get(2) {
                    Some(child) => Some(Box::new(self.raise_stmt(*child)?)),
                    None => None,
                },
            },
            NodeData::While => AstStmt::While {
                cond: self.raise_expr(self.child_at(id, 0)?)?,
                body: Box::new(self.raise_stmt(self.child_at(id, 1)?)?),
            },
            NodeData::Return => AstStmt::Return {
                value: self.optional_expr(id)?,
            },
            NodeData::Discard => AstStmt::Discard,
            NodeData::Empty => AstStmt::Empty,
            other => {
                return Err(StructuralError::Malformed {
                    node: id,
                    kind: other.kind_name(),
                });
            }
        };
        Ok(stmt)
    }

    fn raise_expr(&self, id: NodeId) -> Result<AstExpr, StructuralError> {
        let node = self.node(id)?;
        let boxed = |index: usize| -> Result<Box<AstExpr>, StructuralError> {
            Ok(Box::new(self.raise_expr(self.child_at(id, index)?)?))
        };
        let expr = match &node.data {
            NodeData::Int(value) => AstExpr::Int { value: *value },
            NodeData::Float(text) => AstExpr::Float { text: text.clone() },
            NodeData::Bool(value) => AstExpr::Bool { value: *value },
            NodeData::Ident(name) => AstExpr::Ident { name: name.clone() },
            NodeData::Unary(op) => AstExpr::Unary {
                op: *op,
                operand: boxed(0)?,
            },
            NodeData::Binary(op) => AstExpr::Binary {
                op: *op,
                lhs: boxed(0)?,
                rhs: boxed(1)?,
            },
            NodeData::Call(callee) => AstExpr::Call {
                callee: callee.clone(),
                args: node
                    .children
                    .iter()
                    .map(|child| self.raise_expr(*child))
                    .collect::<Result<Vec<_>, _>>()?,
            },
            NodeData::Paren => AstExpr::Paren { inner: boxed(0)? },
            NodeData::Ternary => AstExpr::Ternary {
                cond: boxed(0)?,
                then: boxed(1)?,
                otherwise: boxed(2)?,
            },
            other => {
                return Err(StructuralError::Malformed {
                    node: id,
                    kind: other.kind_name(),
                });
            }
        };
        Ok(expr)
    }
}

/// `sha256:` digest of the canonical JSON encoding of `ast`.
pub fn hash_program(ast: &ProgramAst) -> String {
    let bytes = serde_json::to_vec(ast).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("sha256:{}", hex::encode(digest))
}
