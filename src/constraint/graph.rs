//! The arena-allocated constraint op graph.
use std::fmt::Display;

use ahash::AHashMap;

use super::expr_parser::Expr;
use super::ops::Op;
use super::value::Value;
use super::EvalError;
use crate::regex::Regex;
use crate::tokenset::Comparison;

/// The index of a node in an [`OpGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpNode {
    pub op: Op,
    pub args: Vec<NodeId>,
}

/// A stop phrase of a variable, from `STOPS_AT` or `STOPS_BEFORE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StopCondition {
    pub phrase: String,
    /// Whether the phrase itself is cut from the value.
    pub before: bool,
}

/// A DAG of ops stored in an arena. Arguments always precede the nodes using them, so
/// evaluating nodes in index order is a valid bottom-up order.
///
/// Structurally equal subexpressions are shared.
#[derive(Debug, Clone)]
pub struct OpGraph {
    nodes: Vec<OpNode>,
    index: AHashMap<OpNode, NodeId>,
    root: Option<NodeId>,
}

const INT_PATTERN: &str = " ?-?[0-9]+";

impl OpGraph {
    /// A graph without constraints, which accepts everything.
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            index: AHashMap::default(),
            root: None,
        }
    }

    /// Compiles an expression.
    ///
    /// # Errors
    ///
    /// Returns an [`EvalError`] for unknown functions, wrong arities and invalid regexes.
    pub fn compile(expr: &Expr) -> Result<Self, EvalError> {
        let mut graph = Self::empty();
        let root = graph.add_expr(expr)?;
        graph.root = Some(root);
        Ok(graph)
    }

    /// Conjoins extra constraints, such as those implied by hole annotations.
    pub fn conjoin(&mut self, expr: &Expr) -> Result<(), EvalError> {
        let other = self.add_expr(expr)?;
        self.root = Some(match self.root {
            Some(root) => self.add(Op::And, vec![root, other]),
            None => other,
        });
        Ok(())
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn nodes(&self) -> &[OpNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &OpNode {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn add(&mut self, op: Op, args: Vec<NodeId>) -> NodeId {
        let node = OpNode { op, args };
        if let Some(id) = self.index.get(&node) {
            return *id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node.clone());
        self.index.insert(node, id);
        id
    }

    /// The variable name of a node, if it is a `Var`.
    pub fn var_name(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).op {
            Op::Var(name) => Some(name),
            _ => None,
        }
    }

    /// Every variable read by the graph.
    pub fn variables(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter_map(|n| match &n.op {
                Op::Var(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// For each node, whether its value depends on `var`.
    pub fn dependencies(&self, var: &str) -> Vec<bool> {
        let mut depends = vec![false; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            depends[i] = matches!(&node.op, Op::Var(name) if name == var)
                || node.args.iter().any(|a| depends[a.index()]);
        }
        depends
    }

    /// Nodes reachable from the root through `and` only.
    fn conjuncts(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if node.op == Op::And {
                stack.extend(node.args.iter().copied());
            } else {
                out.push(id);
            }
        }
        out
    }

    /// Stop phrases of `var`. Only top-level conjuncts are stop conditions.
    pub fn stop_conditions(&self, var: &str) -> Vec<StopCondition> {
        let mut out = Vec::new();
        for id in self.conjuncts() {
            let node = self.node(id);
            let before = match node.op {
                Op::StopsAt => false,
                Op::StopsBefore => true,
                _ => continue,
            };
            if node.args.len() == 2 && self.var_name(node.args[0]) == Some(var) {
                if let Op::Const(Value::Str(phrase)) = &self.node(node.args[1]).op {
                    if !phrase.is_empty() {
                        out.push(StopCondition {
                            phrase: phrase.clone(),
                            before,
                        });
                    }
                }
            }
        }
        out
    }

    /// The maximum number of tokens `var` may take, from `len(TOKENS(var)) < k`-like and
    /// `len(var) < k`-like conjuncts. Every token has at least one byte, so a byte bound
    /// is also a token bound.
    pub fn max_tokens_hint(&self, var: &str) -> Option<usize> {
        let mut hint: Option<usize> = None;
        for id in self.conjuncts() {
            let node = self.node(id);
            let Some(mut cmp) = node.op.comparison() else {
                continue;
            };
            if node.args.len() != 2 {
                continue;
            }
            let (mut measured, mut bound) = (node.args[0], node.args[1]);
            if !matches!(self.node(bound).op, Op::Const(Value::Int(_))) {
                std::mem::swap(&mut measured, &mut bound);
                cmp = cmp.flipped();
            }
            let Op::Const(Value::Int(k)) = self.node(bound).op else {
                continue;
            };
            let len = self.node(measured);
            if len.op != Op::Len || len.args.len() != 1 {
                continue;
            }
            let inner = self.node(len.args[0]);
            let target = match inner.op {
                Op::Tokens if inner.args.len() == 1 => inner.args[0],
                Op::Var(_) => len.args[0],
                _ => continue,
            };
            if self.var_name(target) != Some(var) {
                continue;
            }
            let limit = match cmp {
                Comparison::Lt => k.saturating_sub(1),
                Comparison::Le | Comparison::Eq => k,
                _ => continue,
            };
            let limit = limit.max(0) as usize;
            hint = Some(hint.map_or(limit, |h| h.min(limit)));
        }
        hint
    }

    fn add_expr(&mut self, expr: &Expr) -> Result<NodeId, EvalError> {
        Ok(match expr {
            Expr::Const(v) => self.add(Op::Const(v.clone()), vec![]),
            Expr::Var(name) => self.add(Op::Var(name.clone()), vec![]),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Expr::Const(v) => values.push(v.clone()),
                        other => {
                            return Err(EvalError::TypeError {
                                op: "list".to_string(),
                                detail: format!("non-constant element {:?}", other),
                            })
                        }
                    }
                }
                self.add(Op::Const(Value::List(values)), vec![])
            }
            Expr::Not(x) => {
                let x = self.add_expr(x)?;
                self.add(Op::Not, vec![x])
            }
            Expr::And(items) | Expr::Or(items) => {
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    args.push(self.add_expr(item)?);
                }
                let op = if matches!(expr, Expr::And(_)) {
                    Op::And
                } else {
                    Op::Or
                };
                self.add(op, args)
            }
            Expr::Compare(cmp, a, b) => {
                let args = vec![self.add_expr(a)?, self.add_expr(b)?];
                self.add(Op::from_comparison(*cmp), args)
            }
            Expr::In(a, b) => {
                let args = vec![self.add_expr(a)?, self.add_expr(b)?];
                self.add(Op::In, args)
            }
            Expr::Add(a, b) => {
                let args = vec![self.add_expr(a)?, self.add_expr(b)?];
                self.add(Op::Concat, args)
            }
            Expr::Call(name, args) => self.add_call(name, args)?,
        })
    }

    fn add_call(&mut self, name: &str, args: &[Expr]) -> Result<NodeId, EvalError> {
        let arity = |expected: &str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(EvalError::Arity {
                    op: name.to_string(),
                    expected: expected.to_string(),
                    got: args.len(),
                })
            }
        };
        let op = match name {
            "len" => {
                arity("1", args.len() == 1)?;
                Op::Len
            }
            "tokens" => {
                arity("1", args.len() == 1)?;
                Op::Tokens
            }
            "sentences" => {
                arity("1", args.len() == 1)?;
                Op::Sentences
            }
            "int" => {
                arity("1", args.len() == 1)?;
                let x = self.add_expr(&args[0])?;
                return Ok(self.add(Op::Regex(Regex::new(INT_PATTERN)?), vec![x]));
            }
            "regex" => {
                arity("2", args.len() == 2)?;
                let Expr::Const(Value::Str(pattern)) = &args[1] else {
                    return Err(EvalError::TypeError {
                        op: "REGEX".to_string(),
                        detail: "a non-literal pattern".to_string(),
                    });
                };
                let x = self.add_expr(&args[0])?;
                return Ok(self.add(Op::Regex(Regex::new(pattern)?), vec![x]));
            }
            "stops_at" => {
                arity("2", args.len() == 2)?;
                Op::StopsAt
            }
            "stops_before" => {
                arity("2", args.len() == 2)?;
                Op::StopsBefore
            }
            "starts_with" => {
                arity("at least 2", args.len() >= 2)?;
                Op::StartsWith
            }
            "one_of" => {
                arity("at least 2", args.len() >= 2)?;
                Op::OneOf
            }
            other => return Err(EvalError::UnknownFunction(other.to_string())),
        };
        let mut ids = Vec::with_capacity(args.len());
        for arg in args {
            ids.push(self.add_expr(arg)?);
        }
        Ok(self.add(op, ids))
    }

    fn fmt_node(&self, id: NodeId, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let node = self.node(id);
        match &node.op {
            Op::Var(name) => return f.write_str(name),
            Op::Const(Value::Str(s)) => return write!(f, "{:?}", s),
            Op::Const(v) => return write!(f, "{}", v),
            Op::Regex(r) => write!(f, "REGEX[/{}/](", r)?,
            op => write!(f, "{}(", op.name())?,
        }
        for (i, arg) in node.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            self.fmt_node(*arg, f)?;
        }
        f.write_str(")")
    }
}

impl Display for OpGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.root {
            Some(root) => self.fmt_node(root, f),
            None => f.write_str("True"),
        }
    }
}
