//! Bottom-up evaluation of an op graph.
use super::expr_parser::Expr;
use super::follow_map::FollowMap;
use super::graph::OpGraph;
use super::value::{FollowValue, Tagged, Value};
use super::{EvalError, OpContext, Scope};
use crate::tokenset::TokenSetCache;

/// The result of evaluating a constraint graph over one program state.
#[derive(Debug, Clone)]
pub struct Digest {
    /// The value of the root. A graph without constraints is final-true.
    pub value: Tagged<Value>,
    /// The value of every node, indexed by node id.
    pub trace: Vec<Tagged<Value>>,
    /// The follow map of the root, when requested.
    pub follow: Option<FollowMap>,
    /// The follow map of every node, when requested.
    pub follow_trace: Vec<FollowMap>,
}

impl Digest {
    /// Whether the constraint can no longer be satisfied.
    pub fn is_final_false(&self) -> bool {
        self.value.is_final_false()
    }
}

/// Evaluates `graph` in `ctx`. With `with_follow`, also derives the follow maps with
/// respect to `ctx.active`.
///
/// # Errors
///
/// Returns the first [`EvalError`] raised by an op.
pub fn digest(graph: &OpGraph, ctx: &OpContext, with_follow: bool) -> Result<Digest, EvalError> {
    let mut trace: Vec<Tagged<Value>> = Vec::with_capacity(graph.len());
    for node in graph.nodes() {
        let args: Vec<&Tagged<Value>> = node.args.iter().map(|a| &trace[a.index()]).collect();
        let value = node.op.forward(node, graph, &args, ctx)?;
        trace.push(value);
    }
    let value = match graph.root() {
        Some(root) => trace[root.index()].clone(),
        None => Tagged::fin(Value::Bool(true)),
    };
    let (follow, follow_trace) = match (with_follow, ctx.active) {
        (true, Some(var)) => {
            let depends = graph.dependencies(var);
            let mut follow_trace: Vec<FollowMap> = Vec::with_capacity(graph.len());
            for (i, node) in graph.nodes().iter().enumerate() {
                let map = if depends[i] {
                    let maps: Vec<&FollowMap> =
                        node.args.iter().map(|a| &follow_trace[a.index()]).collect();
                    FollowMap::product(&maps, |values| node.op.follow(node, graph, values, ctx))?
                } else {
                    FollowMap::constant(trace[i].clone().into())
                };
                follow_trace.push(map);
            }
            let root = match graph.root() {
                Some(root) => follow_trace[root.index()].clone(),
                None => FollowMap::constant(Tagged::fin(FollowValue::Known(Value::Bool(true)))),
            };
            (Some(root), follow_trace)
        }
        (true, None) => (
            Some(FollowMap::constant(value.clone().into())),
            Vec::new(),
        ),
        (false, _) => (None, Vec::new()),
    };
    log::trace!("Digest of {}: {}", graph, value);
    Ok(Digest {
        value,
        trace,
        follow,
        follow_trace,
    })
}

/// Evaluates a statement expression, such as an assignment or an `if` condition, over
/// completed variables.
///
/// # Errors
///
/// Returns [`EvalError::NameError`] when the expression reads an unbound variable.
pub fn evaluate(expr: &Expr, scope: &dyn Scope, cache: &TokenSetCache) -> Result<Value, EvalError> {
    if let Some(name) = expr.variables().into_iter().find(|v| scope.binding(v).is_none()) {
        return Err(EvalError::NameError(name.to_string()));
    }
    let graph = OpGraph::compile(expr)?;
    let ctx = OpContext {
        scope,
        active: None,
        cache,
        eos_token_id: 0,
    };
    Ok(digest(&graph, &ctx, false)?.value.value)
}
