//! The resumable interpreter of query bodies.
//!
//! The interpreter is an explicit state machine: a stack of frames, one per running
//! (nested) query, each with a stack of statement blocks and a cursor into the prompt
//! template being emitted. It suspends at every hole and is resumed with the generated
//! text. Cloning an interpreter forks the whole continuation, which beam search relies on.
use std::sync::Arc;

use super::decorators::{DecoratorContext, DecoratorRegistry, PreOutcome};
use super::program_state::{ProgramState, VarState};
use super::template::{Annotation, Chunk, DecoratorCall, Hole, Template};
use super::{Iterable, Program, Query, Stmt};
use crate::constraint::{evaluate, EvalError, OpGraph, StopCondition, Value};
use crate::tokenizer::role_tag;
use crate::tokenset::TokenSetCache;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The error type for query interpretation.
pub enum InterpretError {
    #[error(transparent)]
    /// A statement expression failed.
    Eval(#[from] EvalError),
    /// A hole calls a query that is not defined.
    #[error("Query {0:?} is not defined")]
    UnknownQuery(String),
    /// A hole uses a decorator that is not registered.
    #[error("Decorator @{0} is not registered")]
    UnknownDecorator(String),
    /// A query is called with the wrong number of arguments.
    #[error("Query {query:?} expects {expected} arguments, got {got}")]
    Arity {
        query: String,
        expected: usize,
        got: usize,
    },
    /// A decorator rewrote the prompt so that a stop phrase now spans the value and the
    /// literal after it.
    #[error("Stop phrase {phrase:?} of {variable} straddles the rewritten value and the following text")]
    StopPhraseStraddlesRewrite { variable: String, phrase: String },
    /// The interpreter was resumed without a pending hole.
    #[error("No hole is being generated")]
    NoPendingHole,
}

/// A piece of prompt emitted by the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    /// A reserved role tag.
    Tag(String),
}

impl Segment {
    pub fn text(&self) -> String {
        match self {
            Segment::Text(s) => s.clone(),
            Segment::Tag(role) => role_tag(role),
        }
    }
}

/// Everything needed to generate a hole.
#[derive(Debug, Clone)]
pub struct HoleRequest {
    pub variable: String,
    /// The constraint of the query owning the hole.
    pub graph: Arc<OpGraph>,
    pub stops: Vec<StopCondition>,
    /// The tightest token bound from hole arguments and the constraint.
    pub max_tokens: Option<usize>,
    pub decorators: Vec<DecoratorCall>,
    /// The model of the frame owning the hole.
    pub model: String,
}

impl HoleRequest {
    /// Runs the `stream` decorators of the hole, innermost first.
    pub fn stream(&self, registry: &DecoratorRegistry, value: &str) {
        for call in self.decorators.iter().rev() {
            if let Some(decorator) = registry.get(&call.name) {
                decorator.stream(
                    value,
                    &DecoratorContext {
                        variable: &self.variable,
                        args: &call.args,
                    },
                );
            }
        }
    }
}

/// Where the interpreter stopped.
#[derive(Debug, Clone)]
pub enum Yield {
    /// Append `emitted` to the sequence, then generate the hole.
    Hole {
        emitted: Vec<Segment>,
        request: HoleRequest,
    },
    /// A nested query on another model must run to completion before the caller continues.
    Subquery {
        emitted: Vec<Segment>,
        query: Arc<Query>,
        args: Vec<Value>,
        model: String,
        variable: String,
    },
    /// The query returned.
    Done { emitted: Vec<Segment>, value: Value },
}

/// The generated text of a hole.
#[derive(Debug, Clone, Default)]
pub struct HoleCompletion {
    /// The text currently in the sequence.
    pub text: String,
    /// The value after stop phrase truncation.
    pub value: String,
    pub tokens: Vec<String>,
    pub token_ids: Vec<u32>,
    pub logprobs: Vec<f32>,
}

#[derive(Debug, Clone)]
struct Iteration {
    var: String,
    items: Arc<[Value]>,
    index: usize,
}

#[derive(Debug, Clone)]
struct Block {
    stmts: Arc<[Stmt]>,
    pos: usize,
    iteration: Option<Iteration>,
}

#[derive(Debug, Clone)]
struct Frame {
    query: Arc<Query>,
    graph: Arc<OpGraph>,
    state: ProgramState,
    blocks: Vec<Block>,
    template: Option<(Arc<Template>, usize)>,
    /// The caller variable receiving the return value.
    target: Option<String>,
    model: String,
}

impl Frame {
    fn new(
        query: Arc<Query>,
        args: Vec<Value>,
        model: String,
        target: Option<String>,
    ) -> Result<Self, InterpretError> {
        if args.len() != query.params.len() {
            return Err(InterpretError::Arity {
                query: query.name.clone(),
                expected: query.params.len(),
                got: args.len(),
            });
        }
        let graph = match &query.constraint {
            Some(constraint) => OpGraph::compile(constraint)?,
            None => OpGraph::empty(),
        };
        let mut state = ProgramState::new();
        for (param, arg) in query.params.iter().zip(args) {
            state.set_value(param, arg);
        }
        Ok(Self {
            blocks: vec![Block {
                stmts: query.body.clone(),
                pos: 0,
                iteration: None,
            }],
            query,
            graph: Arc::new(graph),
            state,
            template: None,
            target,
            model,
        })
    }

    /// The next statement to run, or `None` when the frame has run off its body.
    fn next_statement(&mut self) -> Option<Stmt> {
        loop {
            let block = self.blocks.last_mut()?;
            if block.pos < block.stmts.len() {
                block.pos += 1;
                return Some(block.stmts[block.pos - 1].clone());
            }
            if let Some(iteration) = &mut block.iteration {
                if iteration.index + 1 < iteration.items.len() {
                    iteration.index += 1;
                    block.pos = 0;
                    let (var, value) = (iteration.var.clone(), iteration.items[iteration.index].clone());
                    self.state.set_value(&var, value);
                    continue;
                }
            }
            self.blocks.pop();
        }
    }
}

#[derive(Debug, Clone)]
struct PendingHole {
    variable: String,
    decorators: Vec<DecoratorCall>,
    stops: Vec<StopCondition>,
    /// The literal following the hole in its template.
    next_literal: String,
}

/// A suspended query run.
#[derive(Debug, Clone)]
pub struct Interpreter {
    program: Arc<Program>,
    frames: Vec<Frame>,
    pending: Option<PendingHole>,
    pending_subquery: Option<String>,
    queued: Vec<Segment>,
    root_state: ProgramState,
    result: Option<Value>,
}

impl Interpreter {
    /// Prepares `query` with positional `args`, running on `model`.
    pub fn new(
        program: Arc<Program>,
        query: Arc<Query>,
        args: Vec<Value>,
        model: impl Into<String>,
    ) -> Result<Self, InterpretError> {
        let frame = Frame::new(query, args, model.into(), None)?;
        Ok(Self {
            program,
            root_state: frame.state.clone(),
            frames: vec![frame],
            pending: None,
            pending_subquery: None,
            queued: Vec::new(),
            result: None,
        })
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// The state of the outermost query.
    pub fn state(&self) -> &ProgramState {
        match self.frames.first() {
            Some(frame) => &frame.state,
            None => &self.root_state,
        }
    }

    /// The state of the innermost running query, which hole constraints are evaluated in.
    pub fn current_state(&self) -> &ProgramState {
        match self.frames.last() {
            Some(frame) => &frame.state,
            None => &self.root_state,
        }
    }

    pub fn prompt(&self) -> &str {
        self.state().prompt()
    }

    /// The return value, once the query is done.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.frames.is_empty()
    }

    fn emit(&mut self, emitted: &mut Vec<Segment>, segment: Segment) {
        let text = segment.text();
        for frame in &mut self.frames {
            frame.state.push_prompt(&text);
        }
        emitted.push(segment);
    }

    fn finish_frame(&mut self, value: Option<Value>) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        log::debug!("Query {} returned.", frame.query.name);
        match (self.frames.last_mut(), frame.target) {
            (Some(parent), Some(target)) => {
                let value = value.unwrap_or_else(|| Value::Str(frame.state.prompt().to_string()));
                parent.state.set(&target, VarState::assigned(value));
            }
            _ => {
                self.result = Some(value.unwrap_or(Value::None));
                self.root_state = frame.state;
            }
        }
    }

    /// Runs until the next hole, nested query or the end of the query.
    ///
    /// # Errors
    ///
    /// Returns an [`InterpretError`] if a statement fails.
    pub fn advance(
        &mut self,
        registry: &DecoratorRegistry,
        cache: &TokenSetCache,
    ) -> Result<Yield, InterpretError> {
        let mut emitted = std::mem::take(&mut self.queued);
        loop {
            let Some(top) = self.frames.len().checked_sub(1) else {
                return Ok(Yield::Done {
                    emitted,
                    value: self.result.clone().unwrap_or(Value::None),
                });
            };
            if let Some((template, index)) = self.frames[top].template.clone() {
                if index < template.chunks.len() {
                    self.frames[top].template = Some((template.clone(), index + 1));
                    match &template.chunks[index] {
                        Chunk::Literal(s) => self.emit(&mut emitted, Segment::Text(s.clone())),
                        Chunk::TagExpr(role) => self.emit(&mut emitted, Segment::Tag(role.clone())),
                        Chunk::FExpr(expr) => {
                            let value = evaluate(expr, &self.frames[top].state, cache)?;
                            self.emit(&mut emitted, Segment::Text(value.to_string()));
                        }
                        Chunk::Hole(hole) => {
                            let next_literal = template.literal_at(index + 1);
                            if let Some(y) =
                                self.enter_hole(hole, next_literal, registry, cache, &mut emitted)?
                            {
                                return Ok(y);
                            }
                        }
                    }
                    continue;
                }
                self.frames[top].template = None;
            }
            let Some(stmt) = self.frames[top].next_statement() else {
                self.finish_frame(None);
                continue;
            };
            self.execute(top, stmt, cache)?;
        }
    }

    fn execute(&mut self, top: usize, stmt: Stmt, cache: &TokenSetCache) -> Result<(), InterpretError> {
        let frame = &mut self.frames[top];
        match stmt {
            Stmt::Prompt(template) => frame.template = Some((template, 0)),
            Stmt::Assign { name, value } => {
                let value = evaluate(&value, &frame.state, cache)?;
                frame.state.set_value(&name, value);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let stmts = if evaluate(&cond, &frame.state, cache)?.truthy() {
                    then
                } else {
                    otherwise
                };
                frame.blocks.push(Block {
                    stmts,
                    pos: 0,
                    iteration: None,
                });
            }
            Stmt::For { var, iter, body } => {
                let items: Vec<Value> = match &iter {
                    Iterable::Range(count) => match evaluate(count, &frame.state, cache)? {
                        Value::Int(n) => (0..n.max(0)).map(Value::Int).collect(),
                        other => {
                            return Err(EvalError::TypeError {
                                op: "range".to_string(),
                                detail: other.type_name().to_string(),
                            }
                            .into())
                        }
                    },
                    Iterable::List(list) => match evaluate(list, &frame.state, cache)? {
                        Value::List(items) => items,
                        Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
                        other => {
                            return Err(EvalError::TypeError {
                                op: "for".to_string(),
                                detail: other.type_name().to_string(),
                            }
                            .into())
                        }
                    },
                };
                if let Some(first) = items.first() {
                    frame.state.set_value(&var, first.clone());
                    frame.blocks.push(Block {
                        stmts: body,
                        pos: 0,
                        iteration: Some(Iteration {
                            var,
                            items: items.into(),
                            index: 0,
                        }),
                    });
                }
            }
            Stmt::Return(expr) => {
                let value = evaluate(&expr, &frame.state, cache)?;
                self.finish_frame(Some(value));
            }
        }
        Ok(())
    }

    fn enter_hole(
        &mut self,
        hole: &Hole,
        next_literal: &str,
        registry: &DecoratorRegistry,
        cache: &TokenSetCache,
        emitted: &mut Vec<Segment>,
    ) -> Result<Option<Yield>, InterpretError> {
        let top = self.frames.len() - 1;
        if let Some(Annotation::Query { name, args }) = &hole.annotation {
            let query = self
                .program
                .query(name)
                .cloned()
                .ok_or_else(|| InterpretError::UnknownQuery(name.clone()))?;
            let frame = &self.frames[top];
            let args = args
                .iter()
                .map(|a| evaluate(a, &frame.state, cache))
                .collect::<Result<Vec<_>, _>>()?;
            match &query.model {
                Some(model) if *model != frame.model => {
                    log::debug!("Hole {} runs query {} on {}.", hole.name, name, model);
                    self.pending_subquery = Some(hole.name.clone());
                    return Ok(Some(Yield::Subquery {
                        emitted: std::mem::take(emitted),
                        model: model.clone(),
                        query,
                        args,
                        variable: hole.name.clone(),
                    }));
                }
                _ => {
                    let nested = Frame::new(query, args, frame.model.clone(), Some(hole.name.clone()))?;
                    self.frames.push(nested);
                    return Ok(None);
                }
            }
        }
        for call in &hole.decorators {
            let decorator = registry
                .get(&call.name)
                .ok_or_else(|| InterpretError::UnknownDecorator(call.name.clone()))?;
            let ctx = DecoratorContext {
                variable: &hole.name,
                args: &call.args,
            };
            if let PreOutcome::Fixed(value) = decorator.pre(&ctx) {
                self.emit(emitted, Segment::Text(value.clone()));
                self.frames[top]
                    .state
                    .set_value(&hole.name, Value::Str(value));
                return Ok(None);
            }
        }
        let frame = &self.frames[top];
        let stops = frame.graph.stop_conditions(&hole.name);
        let max_tokens = [hole.max_tokens, frame.graph.max_tokens_hint(&hole.name)]
            .into_iter()
            .flatten()
            .min();
        let request = HoleRequest {
            variable: hole.name.clone(),
            graph: frame.graph.clone(),
            stops: stops.clone(),
            max_tokens,
            decorators: hole.decorators.clone(),
            model: frame.model.clone(),
        };
        self.pending = Some(PendingHole {
            variable: hole.name.clone(),
            decorators: hole.decorators.clone(),
            stops,
            next_literal: next_literal.to_string(),
        });
        Ok(Some(Yield::Hole {
            emitted: std::mem::take(emitted),
            request,
        }))
    }

    /// Resumes after a hole was generated. Returns the prompt text replacing the generated
    /// text when decorators or stop phrases changed it.
    ///
    /// # Errors
    ///
    /// Returns [`InterpretError::StopPhraseStraddlesRewrite`] if a rewrite makes a stop
    /// phrase span the value and the literal after it.
    pub fn complete_hole(
        &mut self,
        completion: HoleCompletion,
        registry: &DecoratorRegistry,
    ) -> Result<Option<String>, InterpretError> {
        let pending = self.pending.take().ok_or(InterpretError::NoPendingHole)?;
        let mut value = completion.value.clone();
        let mut prompt_text = completion.value.clone();
        for call in pending.decorators.iter().rev() {
            let decorator = registry
                .get(&call.name)
                .ok_or_else(|| InterpretError::UnknownDecorator(call.name.clone()))?;
            let ctx = DecoratorContext {
                variable: &pending.variable,
                args: &call.args,
            };
            (value, prompt_text) = decorator.post(value, prompt_text, &ctx);
        }
        if prompt_text != completion.value {
            let joined = format!("{}{}", prompt_text, pending.next_literal);
            let boundary = prompt_text.len();
            for stop in &pending.stops {
                let straddles = joined
                    .match_indices(stop.phrase.as_str())
                    .any(|(i, _)| i < boundary && i + stop.phrase.len() > boundary);
                if straddles {
                    return Err(InterpretError::StopPhraseStraddlesRewrite {
                        variable: pending.variable,
                        phrase: stop.phrase.clone(),
                    });
                }
            }
        }
        for frame in &mut self.frames {
            frame.state.push_prompt(&prompt_text);
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.state.set(
                &pending.variable,
                VarState {
                    value: Value::Str(value),
                    tokens: completion.tokens,
                    token_ids: completion.token_ids,
                    logprobs: completion.logprobs,
                },
            );
        }
        Ok((prompt_text != completion.text).then_some(prompt_text))
    }

    /// Resumes after a nested query ran on another model. `prompt_text` is appended to the
    /// caller's prompt.
    pub fn complete_subquery(&mut self, value: Value, prompt_text: String) -> Result<(), InterpretError> {
        let variable = self
            .pending_subquery
            .take()
            .ok_or(InterpretError::NoPendingHole)?;
        let mut queued = std::mem::take(&mut self.queued);
        self.emit(&mut queued, Segment::Text(prompt_text));
        self.queued = queued;
        if let Some(frame) = self.frames.last_mut() {
            frame.state.set_value(&variable, value);
        }
        Ok(())
    }
}
