//! The scheduler: advances decoder heads through holes, one batched forward pass per step.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backtrack::{BacktrackError, Backtracker};
use super::driver::{driver_for, BranchScore, Candidate, Expansion, HeadDriver};
use super::head::{pad_batch, DecoderHead, RewrittenInputIds};
use super::sampling::log_softmax;
use crate::backend::{with_retries, GenerateOutput, GenerateRequest, Limiter, ModelBackend};
use crate::config::Config;
use crate::constraint::{build_mask, digest, FollowMap, LogitBias, OpContext, Value};
use crate::output::{QueryOutcome, QueryResult, StreamChunk, StreamSink};
use crate::query::{
    Decoder, DecoratorRegistry, HoleCompletion, HoleRequest, HoleScope, Interpreter, Program,
    Query, Segment, Yield,
};
use crate::runtime::RuntimeError;
use crate::tokenizer::{role_tag, Tokenizer, SPECIAL_ROLES};
use crate::tokenset::{Materialiser, TokenSetCache};
use crate::utils::find_occurrence_ending_after;

/// Runs nested queries that target another model.
#[async_trait]
pub trait SubqueryRunner: Send + Sync {
    /// Runs `query` of `program` on `model` to completion and returns its value and prompt.
    async fn run_subquery(
        &self,
        program: Arc<Program>,
        query: Arc<Query>,
        args: Vec<Value>,
        model: &str,
    ) -> Result<(Value, String), RuntimeError>;
}

#[derive(Debug, Clone)]
struct ActiveHole {
    request: HoleRequest,
    budget: usize,
    tokens: Vec<String>,
    logprobs: Vec<f32>,
    backtracker: Backtracker,
    mask: Option<LogitBias>,
    /// The longest value prefix handed to stream decorators. Rewinds never shorten it.
    streamed: String,
}

/// The user data of a head.
#[derive(Debug, Clone)]
struct Branch {
    interpreter: Interpreter,
    hole: Option<ActiveHole>,
    result: Option<Value>,
    /// The head the current hole was started from.
    group: usize,
    /// Finished its hole and waits for the other branches.
    waiting: bool,
}

type Head = DecoderHead<Branch>;

fn is_live(head: &Head) -> bool {
    head.user_data.hole.is_some()
}

/// Drives one query run on one backend.
pub struct Scheduler<'a> {
    pub backend: Arc<dyn ModelBackend>,
    pub limiter: Limiter,
    pub cache: &'a TokenSetCache,
    pub decorators: &'a DecoratorRegistry,
    pub config: &'a Config,
    pub cancel: CancellationToken,
    pub sink: Option<&'a dyn StreamSink>,
    pub subqueries: &'a dyn SubqueryRunner,
}

async fn deadline_passed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

impl Scheduler<'_> {
    /// Runs `interpreter` to completion with the decoder of `decoder`, or the configured
    /// default decoder.
    ///
    /// # Errors
    ///
    /// Returns a [`RuntimeError`] when every branch failed, a backend call failed for good
    /// or the deadline passed.
    pub async fn run(
        &self,
        interpreter: Interpreter,
        decoder: Option<&Decoder>,
    ) -> Result<QueryOutcome, RuntimeError> {
        let tokenizer = self.backend.tokenizer();
        let mut driver = driver_for(decoder, &self.config.decoder);
        let max_len = decoder
            .and_then(|d| d.args.usize("max_len"))
            .unwrap_or(self.config.decoder.max_len);
        let timeout = self.config.backend.generation_timeout;
        let deadline = timeout.map(|t| Instant::now() + t);
        let bos: Vec<u32> = tokenizer.bos_token_id().into_iter().collect();
        let eos = tokenizer.eos_token_id();
        let mut heads: Vec<Head> = (0..driver.width())
            .map(|id| {
                let branch = Branch {
                    interpreter: interpreter.clone(),
                    hole: None,
                    result: None,
                    group: id,
                    waiting: false,
                };
                DecoderHead::new(id, bos.clone(), eos, branch)
            })
            .collect();
        let mut next_id = heads.len();
        let mut step = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                log::info!("Query run cancelled after {} steps.", step);
                return Ok(QueryOutcome::Cancelled);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(self.timeout_error(timeout, &heads));
                }
            }
            for head in &mut heads {
                self.drive(head, tokenizer.as_ref()).await?;
            }
            if !heads.iter().any(is_live) {
                if heads.iter().any(|h| h.user_data.waiting) {
                    heads = self.prune(driver.as_ref(), heads, true);
                    for head in &mut heads {
                        head.user_data.waiting = false;
                        head.user_data.group = head.id;
                    }
                    continue;
                }
                break;
            }
            heads = self.compute_masks(heads, tokenizer.as_ref(), max_len)?;
            if !heads.iter().any(is_live) {
                continue;
            }
            let live: Vec<usize> = (0..heads.len()).filter(|i| is_live(&heads[*i])).collect();
            let forward = self.forward(&heads, &live);
            let outputs = tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("Query run cancelled during a forward pass.");
                    return Ok(QueryOutcome::Cancelled);
                }
                _ = deadline_passed(deadline) => return Err(self.timeout_error(timeout, &heads)),
                outputs = forward => outputs?,
            };
            let logprobs: Vec<Vec<f32>> = live
                .iter()
                .zip(outputs)
                .map(|(&i, mut logits)| {
                    if let Some(mask) = heads[i].user_data.hole.as_ref().and_then(|h| h.mask.as_ref()) {
                        mask.apply(&mut logits);
                    }
                    heads[i].next_token_logits = logits;
                    log_softmax(&heads[i].next_token_logits)
                })
                .collect();
            let candidates: Vec<Candidate> = live
                .iter()
                .zip(&logprobs)
                .map(|(&branch, logprobs)| Candidate { branch, logprobs })
                .collect();
            let expansions = driver.expand(&candidates);
            heads = self.apply_expansions(heads, &expansions, &mut next_id, tokenizer.as_ref(), driver.as_ref())?;
            heads = self.prune(driver.as_ref(), heads, false);
            step += 1;
            log::debug!(
                "Step {}: {} heads, {} live.",
                step,
                heads.len(),
                heads.iter().filter(|h| is_live(h)).count()
            );
            self.stream(&heads, tokenizer.as_ref());
        }
        let heads = self.prune(driver.as_ref(), heads, true);
        let results = heads
            .into_iter()
            .map(|head| {
                let interpreter = &head.user_data.interpreter;
                QueryResult {
                    prompt: interpreter.prompt().to_string(),
                    variables: interpreter
                        .state()
                        .variables()
                        .map(|(name, v)| (name.to_string(), v.value.clone()))
                        .collect(),
                    return_value: head.user_data.result.clone().unwrap_or(Value::None),
                    logprob: head.logprob,
                    token_ids: head.input_ids,
                }
            })
            .collect();
        Ok(QueryOutcome::Completed(results))
    }

    fn timeout_error(&self, timeout: Option<Duration>, heads: &[Head]) -> RuntimeError {
        RuntimeError::Timeout {
            deadline: timeout.unwrap_or_default(),
            prompt: heads
                .first()
                .map(|h| h.user_data.interpreter.prompt().to_string())
                .unwrap_or_default(),
        }
    }

    fn append(&self, head: &mut Head, emitted: &[Segment], tokenizer: &dyn Tokenizer) {
        let mut ids = Vec::new();
        for segment in emitted {
            match segment {
                Segment::Text(text) => ids.extend(tokenizer.tokenize(text)),
                Segment::Tag(role) => match tokenizer.special_tag_id(role) {
                    Some(id) => ids.push(id),
                    None => ids.extend(tokenizer.tokenize(&role_tag(role))),
                },
            }
        }
        head.rewrite(RewrittenInputIds::append(ids));
    }

    /// Runs the interpreter of a head until it reaches a hole or returns.
    async fn drive(&self, head: &mut Head, tokenizer: &dyn Tokenizer) -> Result<(), RuntimeError> {
        while head.user_data.hole.is_none() && head.user_data.result.is_none() && !head.user_data.waiting {
            let yielded = head
                .user_data
                .interpreter
                .advance(self.decorators, self.cache)?;
            match yielded {
                Yield::Hole { emitted, request } => {
                    self.append(head, &emitted, tokenizer);
                    let budget = request
                        .max_tokens
                        .unwrap_or(self.config.decoder.max_tokens_per_hole);
                    log::debug!(
                        "Head {} starts hole {} with a budget of {} tokens.",
                        head.id,
                        request.variable,
                        budget
                    );
                    let offset = head.len();
                    head.rewrite(RewrittenInputIds {
                        value_offset: Some(offset),
                        ..Default::default()
                    });
                    head.user_data.hole = Some(ActiveHole {
                        request,
                        budget,
                        tokens: Vec::new(),
                        logprobs: Vec::new(),
                        backtracker: Backtracker::new(self.config.backtrack.max_rewinds),
                        mask: None,
                        streamed: String::new(),
                    });
                }
                Yield::Subquery {
                    emitted,
                    query,
                    args,
                    model,
                    variable,
                } => {
                    self.append(head, &emitted, tokenizer);
                    let program = head.user_data.interpreter.program().clone();
                    let (value, prompt) = self
                        .subqueries
                        .run_subquery(program, query, args, &model)
                        .await?;
                    let round_trip = tokenizer.decode(&tokenizer.tokenize(&prompt));
                    if round_trip != prompt {
                        return Err(RuntimeError::TokenizationMismatch {
                            variable,
                            detail: format!(
                                "the prompt of model {} decodes to {:?} under {}",
                                model,
                                round_trip,
                                tokenizer.identifier()
                            ),
                        });
                    }
                    head.user_data
                        .interpreter
                        .complete_subquery(value, prompt)?;
                }
                Yield::Done { emitted, value } => {
                    self.append(head, &emitted, tokenizer);
                    head.user_data.result = Some(value);
                }
            }
        }
        Ok(())
    }

    /// Computes the mask of every live head, backtracking on dead ends. Heads whose
    /// constraint cannot be satisfied are dropped unless no other head is left. Any other
    /// error fails the run.
    fn compute_masks(
        &self,
        heads: Vec<Head>,
        tokenizer: &dyn Tokenizer,
        max_len: usize,
    ) -> Result<Vec<Head>, RuntimeError> {
        let materialiser = Materialiser::new(tokenizer, self.cache);
        let count = heads.len();
        let mut kept = Vec::with_capacity(count);
        let mut first_error = None;
        for mut head in heads {
            if !is_live(&head) || head.user_data.hole.as_ref().is_some_and(|h| h.mask.is_some()) {
                kept.push(head);
                continue;
            }
            match self.compute_mask(&mut head, tokenizer, &materialiser, max_len) {
                Ok(()) => kept.push(head),
                Err(
                    e @ (RuntimeError::ConstraintUnsatisfiable { .. }
                    | RuntimeError::GenerationStuck { .. }),
                ) if count > 1 => {
                    log::debug!("Head {} is dropped: {}", head.id, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match (kept.is_empty(), first_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(kept),
        }
    }

    fn compute_mask(
        &self,
        head: &mut Head,
        tokenizer: &dyn Tokenizer,
        materialiser: &Materialiser,
        max_len: usize,
    ) -> Result<(), RuntimeError> {
        let eos = tokenizer.eos_token_id();
        let reserved: Vec<u32> = SPECIAL_ROLES
            .iter()
            .filter_map(|role| tokenizer.special_tag_id(role))
            .collect();
        loop {
            let mask = {
                let branch = &head.user_data;
                let Some(hole) = &branch.hole else {
                    return Ok(());
                };
                let value_ids = head.value_ids();
                let text = tokenizer.decode(value_ids);
                let variable = hole.request.variable.as_str();
                let scope = HoleScope::new(branch.interpreter.current_state(), variable, &text, &hole.tokens);
                let ctx = OpContext {
                    scope: &scope,
                    active: Some(variable),
                    cache: self.cache,
                    eos_token_id: eos,
                };
                let digest = digest(&hole.request.graph, &ctx, true)?;
                let follow = digest
                    .follow
                    .unwrap_or_else(|| FollowMap::constant(digest.value.clone().into()));
                let blocked = hole.backtracker.blocked_at(value_ids.len());
                let mask = build_mask(&follow, materialiser, &reserved, &blocked);
                if value_ids.len() >= hole.budget || head.len() >= max_len {
                    match mask.contains(eos) {
                        true => LogitBias::only(eos),
                        false => LogitBias::Sparse(Vec::new()),
                    }
                } else {
                    mask
                }
            };
            if !mask.is_empty() {
                if let Some(hole) = &mut head.user_data.hole {
                    hole.mask = Some(mask);
                }
                return Ok(());
            }
            let value_ids = head.value_ids().to_vec();
            let head_id = head.id;
            let prompt = format!(
                "{}{}",
                head.user_data.interpreter.prompt(),
                tokenizer.decode(&value_ids)
            );
            let Some(hole) = head.user_data.hole.as_mut() else {
                return Ok(());
            };
            let variable = hole.request.variable.clone();
            let keep = hole.backtracker.dead_end(&value_ids).map_err(|e| match e {
                BacktrackError::ConstraintUnsatisfiable => RuntimeError::ConstraintUnsatisfiable {
                    head: head_id,
                    variable: variable.clone(),
                    prompt: prompt.clone(),
                },
                BacktrackError::GenerationStuck(rewinds) => RuntimeError::GenerationStuck {
                    head: head_id,
                    variable: variable.clone(),
                    rewinds,
                    prompt: prompt.clone(),
                },
            })?;
            let removed: f32 = hole.logprobs[keep.min(hole.logprobs.len())..].iter().sum();
            hole.tokens.truncate(keep);
            hole.logprobs.truncate(keep);
            let offset = head.value_offset;
            head.logprob -= removed;
            head.rewrite(RewrittenInputIds {
                truncate_to: Some(offset + keep),
                ..Default::default()
            });
        }
    }

    /// One batched forward pass over the live heads, returning their next-token logits.
    async fn forward(&self, heads: &[Head], live: &[usize]) -> Result<Vec<Vec<f32>>, RuntimeError> {
        let batch_size = self
            .config
            .decoder
            .max_batch_size
            .unwrap_or_else(|| self.backend.max_batch_size())
            .max(1);
        let model = self.backend.identifier().to_string();
        let calls = live.chunks(batch_size).map(|chunk| {
            let rows: Vec<&[u32]> = chunk.iter().map(|&i| heads[i].input_ids.as_slice()).collect();
            let (input_ids, attention_mask) = pad_batch(&rows, heads[chunk[0]].eos_id);
            let tokens: usize = rows.iter().map(|r| r.len()).sum();
            let request = GenerateRequest {
                input_ids,
                attention_mask,
                temperature: 0.0,
                max_new_tokens: 1,
                bias: chunk
                    .iter()
                    .map(|&i| heads[i].user_data.hole.as_ref().and_then(|h| h.mask.clone()))
                    .collect(),
                streamer: None,
            };
            async move {
                let _permit = self.limiter.acquire(tokens).await?;
                with_retries(&self.config.backend, || self.backend.generate(request.clone())).await
            }
        });
        let mut logits = Vec::with_capacity(live.len());
        for output in join_all(calls).await {
            let GenerateOutput { scores, .. } =
                output.map_err(|e| RuntimeError::from_backend(&model, e))?;
            for row in scores {
                let first = row.into_iter().next().ok_or_else(|| RuntimeError::BackendProtocolError {
                    model: model.clone(),
                    message: "a row without scores".to_string(),
                })?;
                logits.push(first);
            }
        }
        if logits.len() != live.len() {
            return Err(RuntimeError::BackendProtocolError {
                model,
                message: format!("{} rows requested, {} returned", live.len(), logits.len()),
            });
        }
        Ok(logits)
    }

    fn apply_expansions(
        &self,
        heads: Vec<Head>,
        expansions: &[Expansion],
        next_id: &mut usize,
        tokenizer: &dyn Tokenizer,
        driver: &dyn HeadDriver,
    ) -> Result<Vec<Head>, RuntimeError> {
        let mut children = Vec::with_capacity(heads.len() + expansions.len());
        for (index, head) in heads.into_iter().enumerate() {
            if !is_live(&head) {
                children.push(head);
                continue;
            }
            let mine: Vec<&Expansion> = expansions.iter().filter(|e| e.parent == index).collect();
            let mut parent = Some(head);
            for (k, expansion) in mine.iter().enumerate() {
                let child = if k + 1 == mine.len() {
                    parent.take()
                } else {
                    parent.clone().map(|mut c| {
                        c.id = *next_id;
                        *next_id += 1;
                        c
                    })
                };
                if let Some(mut child) = child {
                    self.accept(&mut child, expansion.token, expansion.logprob, tokenizer, driver)?;
                    children.push(child);
                }
            }
        }
        Ok(children)
    }

    /// Appends a chosen token and ends the hole on EOS or a stop phrase.
    fn accept(
        &self,
        head: &mut Head,
        token: u32,
        logprob: f32,
        tokenizer: &dyn Tokenizer,
        driver: &dyn HeadDriver,
    ) -> Result<(), RuntimeError> {
        head.push(token, logprob);
        if let Some(hole) = &mut head.user_data.hole {
            hole.mask = None;
        }
        if token == head.eos_id {
            head.rewrite(RewrittenInputIds {
                strip_eos: true,
                ..Default::default()
            });
            let text = tokenizer.decode(head.value_ids());
            return self.finish_hole(head, text.clone(), text, tokenizer, driver);
        }
        let token_text = tokenizer.decode(&[token]);
        let value_ids = head.value_ids();
        let text = tokenizer.decode(value_ids);
        let before = tokenizer.decode(&value_ids[..value_ids.len() - 1]).len();
        let Some(hole) = &mut head.user_data.hole else {
            return Ok(());
        };
        hole.tokens.push(token_text);
        hole.logprobs.push(logprob);
        // a rewound branch streams again once it grows past what was already shown
        if text.len() > hole.streamed.len() && text.starts_with(hole.streamed.as_str()) {
            hole.request.stream(self.decorators, &text);
            hole.streamed.clone_from(&text);
        }
        let stop = hole
            .request
            .stops
            .iter()
            .filter_map(|stop| {
                find_occurrence_ending_after(&text, &stop.phrase, before).map(|end| {
                    let cut = if stop.before { end - stop.phrase.len() } else { end };
                    (end, cut)
                })
            })
            .min();
        match stop {
            Some((_, cut)) => {
                let value = text[..cut].to_string();
                self.finish_hole(head, text, value, tokenizer, driver)
            }
            None => Ok(()),
        }
    }

    fn finish_hole(
        &self,
        head: &mut Head,
        text: String,
        value: String,
        tokenizer: &dyn Tokenizer,
        driver: &dyn HeadDriver,
    ) -> Result<(), RuntimeError> {
        let Some(hole) = head.user_data.hole.take() else {
            return Ok(());
        };
        log::debug!(
            "Head {} completed {} = {:?}.",
            head.id,
            hole.request.variable,
            value
        );
        let completion = HoleCompletion {
            text,
            value,
            tokens: hole.tokens,
            token_ids: head.value_ids().to_vec(),
            logprobs: hole.logprobs,
        };
        let rewrite = head
            .user_data
            .interpreter
            .complete_hole(completion, self.decorators)?;
        if let Some(prompt_text) = rewrite {
            let offset = head.value_offset;
            head.rewrite(RewrittenInputIds {
                appended_ids: tokenizer.tokenize(&prompt_text),
                truncate_to: Some(offset),
                ..Default::default()
            });
        }
        head.user_data.waiting = driver.syncs_at_boundaries();
        Ok(())
    }

    fn prune(&self, driver: &dyn HeadDriver, heads: Vec<Head>, at_boundary: bool) -> Vec<Head> {
        let keep = {
            let scores: Vec<BranchScore> = heads
                .iter()
                .map(|h| BranchScore {
                    score: h.logprob,
                    ids: &h.input_ids,
                    group: h.user_data.group,
                    live: is_live(h),
                })
                .collect();
            driver.prune(&scores, at_boundary)
        };
        let mut slots: Vec<Option<Head>> = heads.into_iter().map(Some).collect();
        keep.into_iter().filter_map(|i| slots.get_mut(i).and_then(Option::take)).collect()
    }

    fn stream(&self, heads: &[Head], tokenizer: &dyn Tokenizer) {
        let (Some(sink), Some(head)) = (self.sink, heads.first()) else {
            return;
        };
        let interpreter = &head.user_data.interpreter;
        let mut variables: BTreeMap<String, String> = interpreter
            .state()
            .variables()
            .map(|(name, v)| (name.to_string(), v.value.to_string()))
            .collect();
        let mut prompt = interpreter.prompt().to_string();
        if let Some(hole) = &head.user_data.hole {
            let partial = tokenizer.decode(head.value_ids());
            prompt.push_str(&partial);
            variables.insert(hole.request.variable.clone(), partial);
        }
        sink.chunk(&StreamChunk { prompt, variables });
    }
}
