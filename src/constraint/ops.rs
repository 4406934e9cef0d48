//! Operator semantics: `forward` evaluation and `follow` derivation.
use std::cmp::Ordering;

use super::follow_map::FollowMap;
use super::graph::{OpGraph, OpNode};
use super::value::{FollowValue, Mono, Tagged, Value};
use super::{EvalError, OpContext};
use crate::regex::Regex;
use crate::tokenset::{Comparison, Measure, SentenceCounter, TokenPredicate, TokenSet};

/// An operator of the constraint language.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Len,
    In,
    OneOf,
    StopsAt,
    StopsBefore,
    StartsWith,
    /// Full match of the single argument. `INT` compiles to this op as well.
    Regex(Regex),
    Tokens,
    Sentences,
    Var(String),
    Const(Value),
    /// String, list and integer `+`.
    Concat,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::And => "and",
            Op::Or => "or",
            Op::Not => "not",
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Len => "len",
            Op::In => "in",
            Op::OneOf => "ONE_OF",
            Op::StopsAt => "STOPS_AT",
            Op::StopsBefore => "STOPS_BEFORE",
            Op::StartsWith => "STARTS_WITH",
            Op::Regex(_) => "REGEX",
            Op::Tokens => "TOKENS",
            Op::Sentences => "SENTENCES",
            Op::Var(_) => "var",
            Op::Const(_) => "const",
            Op::Concat => "+",
        }
    }

    pub fn comparison(&self) -> Option<Comparison> {
        Some(match self {
            Op::Eq => Comparison::Eq,
            Op::Ne => Comparison::Ne,
            Op::Lt => Comparison::Lt,
            Op::Le => Comparison::Le,
            Op::Gt => Comparison::Gt,
            Op::Ge => Comparison::Ge,
            _ => return None,
        })
    }

    pub fn from_comparison(cmp: Comparison) -> Self {
        match cmp {
            Comparison::Eq => Op::Eq,
            Comparison::Ne => Op::Ne,
            Comparison::Lt => Op::Lt,
            Comparison::Le => Op::Le,
            Comparison::Gt => Op::Gt,
            Comparison::Ge => Op::Ge,
        }
    }

    /// Evaluates the op over the current values of its operands.
    pub fn forward(
        &self,
        node: &OpNode,
        graph: &OpGraph,
        args: &[&Tagged<Value>],
        ctx: &OpContext,
    ) -> Result<Tagged<Value>, EvalError> {
        match self {
            Op::Const(v) => return Ok(Tagged::fin(v.clone())),
            Op::Var(name) => {
                return Ok(match ctx.scope.binding(name) {
                    Some(b) => Tagged::new(b.value.clone(), if b.growing { Mono::Inc } else { Mono::Fin }),
                    None => Tagged::var(Value::None),
                })
            }
            Op::And => return Ok(and_or(args.iter().copied(), true)),
            Op::Or => return Ok(and_or(args.iter().copied(), false)),
            _ => {}
        }
        // operands of variables not generated yet are neutral
        if args.iter().any(|a| a.value.is_none()) {
            return Ok(Tagged::var(Value::None));
        }
        let values: Vec<&Value> = args.iter().map(|a| &a.value).collect();
        let type_error = || EvalError::type_error(self, &values);
        Ok(match self {
            Op::Not => match &args[0].value {
                Value::Bool(b) => Tagged::new(Value::Bool(!b), args[0].mono.inverted()),
                _ => return Err(type_error()),
            },
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let cmp = self.comparison().ok_or_else(type_error)?;
                compare(cmp, args[0], args[1]).ok_or_else(type_error)?
            }
            Op::Len => match &args[0].value {
                Value::Str(s) => Tagged::new(Value::Int(s.len() as i64), args[0].mono),
                Value::List(l) => Tagged::new(Value::Int(l.len() as i64), args[0].mono),
                _ => return Err(type_error()),
            },
            Op::In => membership(args[0], args[1]).ok_or_else(type_error)?,
            Op::OneOf => {
                let options = one_of_options(&args[1..]);
                membership(args[0], &options).ok_or_else(type_error)?
            }
            Op::StopsAt | Op::StopsBefore => Tagged::fin(Value::Bool(true)),
            Op::StartsWith => {
                let Value::Str(x) = &args[0].value else {
                    return Err(type_error());
                };
                let prefixes = string_options(&args[1..]).ok_or_else(type_error)?;
                starts_with(x, args[0].mono, &prefixes)
            }
            Op::Regex(regex) => {
                let Value::Str(x) = &args[0].value else {
                    return Err(type_error());
                };
                let (full, viable) = ctx.cache.with_derivatives(|d| {
                    let state = d.intern_regex(regex);
                    let end = d.walk(state, x);
                    (d.nullable(end), !d.is_dead(end))
                });
                match args[0].mono {
                    Mono::Fin => Tagged::fin(Value::Bool(full)),
                    Mono::Inc if !viable => Tagged::fin(Value::Bool(false)),
                    _ => Tagged::var(Value::Bool(full)),
                }
            }
            Op::Tokens => {
                let binding = graph
                    .var_name(node.args[0])
                    .and_then(|name| ctx.scope.binding(name))
                    .ok_or_else(type_error)?;
                Tagged::new(
                    Value::List(binding.tokens.iter().cloned().map(Value::Str).collect()),
                    args[0].mono,
                )
            }
            Op::Sentences => match &args[0].value {
                Value::Str(s) => Tagged::new(
                    Value::List(split_sentences(s).into_iter().map(Value::Str).collect()),
                    args[0].mono,
                ),
                _ => return Err(type_error()),
            },
            Op::Concat => match (&args[0].value, &args[1].value) {
                (Value::Int(x), Value::Int(y)) => {
                    let sum = x.checked_add(*y).ok_or_else(|| EvalError::Overflow {
                        op: self.name().to_string(),
                    })?;
                    Tagged::new(Value::Int(sum), args[0].mono.join(args[1].mono))
                }
                _ => concat(args[0], args[1]).ok_or_else(type_error)?,
            },
            Op::Const(_) | Op::Var(_) | Op::And | Op::Or => unreachable!("handled above"),
        })
    }

    /// Derives the value of the op after one more token of the active variable, given the
    /// follow values of its operands in one cell of their product.
    pub fn follow(
        &self,
        node: &OpNode,
        graph: &OpGraph,
        args: &[&Tagged<FollowValue>],
        ctx: &OpContext,
    ) -> Result<FollowMap, EvalError> {
        if let Op::Var(name) = self {
            if ctx.active == Some(name.as_str()) {
                if let Some(b) = ctx.scope.binding(name) {
                    let text = match b.value {
                        Value::Str(s) => s.clone(),
                        _ => String::new(),
                    };
                    return Ok(FollowMap::new(vec![
                        (
                            TokenSet::singleton(ctx.eos_token_id),
                            Tagged::fin(FollowValue::Known(Value::Str(text.clone()))),
                        ),
                        (
                            TokenSet::Any,
                            Tagged::new(
                                FollowValue::Text {
                                    prefix: text,
                                    tokens: b.tokens.len(),
                                },
                                Mono::Inc,
                            ),
                        ),
                    ]));
                }
            }
        }
        let known: Option<Vec<Tagged<Value>>> = args
            .iter()
            .map(|a| a.value.known().map(|v| Tagged::new(v.clone(), a.mono)))
            .collect();
        if let Some(known) = known {
            let refs: Vec<&Tagged<Value>> = known.iter().collect();
            return Ok(FollowMap::constant(self.forward(node, graph, &refs, ctx)?.into()));
        }
        Ok(match self {
            Op::And | Op::Or => {
                let is_and = *self == Op::And;
                let decided = args.iter().any(|a| match &a.value {
                    FollowValue::Known(v) => {
                        let t = Tagged::new(v.clone(), a.mono);
                        if is_and {
                            t.is_final_false()
                        } else {
                            t.is_final_true()
                        }
                    }
                    _ => false,
                });
                if decided {
                    FollowMap::constant(Tagged::fin(FollowValue::Known(Value::Bool(!is_and))))
                } else {
                    FollowMap::opaque()
                }
            }
            Op::Len => match &args[0].value {
                FollowValue::Text { prefix, .. } => FollowMap::constant(Tagged::new(
                    FollowValue::Measured {
                        base: prefix.len() as i64,
                        measure: Measure::Bytes,
                    },
                    Mono::Inc,
                )),
                FollowValue::TokenList { count } => FollowMap::constant(Tagged::new(
                    FollowValue::Known(Value::Int(*count as i64)),
                    Mono::Inc,
                )),
                FollowValue::Sentences(counter) => FollowMap::constant(Tagged::new(
                    FollowValue::Measured {
                        base: 0,
                        measure: Measure::Sentences(*counter),
                    },
                    Mono::Inc,
                )),
                _ => FollowMap::opaque(),
            },
            Op::Tokens => match &args[0].value {
                FollowValue::Text { tokens, .. } => FollowMap::constant(Tagged::new(
                    FollowValue::TokenList { count: tokens + 1 },
                    Mono::Inc,
                )),
                _ => FollowMap::opaque(),
            },
            Op::Sentences => match &args[0].value {
                FollowValue::Text { prefix, .. } => FollowMap::constant(Tagged::new(
                    FollowValue::Sentences(SentenceCounter::default().feed(prefix)),
                    Mono::Inc,
                )),
                _ => FollowMap::opaque(),
            },
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let cmp = self.comparison().unwrap_or(Comparison::Eq);
                follow_compare(cmp, args[0], args[1])
            }
            Op::In => match (&args[0].value, &args[1].value) {
                (FollowValue::Text { prefix, .. }, FollowValue::Known(Value::List(options))) => {
                    follow_text_in_options(prefix, options)
                }
                (FollowValue::Known(Value::Str(needle)), FollowValue::Text { prefix, .. }) => {
                    follow_needle_in_text(needle, prefix)
                }
                (FollowValue::Text { prefix, .. }, FollowValue::Known(Value::Str(haystack))) => {
                    follow_text_within(prefix, haystack)
                }
                _ => FollowMap::opaque(),
            },
            Op::OneOf => match &args[0].value {
                FollowValue::Text { prefix, .. } => {
                    let known: Option<Vec<Tagged<Value>>> = args[1..]
                        .iter()
                        .map(|a| a.value.known().map(|v| Tagged::fin(v.clone())))
                        .collect();
                    match known {
                        Some(known) => {
                            let refs: Vec<&Tagged<Value>> = known.iter().collect();
                            match one_of_options(&refs).value {
                                Value::List(options) => follow_text_in_options(prefix, &options),
                                _ => FollowMap::opaque(),
                            }
                        }
                        None => FollowMap::opaque(),
                    }
                }
                _ => FollowMap::opaque(),
            },
            Op::StopsAt | Op::StopsBefore => {
                FollowMap::constant(Tagged::fin(FollowValue::Known(Value::Bool(true))))
            }
            Op::StartsWith => match &args[0].value {
                FollowValue::Text { prefix, .. } => {
                    let prefixes: Option<Vec<String>> = args[1..]
                        .iter()
                        .map(|a| match &a.value {
                            FollowValue::Known(Value::Str(s)) => Some(vec![s.clone()]),
                            FollowValue::Known(Value::List(l)) => l
                                .iter()
                                .map(|x| match x {
                                    Value::Str(s) => Some(s.clone()),
                                    _ => None,
                                })
                                .collect(),
                            _ => None,
                        })
                        .collect::<Option<Vec<Vec<String>>>>()
                        .map(|x| x.into_iter().flatten().collect());
                    match prefixes {
                        Some(prefixes) => follow_starts_with(prefix, &prefixes),
                        None => FollowMap::opaque(),
                    }
                }
                _ => FollowMap::opaque(),
            },
            Op::Regex(regex) => match &args[0].value {
                FollowValue::Text { prefix, .. } => {
                    let tail = ctx.cache.with_derivatives(|d| {
                        let state = d.intern_regex(regex);
                        let end = d.walk(state, prefix);
                        d.regex(end)
                    });
                    follow_regex(&tail)
                }
                _ => FollowMap::opaque(),
            },
            Op::Concat => match (&args[0].value, &args[1].value) {
                (
                    FollowValue::Known(Value::Str(a)),
                    FollowValue::Text { prefix, tokens },
                ) => FollowMap::constant(Tagged::new(
                    FollowValue::Text {
                        prefix: format!("{}{}", a, prefix),
                        tokens: *tokens,
                    },
                    Mono::Inc,
                )),
                _ => FollowMap::opaque(),
            },
            Op::Not => FollowMap::opaque(),
            Op::Var(_) | Op::Const(_) => FollowMap::opaque(),
        })
    }
}

fn and_or<'a>(args: impl Iterator<Item = &'a Tagged<Value>>, is_and: bool) -> Tagged<Value> {
    let mut seen = false;
    let mut all = true;
    let mut all_final = true;
    for arg in args {
        let Value::Bool(b) = arg.value else {
            // None operands are neutral, other values are treated by truthiness
            if arg.value.is_none() {
                continue;
            }
            seen = true;
            all &= arg.value.truthy() == is_and;
            all_final &= arg.mono == Mono::Fin;
            continue;
        };
        seen = true;
        let short_circuits = if is_and {
            arg.is_final_false()
        } else {
            arg.is_final_true()
        };
        if short_circuits {
            return Tagged::fin(Value::Bool(!is_and));
        }
        all &= b == is_and;
        all_final &= arg.mono == Mono::Fin
            || (is_and && arg.is_final_true())
            || (!is_and && arg.is_final_false());
    }
    if !seen {
        return Tagged::var(Value::None);
    }
    let value = if all { is_and } else { !is_and };
    Tagged::new(Value::Bool(value), if all_final { Mono::Fin } else { Mono::Var })
}

/// The monotonicity of `lhs - rhs` given those of the operands.
fn direction(lhs: Mono, rhs: Mono) -> Mono {
    lhs.join(rhs.inverted())
}

/// The result of a numeric comparison whose operand difference moves in `dir`.
fn compare_tag(cmp: Comparison, ordering: Ordering, dir: Mono) -> Tagged<Value> {
    let result = match cmp {
        Comparison::Lt => ordering == Ordering::Less,
        Comparison::Le => ordering != Ordering::Greater,
        Comparison::Eq => ordering == Ordering::Equal,
        Comparison::Ne => ordering != Ordering::Equal,
        Comparison::Gt => ordering == Ordering::Greater,
        Comparison::Ge => ordering != Ordering::Less,
    };
    let settled = match (dir, cmp) {
        (Mono::Fin, _) => true,
        (Mono::Var, _) => false,
        // the difference only grows
        (Mono::Inc, Comparison::Lt | Comparison::Le) => !result,
        (Mono::Inc, Comparison::Gt | Comparison::Ge) => result,
        (Mono::Inc, Comparison::Eq | Comparison::Ne) => ordering == Ordering::Greater,
        // the difference only shrinks
        (Mono::Dec, Comparison::Lt | Comparison::Le) => result,
        (Mono::Dec, Comparison::Gt | Comparison::Ge) => !result,
        (Mono::Dec, Comparison::Eq | Comparison::Ne) => ordering == Ordering::Less,
    };
    Tagged::new(Value::Bool(result), if settled { Mono::Fin } else { Mono::Var })
}

/// String equality where a growing operand can only be extended.
fn string_eq(growing: &str, fixed: &str, dir_growing: bool, cmp: Comparison) -> Tagged<Value> {
    let (value, mono) = if growing == fixed {
        (true, Mono::Var)
    } else if dir_growing && fixed.starts_with(growing) {
        (false, Mono::Var)
    } else {
        (false, if dir_growing { Mono::Fin } else { Mono::Var })
    };
    match cmp {
        Comparison::Ne => Tagged::new(Value::Bool(!value), mono),
        _ => Tagged::new(Value::Bool(value), mono),
    }
}

fn compare(cmp: Comparison, lhs: &Tagged<Value>, rhs: &Tagged<Value>) -> Option<Tagged<Value>> {
    let dir = direction(lhs.mono, rhs.mono);
    match (&lhs.value, &rhs.value) {
        (Value::Int(a), Value::Int(b)) => Some(compare_tag(cmp, a.cmp(b), dir)),
        (Value::Str(a), Value::Str(b)) if matches!(cmp, Comparison::Eq | Comparison::Ne) => {
            Some(match (lhs.mono, rhs.mono) {
                (Mono::Fin, Mono::Fin) => {
                    Tagged::fin(Value::Bool(cmp.apply(&a.as_str(), &b.as_str())))
                }
                (Mono::Inc, Mono::Fin) => string_eq(a, b, true, cmp),
                (Mono::Fin, Mono::Inc) => string_eq(b, a, true, cmp),
                _ => Tagged::var(Value::Bool(cmp.apply(&a.as_str(), &b.as_str()))),
            })
        }
        (Value::Str(a), Value::Str(b)) => {
            let mono = if dir == Mono::Fin { Mono::Fin } else { Mono::Var };
            Some(Tagged::new(Value::Bool(cmp.apply(a, b)), mono))
        }
        (Value::Bool(a), Value::Bool(b)) if matches!(cmp, Comparison::Eq | Comparison::Ne) => {
            let mono = if dir == Mono::Fin { Mono::Fin } else { Mono::Var };
            Some(Tagged::new(Value::Bool(cmp.apply(a, b)), mono))
        }
        (Value::List(a), Value::List(b)) if matches!(cmp, Comparison::Eq | Comparison::Ne) => {
            let mono = if dir == Mono::Fin { Mono::Fin } else { Mono::Var };
            Some(Tagged::new(Value::Bool(cmp.apply(a, b)), mono))
        }
        // values of different types are never equal
        (_, _) if matches!(cmp, Comparison::Eq | Comparison::Ne) => {
            let mono = if dir == Mono::Fin { Mono::Fin } else { Mono::Var };
            Some(Tagged::new(Value::Bool(cmp == Comparison::Ne), mono))
        }
        _ => None,
    }
}

fn membership(item: &Tagged<Value>, container: &Tagged<Value>) -> Option<Tagged<Value>> {
    match (&item.value, &container.value) {
        (_, Value::List(options)) => {
            let found = options.contains(&item.value);
            Some(match (item.mono, container.mono, &item.value) {
                (Mono::Fin, Mono::Fin, _) => Tagged::fin(Value::Bool(found)),
                (Mono::Inc, Mono::Fin, Value::Str(x)) => {
                    let extendable = options.iter().any(|o| match o {
                        Value::Str(o) => o.len() > x.len() && o.starts_with(x.as_str()),
                        _ => false,
                    });
                    if found || extendable {
                        Tagged::var(Value::Bool(found))
                    } else {
                        Tagged::fin(Value::Bool(false))
                    }
                }
                _ => Tagged::var(Value::Bool(found)),
            })
        }
        (Value::Str(needle), Value::Str(haystack)) => {
            let found = haystack.contains(needle.as_str());
            Some(match (item.mono, container.mono) {
                (Mono::Fin, Mono::Fin) => Tagged::fin(Value::Bool(found)),
                (Mono::Fin, Mono::Inc) if found => Tagged::fin(Value::Bool(true)),
                (Mono::Inc, Mono::Fin) if !found => Tagged::fin(Value::Bool(false)),
                _ => Tagged::var(Value::Bool(found)),
            })
        }
        _ => None,
    }
}

fn one_of_options(args: &[&Tagged<Value>]) -> Tagged<Value> {
    let mono = args.iter().fold(Mono::Fin, |acc, a| acc.join(a.mono));
    match args {
        [single] if matches!(single.value, Value::List(_)) => (*single).clone(),
        _ => Tagged::new(Value::List(args.iter().map(|a| a.value.clone()).collect()), mono),
    }
}

fn string_options(args: &[&Tagged<Value>]) -> Option<Vec<String>> {
    let mut out = Vec::new();
    for arg in args {
        match &arg.value {
            Value::Str(s) => out.push(s.clone()),
            Value::List(items) => {
                for item in items {
                    match item {
                        Value::Str(s) => out.push(s.clone()),
                        _ => return None,
                    }
                }
            }
            _ => return None,
        }
    }
    Some(out)
}

fn starts_with(x: &str, mono: Mono, prefixes: &[String]) -> Tagged<Value> {
    if prefixes.iter().any(|p| x.starts_with(p.as_str())) {
        return match mono {
            Mono::Fin | Mono::Inc => Tagged::fin(Value::Bool(true)),
            _ => Tagged::var(Value::Bool(true)),
        };
    }
    match mono {
        Mono::Fin => Tagged::fin(Value::Bool(false)),
        Mono::Inc if !prefixes.iter().any(|p| p.starts_with(x)) => Tagged::fin(Value::Bool(false)),
        _ => Tagged::var(Value::Bool(false)),
    }
}

fn concat(a: &Tagged<Value>, b: &Tagged<Value>) -> Option<Tagged<Value>> {
    let mono = match (a.mono, b.mono) {
        (Mono::Fin, Mono::Fin) => Mono::Fin,
        (Mono::Fin, Mono::Inc) => Mono::Inc,
        _ => Mono::Var,
    };
    Some(match (&a.value, &b.value) {
        (Value::Str(x), Value::Str(y)) => Tagged::new(Value::Str(format!("{}{}", x, y)), mono),
        (Value::Str(x), y) => Tagged::new(Value::Str(format!("{}{}", x, y)), mono),
        (x, Value::Str(y)) => Tagged::new(Value::Str(format!("{}{}", x, y)), Mono::Var.join(mono)),
        (Value::List(x), Value::List(y)) => Tagged::new(
            Value::List(x.iter().chain(y.iter()).cloned().collect()),
            mono,
        ),
        _ => return None,
    })
}

/// Splits text into sentences, consistently with [`SentenceCounter`].
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut open = false;
    for c in text.chars() {
        if SentenceCounter::is_terminator(c) {
            if open {
                current.push(c);
                out.push(current.trim().to_string());
                current.clear();
                open = false;
            } else if let Some(last) = out.last_mut() {
                last.push(c);
            }
        } else {
            if !c.is_whitespace() {
                open = true;
            }
            current.push(c);
        }
    }
    if open {
        out.push(current.trim().to_string());
    }
    out
}

fn follow_compare(
    cmp: Comparison,
    lhs: &Tagged<FollowValue>,
    rhs: &Tagged<FollowValue>,
) -> FollowMap {
    let dir = direction(lhs.mono, rhs.mono);
    match (&lhs.value, &rhs.value) {
        (FollowValue::Measured { base, measure }, FollowValue::Known(Value::Int(k))) => {
            measured_partition(*measure, k.saturating_sub(*base), |ord| {
                compare_tag(cmp, ord, dir)
            })
        }
        (FollowValue::Known(Value::Int(k)), FollowValue::Measured { base, measure }) => {
            measured_partition(*measure, k.saturating_sub(*base), |ord| {
                compare_tag(cmp, ord.reverse(), dir)
            })
        }
        (FollowValue::Text { prefix, .. }, FollowValue::Known(Value::Str(s)))
        | (FollowValue::Known(Value::Str(s)), FollowValue::Text { prefix, .. })
            if matches!(cmp, Comparison::Eq | Comparison::Ne) =>
        {
            follow_text_eq(prefix, s, cmp)
        }
        _ => FollowMap::opaque(),
    }
}

/// Partitions tokens by how `measure(token)` compares to `rhs`.
fn measured_partition(
    measure: Measure,
    rhs: i64,
    tag: impl Fn(Ordering) -> Tagged<Value>,
) -> FollowMap {
    let pred = |cmp| {
        TokenSet::predicate(TokenPredicate::Measure { measure, cmp, rhs })
    };
    FollowMap::new(vec![
        (pred(Comparison::Lt), tag(Ordering::Less).into()),
        (pred(Comparison::Eq), tag(Ordering::Equal).into()),
        (TokenSet::Any, tag(Ordering::Greater).into()),
    ])
    .simplify()
}

fn bool_follow(value: bool, mono: Mono) -> Tagged<FollowValue> {
    Tagged::new(FollowValue::Known(Value::Bool(value)), mono)
}

fn follow_text_eq(prefix: &str, target: &str, cmp: Comparison) -> FollowMap {
    let negate = cmp == Comparison::Ne;
    let Some(rest) = target.strip_prefix(prefix) else {
        return FollowMap::constant(bool_follow(negate, Mono::Fin));
    };
    if rest.is_empty() {
        return FollowMap::constant(bool_follow(negate, Mono::Fin));
    }
    FollowMap::new(vec![
        (
            TokenSet::predicate(TokenPredicate::OneOf(vec![rest.to_string()])),
            bool_follow(!negate, Mono::Var),
        ),
        (TokenSet::from_literal_prefix(rest), bool_follow(negate, Mono::Var)),
        (TokenSet::Any, bool_follow(negate, Mono::Fin)),
    ])
}

fn follow_text_in_options(prefix: &str, options: &[Value]) -> FollowMap {
    let rests: Vec<String> = options
        .iter()
        .filter_map(|o| match o {
            Value::Str(s) => s.strip_prefix(prefix).filter(|r| !r.is_empty()),
            _ => None,
        })
        .map(|x| x.to_string())
        .collect();
    if rests.is_empty() {
        return FollowMap::constant(bool_follow(false, Mono::Fin));
    }
    let extendable = TokenSet::union_all(
        rests
            .iter()
            .map(|r| TokenSet::from_literal_prefix(r))
            .collect(),
    );
    FollowMap::new(vec![
        (
            TokenSet::predicate(TokenPredicate::OneOf(rests)),
            bool_follow(true, Mono::Var),
        ),
        (extendable, bool_follow(false, Mono::Var)),
        (TokenSet::Any, bool_follow(false, Mono::Fin)),
    ])
}

fn follow_needle_in_text(needle: &str, prefix: &str) -> FollowMap {
    if prefix.contains(needle) {
        return FollowMap::constant(bool_follow(true, Mono::Fin));
    }
    let tail = crate::utils::char_suffix(prefix, needle.len().saturating_sub(1));
    FollowMap::new(vec![
        (
            TokenSet::predicate(TokenPredicate::CompletesSubstring {
                tail: tail.to_string(),
                needle: needle.to_string(),
            }),
            bool_follow(true, Mono::Fin),
        ),
        (TokenSet::Any, bool_follow(false, Mono::Var)),
    ])
}

fn follow_text_within(prefix: &str, haystack: &str) -> FollowMap {
    if !haystack.contains(prefix) {
        return FollowMap::constant(bool_follow(false, Mono::Fin));
    }
    FollowMap::new(vec![
        (
            TokenSet::predicate(TokenPredicate::StaysWithin {
                prefix: prefix.to_string(),
                haystack: haystack.to_string(),
            }),
            bool_follow(true, Mono::Var),
        ),
        (TokenSet::Any, bool_follow(false, Mono::Fin)),
    ])
}

fn follow_starts_with(prefix: &str, prefixes: &[String]) -> FollowMap {
    if prefixes.iter().any(|p| prefix.starts_with(p.as_str())) {
        return FollowMap::constant(bool_follow(true, Mono::Fin));
    }
    let rests: Vec<&str> = prefixes
        .iter()
        .filter_map(|p| p.strip_prefix(prefix))
        .collect();
    let done = TokenSet::union_all(
        rests
            .iter()
            .map(|r| TokenSet::predicate(TokenPredicate::StartsWith(r.to_string())))
            .collect(),
    );
    let pending = TokenSet::union_all(rests.iter().map(|r| TokenSet::from_literal_prefix(r)).collect());
    FollowMap::new(vec![
        (done, bool_follow(true, Mono::Fin)),
        (pending, bool_follow(false, Mono::Var)),
        (TokenSet::Any, bool_follow(false, Mono::Fin)),
    ])
}

fn follow_regex(tail: &Regex) -> FollowMap {
    if tail.is_nothing() {
        return FollowMap::constant(bool_follow(false, Mono::Fin));
    }
    FollowMap::new(vec![
        (
            TokenSet::predicate(TokenPredicate::RegexAccepts(tail.clone())),
            bool_follow(true, Mono::Var),
        ),
        (TokenSet::from_regex_tail(tail), bool_follow(false, Mono::Var)),
        (TokenSet::Any, bool_follow(false, Mono::Fin)),
    ])
}
