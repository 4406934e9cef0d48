//! The indentation based parser of query files.
//!
//! Line structure (blocks, `for`, `if`, clauses) is handled here; every expression and
//! template inside a line is parsed with `nom`.
use std::str::FromStr;
use std::sync::Arc;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1, multispace0};
use nom::combinator::{map, map_res, opt, recognize};
use nom::multi::separated_list0;
use nom::sequence::{delimited, pair, separated_pair, terminated, tuple};
use nom::IResult;

use super::template::{Annotation, Template};
use super::{
    ArgValue, Decoder, DecoderKind, Iterable, KeywordArgs, ParseQueryError, Program, Query, Stmt,
};
use crate::constraint::expr_parser::{identifier, integer, string_literal};
use crate::constraint::{parse_expr, EvalError, Expr, OpGraph};

#[derive(Debug, Clone, Copy)]
struct Line<'a> {
    number: usize,
    indent: usize,
    text: &'a str,
}

fn syntax(line: &Line, message: impl Into<String>) -> ParseQueryError {
    ParseQueryError::Syntax {
        line: line.number,
        message: message.into(),
    }
}

/// Cuts a `#` comment, ignoring `#` inside string literals.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (Some(_), _) if escaped => escaped = false,
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '"' | '\'') => quote = Some(c),
            (None, '#') => return &line[..i],
            _ => {}
        }
    }
    line
}

fn logical_lines(source: &str) -> Vec<Line<'_>> {
    source
        .lines()
        .enumerate()
        .filter_map(|(i, raw)| {
            let text = strip_comment(raw).trim_end();
            let trimmed = text.trim_start();
            if trimmed.is_empty() {
                return None;
            }
            let indent = text[..text.len() - trimmed.len()]
                .chars()
                .map(|c| if c == '\t' { 4 } else { 1 })
                .sum();
            Some(Line {
                number: i + 1,
                indent,
                text: trimmed,
            })
        })
        .collect()
}

/// The lines after `lines[start]` that are indented deeper than it.
fn children_end(lines: &[Line], start: usize) -> usize {
    let indent = lines[start].indent;
    lines[start + 1..]
        .iter()
        .position(|l| l.indent <= indent)
        .map_or(lines.len(), |p| start + 1 + p)
}

/// Parses a query source file.
///
/// # Errors
///
/// Returns a [`ParseQueryError`] pointing at the first offending line.
pub fn parse_program(source: &str) -> Result<Program, ParseQueryError> {
    let lines = logical_lines(source);
    let Some(first) = lines.first() else {
        return Err(ParseQueryError::Empty);
    };
    let mut queries = Vec::new();
    if first.text.starts_with("query ") {
        let mut i = 0;
        while i < lines.len() {
            let line = &lines[i];
            let (name, params) = query_header(line)?;
            let end = children_end(&lines, i);
            if end == i + 1 {
                return Err(syntax(line, "a query without a body"));
            }
            queries.push(Arc::new(parse_query(name, params, &lines[i + 1..end])?));
            i = end;
        }
    } else {
        queries.push(Arc::new(parse_query("main".to_string(), vec![], &lines)?));
    }
    log::debug!("Parsed {} queries.", queries.len());
    Ok(Program { queries })
}

fn query_header(line: &Line) -> Result<(String, Vec<String>), ParseQueryError> {
    let parsed: IResult<&str, (&str, Option<Vec<&str>>)> = terminated(
        pair(
            delimited(pair(tag("query"), multispace0), identifier, multispace0),
            opt(delimited(
                ws(char('(')),
                separated_list0(ws(char(',')), identifier),
                ws(char(')')),
            )),
        ),
        ws(char(':')),
    )(line.text);
    match parsed {
        Ok(("", (name, params))) => Ok((
            name.to_string(),
            params
                .unwrap_or_default()
                .into_iter()
                .map(str::to_string)
                .collect(),
        )),
        _ => Err(syntax(line, "expected `query NAME(params):`")),
    }
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn arg_value(input: &str) -> IResult<&str, ArgValue> {
    alt((
        map(string_literal, ArgValue::Str),
        map_res(
            recognize(tuple((opt(char('-')), digit1, char('.'), digit1))),
            |s: &str| s.parse::<f64>().map(ArgValue::Float),
        ),
        map(integer, ArgValue::Int),
        map(alt((tag("True"), tag("true"))), |_| ArgValue::Bool(true)),
        map(alt((tag("False"), tag("false"))), |_| ArgValue::Bool(false)),
    ))(input)
}

fn keyword_args(input: &str) -> IResult<&str, Vec<(String, ArgValue)>> {
    separated_list0(
        ws(char(',')),
        map(
            separated_pair(ws(identifier), char('='), ws(arg_value)),
            |(k, v)| (k.to_string(), v),
        ),
    )(input)
}

/// Parses `name` or `name(key=value, ...)`.
pub(crate) fn parse_call_spec(source: &str) -> Option<(String, KeywordArgs)> {
    let parsed: IResult<&str, (&str, Option<Vec<(String, ArgValue)>>)> = pair(
        ws(identifier),
        opt(delimited(ws(char('(')), keyword_args, ws(char(')')))),
    )(source);
    match parsed {
        Ok(("", (name, args))) => Some((name.to_string(), KeywordArgs(args.unwrap_or_default()))),
        _ => None,
    }
}

fn decoder_clause(text: &str) -> Option<Decoder> {
    let text = text.strip_suffix(':').unwrap_or(text);
    let (name, args) = parse_call_spec(text)?;
    let kind = DecoderKind::from_str(&name).ok()?;
    Some(Decoder { kind, args })
}

fn parse_query(
    name: String,
    params: Vec<String>,
    lines: &[Line],
) -> Result<Query, ParseQueryError> {
    let base = lines[0].indent;
    let is_clause = |l: &Line| {
        l.indent == base && (l.text.starts_with("from ") || l.text.starts_with("where"))
    };
    let mut decoder = None;
    let mut i = 0;
    if let Some(clause) = decoder_clause(lines[0].text) {
        decoder = Some(clause);
        i = 1;
    }
    let body_end = match (&decoder, lines.get(i)) {
        (Some(_), Some(l)) if l.indent > base => children_end(lines, 0),
        _ => lines[i..]
            .iter()
            .position(is_clause)
            .map_or(lines.len(), |p| i + p),
    };
    let body: Arc<[Stmt]> = if body_end > i {
        parse_block(&lines[i..body_end])?.into()
    } else {
        Arc::from(Vec::new())
    };
    let mut model = None;
    let mut where_clause: Option<String> = None;
    let mut j = body_end;
    while j < lines.len() {
        let line = &lines[j];
        let end = children_end(lines, j);
        if let Some(rest) = line.text.strip_prefix("from ") {
            match string_literal(rest.trim()) {
                Ok(("", spec)) => model = Some(spec),
                _ => return Err(syntax(line, "expected `from \"MODEL\"`")),
            }
            if end != j + 1 {
                return Err(syntax(&lines[j + 1], "unexpected indentation"));
            }
        } else if let Some(rest) = line.text.strip_prefix("where") {
            let text = std::iter::once(rest)
                .chain(lines[j + 1..end].iter().map(|l| l.text))
                .collect::<Vec<_>>()
                .join(" ");
            where_clause = Some(text);
        } else {
            return Err(syntax(line, "expected `from` or `where`"));
        }
        j = end;
    }
    let mut constraint = match where_clause {
        Some(text) => Some(parse_expr(&text)?),
        None => None,
    };
    let mut names: Vec<String> = params.clone();
    collect_names(&body, &mut names);
    let mut int_holes = Vec::new();
    collect_int_holes(&body, &mut int_holes);
    for hole in int_holes {
        let int = Expr::Call("int".to_string(), vec![Expr::Var(hole)]);
        constraint = Some(match constraint {
            Some(Expr::And(mut items)) => {
                items.push(int);
                Expr::And(items)
            }
            Some(c) => Expr::And(vec![c, int]),
            None => int,
        });
    }
    if let Some(constraint) = &constraint {
        if let Some(unknown) = constraint
            .variables()
            .into_iter()
            .find(|v| !names.iter().any(|n| n == v))
        {
            return Err(EvalError::NameError(unknown.to_string()).into());
        }
        OpGraph::compile(constraint)?;
    }
    Ok(Query {
        name,
        params,
        decoder,
        body,
        model,
        constraint,
    })
}

/// Names bound by holes, assignments and loops.
fn collect_names(stmts: &[Stmt], out: &mut Vec<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Prompt(template) => {
                out.extend(template.holes().map(|h| h.name.clone()));
            }
            Stmt::Assign { name, .. } => out.push(name.clone()),
            Stmt::If {
                then, otherwise, ..
            } => {
                collect_names(then, out);
                collect_names(otherwise, out);
            }
            Stmt::For { var, body, .. } => {
                out.push(var.clone());
                collect_names(body, out);
            }
            Stmt::Return(_) => {}
        }
    }
}

fn collect_int_holes(stmts: &[Stmt], out: &mut Vec<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Prompt(template) => {
                for hole in template.holes() {
                    if hole.annotation == Some(Annotation::Int) && !out.contains(&hole.name) {
                        out.push(hole.name.clone());
                    }
                }
            }
            Stmt::If {
                then, otherwise, ..
            } => {
                collect_int_holes(then, out);
                collect_int_holes(otherwise, out);
            }
            Stmt::For { body, .. } => collect_int_holes(body, out),
            Stmt::Assign { .. } | Stmt::Return(_) => {}
        }
    }
}

fn parse_block(lines: &[Line]) -> Result<Vec<Stmt>, ParseQueryError> {
    let indent = lines[0].indent;
    let mut stmts = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        if line.indent != indent {
            return Err(syntax(line, "unexpected indentation"));
        }
        let end = children_end(lines, i);
        let children = &lines[i + 1..end];
        if line.text.starts_with("if ") {
            let (stmt, next) = parse_if(lines, i)?;
            stmts.push(stmt);
            i = next;
            continue;
        }
        let stmt = if line.text.starts_with('"') || line.text.starts_with('\'') {
            no_children(children)?;
            prompt(line)?
        } else if let Some(rest) = line.text.strip_prefix("for ") {
            if children.is_empty() {
                return Err(syntax(line, "a loop without a body"));
            }
            for_header(line, rest, children)?
        } else if let Some(rest) = line.text.strip_prefix("return ") {
            no_children(children)?;
            Stmt::Return(parse_expr(rest)?)
        } else if line.text == "pass" {
            no_children(children)?;
            i = end;
            continue;
        } else if line.text.starts_with("elif ") || line.text.starts_with("else") {
            return Err(syntax(line, "`else` without `if`"));
        } else {
            no_children(children)?;
            assignment(line)?
        };
        stmts.push(stmt);
        i = end;
    }
    Ok(stmts)
}

fn no_children(children: &[Line]) -> Result<(), ParseQueryError> {
    match children.first() {
        Some(child) => Err(syntax(child, "unexpected indentation")),
        None => Ok(()),
    }
}

fn indented_block(children: &[Line], line: &Line) -> Result<Arc<[Stmt]>, ParseQueryError> {
    if children.is_empty() {
        return Err(syntax(line, "expected an indented block"));
    }
    Ok(parse_block(children)?.into())
}

/// Parses an `if` chain starting at `lines[i]`, returning the statement and the index
/// of the line after the chain.
fn parse_if(lines: &[Line], i: usize) -> Result<(Stmt, usize), ParseQueryError> {
    let line = &lines[i];
    let cond_text = line
        .text
        .strip_prefix("if ")
        .or_else(|| line.text.strip_prefix("elif "))
        .and_then(|x| x.trim_end().strip_suffix(':'))
        .ok_or_else(|| syntax(line, "expected `if CONDITION:`"))?;
    let cond = parse_expr(cond_text)?;
    let end = children_end(lines, i);
    let then = indented_block(&lines[i + 1..end], line)?;
    match lines.get(end) {
        Some(next) if next.indent == line.indent && next.text.starts_with("elif ") => {
            let (nested, after) = parse_if(lines, end)?;
            let otherwise: Arc<[Stmt]> = Arc::from(vec![nested]);
            Ok((
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                },
                after,
            ))
        }
        Some(next)
            if next.indent == line.indent
                && next.text.strip_prefix("else").map(str::trim) == Some(":") =>
        {
            let else_end = children_end(lines, end);
            let otherwise = indented_block(&lines[end + 1..else_end], next)?;
            Ok((
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                },
                else_end,
            ))
        }
        _ => Ok((
            Stmt::If {
                cond,
                then,
                otherwise: Arc::from(Vec::new()),
            },
            end,
        )),
    }
}

fn prompt(line: &Line) -> Result<Stmt, ParseQueryError> {
    match string_literal(line.text) {
        Ok((rest, text)) if rest.trim().is_empty() => {
            Ok(Stmt::Prompt(Arc::new(Template::parse(&text)?)))
        }
        _ => Err(syntax(line, "expected a single prompt string")),
    }
}

fn for_header(line: &Line, rest: &str, children: &[Line]) -> Result<Stmt, ParseQueryError> {
    let header = rest
        .trim_end()
        .strip_suffix(':')
        .ok_or_else(|| syntax(line, "expected `:` after the loop header"))?;
    let (var, iterable) = header
        .split_once(" in ")
        .ok_or_else(|| syntax(line, "expected `for NAME in ITERABLE:`"))?;
    let var = match identifier(var.trim()) {
        Ok(("", var)) => var,
        _ => return Err(syntax(line, "expected a loop variable")),
    };
    let iter = match range_call(iterable) {
        Some(count) => Iterable::Range(count?),
        None => Iterable::List(parse_expr(iterable)?),
    };
    Ok(Stmt::For {
        var: var.to_string(),
        iter,
        body: parse_block(children)?.into(),
    })
}

/// `range(N)` is not a constraint built-in, so it is recognised before expression parsing.
fn range_call(iterable: &str) -> Option<Result<Expr, ParseQueryError>> {
    let inner = iterable.trim().strip_prefix("range")?.trim_start();
    let inner = inner.strip_prefix('(')?.strip_suffix(')')?;
    Some(parse_expr(inner).map_err(ParseQueryError::from))
}

fn assignment(line: &Line) -> Result<Stmt, ParseQueryError> {
    let parsed: IResult<&str, &str> = terminated(ws(identifier), char('='))(line.text);
    match parsed {
        Ok((rest, name)) if !rest.starts_with('=') => Ok(Stmt::Assign {
            name: name.to_string(),
            value: parse_expr(rest)?,
        }),
        _ => Err(syntax(line, "expected a prompt string or a statement")),
    }
}
