//! Prompt templates: literal text interleaved with holes, role tags and interpolations.
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag};
use nom::character::complete::{char, multispace0};
use nom::combinator::{map, opt};
use nom::multi::{many0, separated_list0, separated_list1};
use nom::sequence::{delimited, preceded, separated_pair, terminated};
use nom::IResult;

use super::ParseQueryError;
use crate::constraint::expr_parser::{expression, identifier, integer, string_literal};
use crate::constraint::{Expr, Value};

/// A decorator applied to a hole, such as `@fixed("x")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecoratorCall {
    pub name: String,
    pub args: Vec<Value>,
}

/// What a hole is filled with besides free text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Annotation {
    /// `[X: int]`, which constrains the hole with `INT(X)`.
    Int,
    /// `[X: other(args)]`, which fills the hole by running another query.
    Query { name: String, args: Vec<Expr> },
}

/// A placeholder filled by the model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hole {
    pub name: String,
    pub decorators: Vec<DecoratorCall>,
    pub annotation: Option<Annotation>,
    /// Upper bound on generated tokens, from the `max_tokens` hole argument.
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Chunk {
    Literal(String),
    Hole(Hole),
    /// A reserved role tag, `{:user}`.
    TagExpr(String),
    /// An interpolated expression, `{X}`.
    FExpr(Expr),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Template {
    pub chunks: Vec<Chunk>,
}

impl Template {
    /// Parses the unescaped contents of a prompt string.
    pub fn parse(source: &str) -> Result<Template, ParseQueryError> {
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut rest = source;
        while !rest.is_empty() {
            let (next, chunk) = chunk(rest).map_err(|e| {
                let (offset, message) = match e {
                    nom::Err::Error(e) | nom::Err::Failure(e) => {
                        (source.len() - e.input.len(), format!("{:?}", e.code))
                    }
                    nom::Err::Incomplete(_) => (source.len(), "incomplete input".to_string()),
                };
                ParseQueryError::Template {
                    template: source.to_string(),
                    offset,
                    message,
                }
            })?;
            match (chunks.last_mut(), chunk) {
                (Some(Chunk::Literal(last)), Chunk::Literal(s)) => last.push_str(&s),
                (_, chunk) => chunks.push(chunk),
            }
            rest = next;
        }
        Ok(Template { chunks })
    }

    pub fn holes(&self) -> impl Iterator<Item = &Hole> {
        self.chunks.iter().filter_map(|c| match c {
            Chunk::Hole(h) => Some(h),
            _ => None,
        })
    }

    /// The literal text starting at chunk `index`, up to the next non-literal chunk.
    pub fn literal_at(&self, index: usize) -> &str {
        match self.chunks.get(index) {
            Some(Chunk::Literal(s)) => s,
            _ => "",
        }
    }
}

fn chunk(input: &str) -> IResult<&str, Chunk> {
    alt((
        map(tag("[["), |_| Chunk::Literal("[".to_string())),
        map(tag("]]"), |_| Chunk::Literal("]".to_string())),
        map(tag("{{"), |_| Chunk::Literal("{".to_string())),
        map(tag("}}"), |_| Chunk::Literal("}".to_string())),
        map(
            delimited(tag("{:"), delimited(multispace0, identifier, multispace0), char('}')),
            |role| Chunk::TagExpr(role.to_string()),
        ),
        map(delimited(char('{'), ws(expression), char('}')), Chunk::FExpr),
        map(hole, Chunk::Hole),
        map(is_not("[]{}"), |s: &str| Chunk::Literal(s.to_string())),
    ))(input)
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn literal_value(input: &str) -> IResult<&str, Value> {
    alt((
        map(string_literal, Value::Str),
        map(integer, Value::Int),
        map(identifier, |name| match name {
            "True" => Value::Bool(true),
            "False" => Value::Bool(false),
            _ => Value::Str(name.to_string()),
        }),
    ))(input)
}

fn decorator(input: &str) -> IResult<&str, DecoratorCall> {
    let (input, name) = preceded(char('@'), identifier)(input)?;
    let (input, args) = opt(delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), literal_value),
        ws(char(')')),
    ))(input)?;
    Ok((
        input,
        DecoratorCall {
            name: name.to_string(),
            args: args.unwrap_or_default(),
        },
    ))
}

fn annotation(input: &str) -> IResult<&str, Annotation> {
    let (rest, name) = ws(identifier)(input)?;
    if name == "int" {
        return Ok((rest, Annotation::Int));
    }
    let (rest, args) = delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), expression),
        ws(char(')')),
    )(rest)?;
    Ok((
        rest,
        Annotation::Query {
            name: name.to_string(),
            args,
        },
    ))
}

fn hole(input: &str) -> IResult<&str, Hole> {
    let (input, _) = char('[')(input)?;
    let (input, decorators) = many0(ws(decorator))(input)?;
    let (input, name) = ws(identifier)(input)?;
    let (input, annotation) = opt(preceded(char(':'), annotation))(input)?;
    let (input, kwargs) = opt(preceded(
        ws(char(';')),
        separated_list1(
            ws(char(',')),
            separated_pair(ws(identifier), char('='), ws(integer)),
        ),
    ))(input)?;
    let (input, _) = terminated(multispace0, char(']'))(input)?;
    let mut max_tokens = None;
    for (key, value) in kwargs.unwrap_or_default() {
        match key {
            "max_tokens" if value >= 0 => max_tokens = Some(value as usize),
            _ => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Verify,
                )))
            }
        }
    }
    Ok((
        input,
        Hole {
            name: name.to_string(),
            decorators,
            annotation,
            max_tokens,
        },
    ))
}
