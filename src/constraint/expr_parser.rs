//! The parser of constraint and statement expressions.
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag};
use nom::character::complete::{char, digit1, multispace0, satisfy};
use nom::combinator::{map, map_res, not, opt, peek, recognize, value};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::IResult;

use super::value::Value;
use crate::tokenset::Comparison;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Const(Value),
    Var(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(Comparison, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    /// A call of a built-in function. The name is lower-cased.
    Call(String, Vec<Expr>),
}

impl Expr {
    /// Every variable the expression reads.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name)
                }
            }
            Expr::List(items) | Expr::And(items) | Expr::Or(items) | Expr::Call(_, items) => {
                items.iter().for_each(|x| x.collect_variables(out))
            }
            Expr::Not(x) => x.collect_variables(out),
            Expr::Compare(_, a, b) | Expr::In(a, b) | Expr::Add(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The error type for expression parsing.
#[error("Invalid expression {input:?} at byte {offset}")]
pub struct ExprParseError {
    /// The whole expression.
    pub input: String,
    /// The byte offset where parsing stopped.
    pub offset: usize,
}

/// Parses a whole expression.
pub fn parse_expr(input: &str) -> Result<Expr, ExprParseError> {
    match delimited(multispace0, or_expr, multispace0)(input) {
        Ok(("", expr)) => Ok(expr),
        Ok((rest, _)) => Err(ExprParseError {
            input: input.to_string(),
            offset: input.len() - rest.len(),
        }),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ExprParseError {
            input: input.to_string(),
            offset: input.len() - e.input.len(),
        }),
        Err(nom::Err::Incomplete(_)) => Err(ExprParseError {
            input: input.to_string(),
            offset: input.len(),
        }),
    }
}

/// Parses a comma separated argument list without the surrounding parentheses.
pub fn parse_args(input: &str) -> Result<Vec<Expr>, ExprParseError> {
    match delimited(multispace0, separated_list0(ws(char(',')), or_expr), multispace0)(input) {
        Ok(("", args)) => Ok(args),
        Ok((rest, _)) => Err(ExprParseError {
            input: input.to_string(),
            offset: input.len() - rest.len(),
        }),
        Err(_) => Err(ExprParseError {
            input: input.to_string(),
            offset: 0,
        }),
    }
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    ws(terminated(
        tag(word),
        not(peek(satisfy(|c: char| c.is_alphanumeric() || c == '_'))),
    ))
}

pub(crate) fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_alphabetic() || c == '_'),
        many0(satisfy(|c: char| c.is_alphanumeric() || c == '_')),
    ))(input)
}

/// Parses one expression, leaving the rest of the input.
pub(crate) fn expression(input: &str) -> IResult<&str, Expr> {
    or_expr(input)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(keyword("or"), and_expr))(input)?;
    Ok((input, fold_variadic(first, rest, Expr::Or)))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(keyword("and"), not_expr))(input)?;
    Ok((input, fold_variadic(first, rest, Expr::And)))
}

fn fold_variadic(first: Expr, rest: Vec<Expr>, f: fn(Vec<Expr>) -> Expr) -> Expr {
    if rest.is_empty() {
        first
    } else {
        f(std::iter::once(first).chain(rest).collect())
    }
}

fn not_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(keyword("not"), not_expr), |x| Expr::Not(Box::new(x))),
        comparison,
    ))(input)
}

#[derive(Clone, Copy)]
enum RelOp {
    Cmp(Comparison),
    In,
    NotIn,
}

fn rel_op(input: &str) -> IResult<&str, RelOp> {
    ws(alt((
        value(RelOp::Cmp(Comparison::Eq), tag("==")),
        value(RelOp::Cmp(Comparison::Ne), tag("!=")),
        value(RelOp::Cmp(Comparison::Le), tag("<=")),
        value(RelOp::Cmp(Comparison::Ge), tag(">=")),
        value(RelOp::Cmp(Comparison::Lt), tag("<")),
        value(RelOp::Cmp(Comparison::Gt), tag(">")),
        value(RelOp::In, keyword("in")),
        value(RelOp::NotIn, pair(keyword("not"), keyword("in"))),
    )))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = sum(input)?;
    let (input, rhs) = opt(pair(rel_op, sum))(input)?;
    let expr = match rhs {
        None => lhs,
        Some((RelOp::Cmp(cmp), rhs)) => Expr::Compare(cmp, Box::new(lhs), Box::new(rhs)),
        Some((RelOp::In, rhs)) => Expr::In(Box::new(lhs), Box::new(rhs)),
        Some((RelOp::NotIn, rhs)) => Expr::Not(Box::new(Expr::In(Box::new(lhs), Box::new(rhs)))),
    };
    Ok((input, expr))
}

fn sum(input: &str) -> IResult<&str, Expr> {
    let (input, first) = primary(input)?;
    let (input, rest) = many0(preceded(ws(char('+')), primary))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, x| Expr::Add(Box::new(acc), Box::new(x))),
    ))
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map(string_literal, |s| Expr::Const(Value::Str(s))),
        map(integer, |i| Expr::Const(Value::Int(i))),
        map(
            delimited(
                ws(char('[')),
                separated_list0(ws(char(',')), or_expr),
                pair(opt(ws(char(','))), ws(char(']'))),
            ),
            Expr::List,
        ),
        delimited(ws(char('(')), or_expr, ws(char(')'))),
        call,
        map(identifier, |name| match name {
            "True" | "true" => Expr::Const(Value::Bool(true)),
            "False" | "false" => Expr::Const(Value::Bool(false)),
            "None" => Expr::Const(Value::None),
            name => Expr::Var(name.to_string()),
        }),
    )))(input)
}

const BUILTINS: [&str; 9] = [
    "len",
    "tokens",
    "sentences",
    "int",
    "regex",
    "stops_at",
    "stops_before",
    "starts_with",
    "one_of",
];

fn call(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = terminated(identifier, peek(ws(char('('))))(input)?;
    let lowered = name.to_ascii_lowercase();
    if !BUILTINS.contains(&lowered.as_str()) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }
    let (rest, args) = delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), or_expr),
        ws(char(')')),
    )(rest)?;
    Ok((rest, Expr::Call(lowered, args)))
}

pub(crate) fn integer(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), str::parse)(input)
}

/// Parses a single or double quoted string literal with backslash escapes.
pub(crate) fn string_literal(input: &str) -> IResult<&str, String> {
    alt((quoted('"'), quoted('\'')))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> IResult<&'a str, String> {
    let stop: &'static str = if quote == '"' { "\"\\" } else { "'\\" };
    move |input| {
        let (input, _) = char(quote)(input)?;
        if let Ok((input, _)) = char::<_, nom::error::Error<&str>>(quote)(input) {
            return Ok((input, String::new()));
        }
        terminated(
            escaped_transform(
                is_not(stop),
                '\\',
                alt((
                    value("\n", char('n')),
                    value("\t", char('t')),
                    value("\r", char('r')),
                    value("\\", char('\\')),
                    value("\"", char('"')),
                    value("'", char('\'')),
                    value("[", char('[')),
                    value("]", char(']')),
                    value("{", char('{')),
                    value("}", char('}')),
                )),
            ),
            char(quote),
        )(input)
    }
}
