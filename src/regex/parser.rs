//! The parser of regular expressions.
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::{anychar, char, digit1, none_of};
use nom::combinator::{map, map_opt, map_res, opt, value, verify};
use nom::multi::{many0, separated_list1};
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;

use super::{CharClass, RegexNode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The error type for regular expression parsing.
pub enum RegexParseError {
    /// The pattern could not be parsed past the given byte offset.
    #[error("Invalid regular expression {pattern:?} at byte {offset}: {message}")]
    InvalidSyntax {
        /// The whole pattern.
        pattern: String,
        /// The byte offset where parsing stopped.
        offset: usize,
        /// What was expected at that offset.
        message: String,
    },
    /// A bounded repetition whose lower bound exceeds its upper bound.
    #[error("Invalid repetition bounds {{{0},{1}}} in {2:?}")]
    InvalidRepetition(u32, u32, String),
}

/// Parses a regular expression. A leading `^` is ignored since every match is anchored.
pub fn parse(pattern: &str) -> Result<RegexNode, RegexParseError> {
    let input = pattern.strip_prefix('^').unwrap_or(pattern);
    match alternation(input) {
        Ok(("", node)) => Ok(node),
        Ok((rest, _)) => {
            if let Some((min, max)) = inverted_bounds(rest) {
                return Err(RegexParseError::InvalidRepetition(min, max, pattern.to_string()));
            }
            Err(RegexParseError::InvalidSyntax {
                pattern: pattern.to_string(),
                offset: pattern.len() - rest.len(),
                message: format!("unexpected {:?}", rest.chars().next().unwrap_or(')')),
            })
        }
        Err(nom::Err::Failure(e)) | Err(nom::Err::Error(e)) => {
            Err(RegexParseError::InvalidSyntax {
                pattern: pattern.to_string(),
                offset: pattern.len() - e.input.len(),
                message: format!("{:?}", e.code),
            })
        }
        Err(nom::Err::Incomplete(_)) => Err(RegexParseError::InvalidSyntax {
            pattern: pattern.to_string(),
            offset: pattern.len(),
            message: "unexpected end of pattern".to_string(),
        }),
    }
}

fn inverted_bounds(input: &str) -> Option<(u32, u32)> {
    let (_, (min, max)) = bounds(input).ok()?;
    match max {
        Some(max) if max < min => Some((min, max)),
        _ => None,
    }
}

fn alternation(input: &str) -> IResult<&str, RegexNode> {
    map(separated_list1(char('|'), concatenation), RegexNode::alt)(input)
}

fn concatenation(input: &str) -> IResult<&str, RegexNode> {
    map(many0(repetition), RegexNode::concat)(input)
}

fn repetition(input: &str) -> IResult<&str, RegexNode> {
    let (mut input, mut node) = atom(input)?;
    loop {
        let Ok((rest, (min, max))) = quantifier(input) else {
            break;
        };
        // lazy quantifiers match the same language
        let (rest, _) = opt(char('?'))(rest)?;
        node = RegexNode::repeat(node, min, max);
        input = rest;
    }
    Ok((input, node))
}

fn quantifier(input: &str) -> IResult<&str, (u32, Option<u32>)> {
    alt((
        value((0, Some(1)), char('?')),
        value((0, None), char('*')),
        value((1, None), char('+')),
        verify(bounds, |(min, max)| max.map_or(true, |max| max >= *min)),
    ))(input)
}

fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse)(input)
}

fn bounds(input: &str) -> IResult<&str, (u32, Option<u32>)> {
    delimited(
        char('{'),
        alt((
            map(
                tuple((number, char(','), number)),
                |(min, _, max)| (min, Some(max)),
            ),
            map(pair(number, char(',')), |(min, _)| (min, None)),
            map(number, |n| (n, Some(n))),
        )),
        char('}'),
    )(input)
}

fn atom(input: &str) -> IResult<&str, RegexNode> {
    alt((
        delimited(
            pair(char('('), opt(tag("?:"))),
            alternation,
            char(')'),
        ),
        map(class, RegexNode::class),
        value(RegexNode::Class(CharClass::dot()), char('.')),
        value(RegexNode::EndAnchor, char('$')),
        map(preceded(char('\\'), escape), RegexNode::class),
        // a brace that does not start a quantifier is a literal
        map(
            verify(none_of("()|*+?[.\\$"), |c| *c != '{' || bounds(input).is_err()),
            |c| RegexNode::Class(CharClass::single(c)),
        ),
    ))(input)
}

fn hex_char(digits: usize) -> impl Fn(&str) -> IResult<&str, char> {
    move |input| {
        map_opt(
            take_while_m_n(digits, digits, |c: char| c.is_ascii_hexdigit()),
            |hex: &str| u32::from_str_radix(hex, 16).ok().and_then(char::from_u32),
        )(input)
    }
}

fn shorthand(input: &str) -> IResult<&str, CharClass> {
    alt((
        value(CharClass::digit(), char('d')),
        value(CharClass::word(), char('w')),
        value(CharClass::space(), char('s')),
        value(CharClass::digit().negated(), char('D')),
        value(CharClass::word().negated(), char('W')),
        value(CharClass::space().negated(), char('S')),
    ))(input)
}

fn escape(input: &str) -> IResult<&str, CharClass> {
    alt((shorthand, map(escaped_char, CharClass::single)))(input)
}

fn escaped_char(input: &str) -> IResult<&str, char> {
    alt((
        value('\n', char('n')),
        value('\t', char('t')),
        value('\r', char('r')),
        value('\x0c', char('f')),
        value('\x0b', char('v')),
        value('\0', char('0')),
        preceded(char('x'), hex_char(2)),
        preceded(char('u'), hex_char(4)),
        verify(anychar, |c| !c.is_ascii_alphanumeric()),
    ))(input)
}

fn class(input: &str) -> IResult<&str, CharClass> {
    let (input, _) = char('[')(input)?;
    let (input, negated) = map(opt(char('^')), |x| x.is_some())(input)?;
    // a leading `]` is a literal
    let (input, first) = opt(map(char(']'), CharClass::single))(input)?;
    let (input, items) = many0(class_item)(input)?;
    let (input, _) = char(']')(input)?;
    let class = first
        .into_iter()
        .chain(items)
        .fold(CharClass::new(Vec::new()), |acc, x| acc.union(&x));
    Ok((input, if negated { class.negated() } else { class }))
}

fn class_char(input: &str) -> IResult<&str, char> {
    alt((preceded(char('\\'), escaped_char), none_of("]\\")))(input)
}

fn class_item(input: &str) -> IResult<&str, CharClass> {
    alt((
        preceded(char('\\'), shorthand),
        map(
            verify(
                tuple((class_char, char('-'), class_char)),
                |(a, _, b)| a <= b,
            ),
            |(a, _, b)| CharClass::new(vec![(a, b)]),
        ),
        map(class_char, CharClass::single),
    ))(input)
}
