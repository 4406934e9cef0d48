//! A regular expression engine based on Brzozowski derivatives.
//!
//! Patterns are parsed into a [`RegexNode`] tree. Taking the derivative of a node by a
//! character yields the node matching every suffix that may follow that character,
//! or [`RegexNode::Nothing`] once no continuation can match. This is exactly what
//! constrained decoding needs: a partial generation is viable as long as its
//! derivative is not `Nothing`.
use std::fmt::{Display, Write};
use std::sync::Arc;

pub mod derivative;
pub mod parser;

pub use derivative::{DeadPrefixTrie, DerivativeCache, StateId};
pub use parser::RegexParseError;

/// A sorted list of disjoint, non-adjacent inclusive character ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharClass {
    ranges: Vec<(char, char)>,
}

const SURROGATE_START: u32 = 0xD800;
const SURROGATE_END: u32 = 0xDFFF;

fn next_char(c: char) -> Option<char> {
    match c as u32 + 1 {
        SURROGATE_START => char::from_u32(SURROGATE_END + 1),
        x => char::from_u32(x),
    }
}

fn prev_char(c: char) -> Option<char> {
    match (c as u32).checked_sub(1)? {
        SURROGATE_END => char::from_u32(SURROGATE_START - 1),
        x => char::from_u32(x),
    }
}

impl CharClass {
    /// Creates a class from possibly overlapping ranges.
    pub fn new(mut ranges: Vec<(char, char)>) -> Self {
        ranges.retain(|(a, b)| a <= b);
        ranges.sort_unstable();
        let mut merged: Vec<(char, char)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some((_, last_end)) if next_char(*last_end).map_or(true, |n| start <= n) => {
                    if end > *last_end {
                        *last_end = end;
                    }
                }
                _ => merged.push((start, end)),
            }
        }
        Self { ranges: merged }
    }

    pub fn single(c: char) -> Self {
        Self {
            ranges: vec![(c, c)],
        }
    }

    /// Every character except `\n`, as `.` matches.
    pub fn dot() -> Self {
        Self::single('\n').negated()
    }

    pub fn digit() -> Self {
        Self::new(vec![('0', '9')])
    }

    pub fn word() -> Self {
        Self::new(vec![('0', '9'), ('A', 'Z'), ('_', '_'), ('a', 'z')])
    }

    pub fn space() -> Self {
        Self::new(vec![('\t', '\r'), (' ', ' ')])
    }

    /// The complement over all Unicode scalar values.
    pub fn negated(&self) -> Self {
        let mut ranges = Vec::with_capacity(self.ranges.len() + 1);
        let mut start = Some('\0');
        for &(a, b) in &self.ranges {
            if let Some(s) = start {
                if s < a {
                    if let Some(p) = prev_char(a) {
                        ranges.push((s, p));
                    }
                }
            }
            start = next_char(b);
        }
        if let Some(s) = start {
            ranges.push((s, char::MAX));
        }
        Self { ranges }
    }

    pub fn union(&self, other: &CharClass) -> Self {
        Self::new(self.ranges.iter().chain(other.ranges.iter()).copied().collect())
    }

    pub fn contains(&self, c: char) -> bool {
        self.ranges
            .binary_search_by(|&(a, b)| {
                if b < c {
                    std::cmp::Ordering::Less
                } else if a > c {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(char, char)] {
        &self.ranges
    }
}

fn escape_char(c: char, f: &mut impl Write) -> std::fmt::Result {
    match c {
        '\n' => f.write_str("\\n"),
        '\t' => f.write_str("\\t"),
        '\r' => f.write_str("\\r"),
        '\\' | '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '$' | '^'
        | '-' => {
            f.write_char('\\')?;
            f.write_char(c)
        }
        c if c.is_control() => write!(f, "\\u{:04x}", c as u32),
        c => f.write_char(c),
    }
}

impl Display for CharClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let [(a, b)] = self.ranges[..] {
            if a == b {
                return escape_char(a, f);
            }
        }
        if *self == Self::dot() {
            return f.write_char('.');
        }
        let (negated, ranges) = match self.ranges.last() {
            Some(&(_, char::MAX)) => (true, self.negated().ranges),
            _ => (false, self.ranges.clone()),
        };
        f.write_char('[')?;
        if negated {
            f.write_char('^')?;
        }
        for (a, b) in ranges {
            escape_char(a, f)?;
            if a != b {
                f.write_char('-')?;
                escape_char(b, f)?;
            }
        }
        f.write_char(']')
    }
}

/// A node of a parsed regular expression.
///
/// Nodes are only ever built through the smart constructors ([`RegexNode::concat`],
/// [`RegexNode::alt`], [`RegexNode::repeat`]) so that structurally equal languages
/// have a good chance of being structurally equal trees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegexNode {
    /// Matches nothing.
    Nothing,
    /// Matches the empty string.
    Empty,
    /// Matches one character of the class.
    Class(CharClass),
    /// Matches the concatenation of its elements.
    Concat(Vec<RegexNode>),
    /// Matches any of its branches. Branches are sorted and deduplicated.
    Alt(Vec<RegexNode>),
    /// Matches `inner` between `min` and `max` times.
    Repeat {
        inner: Box<RegexNode>,
        min: u32,
        max: Option<u32>,
    },
    /// `$`: matches the empty string, but only at the end of the input.
    EndAnchor,
}

impl RegexNode {
    pub fn literal(s: &str) -> Self {
        Self::concat(s.chars().map(|c| RegexNode::Class(CharClass::single(c))).collect())
    }

    pub fn class(class: CharClass) -> Self {
        if class.is_empty() {
            RegexNode::Nothing
        } else {
            RegexNode::Class(class)
        }
    }

    pub fn concat(items: Vec<RegexNode>) -> Self {
        let mut flat = Vec::with_capacity(items.len());
        for item in items {
            match item {
                RegexNode::Nothing => return RegexNode::Nothing,
                RegexNode::Empty => {}
                RegexNode::Concat(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        // nothing that consumes input can follow `$`
        if let Some(anchor) = flat.iter().position(|x| *x == RegexNode::EndAnchor) {
            if flat[anchor + 1..].iter().any(|x| !x.nullable()) {
                return RegexNode::Nothing;
            }
        }
        match flat.len() {
            0 => RegexNode::Empty,
            1 => flat.pop().unwrap_or(RegexNode::Empty),
            _ => RegexNode::Concat(flat),
        }
    }

    pub fn alt(branches: Vec<RegexNode>) -> Self {
        let mut flat = Vec::with_capacity(branches.len());
        for branch in branches {
            match branch {
                RegexNode::Nothing => {}
                RegexNode::Alt(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        flat.sort_unstable();
        flat.dedup();
        if flat.len() > 1 && flat.contains(&RegexNode::Empty) {
            flat.retain(|x| *x != RegexNode::Empty);
            let rest = Self::alt(flat);
            return if rest.passable() {
                rest
            } else {
                Self::repeat(rest, 0, Some(1))
            };
        }
        match flat.len() {
            0 => RegexNode::Nothing,
            1 => flat.pop().unwrap_or(RegexNode::Nothing),
            _ => RegexNode::Alt(flat),
        }
    }

    pub fn repeat(inner: RegexNode, min: u32, max: Option<u32>) -> Self {
        if max == Some(0) {
            return RegexNode::Empty;
        }
        match inner {
            RegexNode::Nothing if min == 0 => RegexNode::Empty,
            RegexNode::Nothing => RegexNode::Nothing,
            RegexNode::Empty => RegexNode::Empty,
            inner if min == 1 && max == Some(1) => inner,
            inner => RegexNode::Repeat {
                inner: Box::new(inner),
                min,
                max,
            },
        }
    }

    /// Whether the node matches the empty string at the end of the input.
    pub fn nullable(&self) -> bool {
        match self {
            RegexNode::Nothing | RegexNode::Class(_) => false,
            RegexNode::Empty | RegexNode::EndAnchor => true,
            RegexNode::Concat(items) => items.iter().all(|x| x.nullable()),
            RegexNode::Alt(branches) => branches.iter().any(|x| x.nullable()),
            RegexNode::Repeat { inner, min, .. } => *min == 0 || inner.nullable(),
        }
    }

    /// Whether the node matches the empty string in front of more input.
    pub fn passable(&self) -> bool {
        match self {
            RegexNode::Nothing | RegexNode::Class(_) | RegexNode::EndAnchor => false,
            RegexNode::Empty => true,
            RegexNode::Concat(items) => items.iter().all(|x| x.passable()),
            RegexNode::Alt(branches) => branches.iter().any(|x| x.passable()),
            RegexNode::Repeat { inner, min, .. } => *min == 0 || inner.passable(),
        }
    }

    /// The derivative by one character.
    pub fn derive(&self, c: char) -> RegexNode {
        match self {
            RegexNode::Nothing | RegexNode::Empty | RegexNode::EndAnchor => RegexNode::Nothing,
            RegexNode::Class(class) => {
                if class.contains(c) {
                    RegexNode::Empty
                } else {
                    RegexNode::Nothing
                }
            }
            RegexNode::Concat(items) => {
                let mut branches = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    let mut rest = Vec::with_capacity(items.len() - i);
                    rest.push(item.derive(c));
                    rest.extend(items[i + 1..].iter().cloned());
                    branches.push(Self::concat(rest));
                    if !item.passable() {
                        break;
                    }
                }
                Self::alt(branches)
            }
            RegexNode::Alt(branches) => Self::alt(branches.iter().map(|x| x.derive(c)).collect()),
            RegexNode::Repeat { inner, min, max } => Self::concat(vec![
                inner.derive(c),
                Self::repeat(
                    (**inner).clone(),
                    min.saturating_sub(1),
                    max.map(|m| m.saturating_sub(1)),
                ),
            ]),
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, RegexNode::Nothing)
    }

    fn fmt_atom(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegexNode::Concat(_) | RegexNode::Alt(_) | RegexNode::Repeat { .. } => {
                write!(f, "({})", self)
            }
            _ => write!(f, "{}", self),
        }
    }
}

impl Display for RegexNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegexNode::Nothing => f.write_str("(?!)"),
            RegexNode::Empty => Ok(()),
            RegexNode::Class(class) => write!(f, "{}", class),
            RegexNode::EndAnchor => f.write_char('$'),
            RegexNode::Concat(items) => {
                for item in items {
                    match item {
                        RegexNode::Alt(_) => write!(f, "({})", item)?,
                        _ => write!(f, "{}", item)?,
                    }
                }
                Ok(())
            }
            RegexNode::Alt(branches) => {
                for (i, branch) in branches.iter().enumerate() {
                    if i > 0 {
                        f.write_char('|')?;
                    }
                    write!(f, "{}", branch)?;
                }
                Ok(())
            }
            RegexNode::Repeat { inner, min, max } => {
                inner.fmt_atom(f)?;
                match (min, max) {
                    (0, None) => f.write_char('*'),
                    (1, None) => f.write_char('+'),
                    (0, Some(1)) => f.write_char('?'),
                    (m, None) => write!(f, "{{{},}}", m),
                    (m, Some(n)) if m == n => write!(f, "{{{}}}", m),
                    (m, Some(n)) => write!(f, "{{{},{}}}", m, n),
                }
            }
        }
    }
}

/// A parsed regular expression.
///
/// Equality and hashing are structural over the parsed tree, so two spellings of the
/// same expression that normalize to the same tree are the same regex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Regex {
    root: Arc<RegexNode>,
}

impl Regex {
    /// Parses a pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`RegexParseError`] when the pattern is not valid.
    pub fn new(pattern: &str) -> Result<Self, RegexParseError> {
        Ok(Self {
            root: Arc::new(parser::parse(pattern)?),
        })
    }

    pub fn from_node(node: RegexNode) -> Self {
        Self {
            root: Arc::new(node),
        }
    }

    pub fn node(&self) -> &RegexNode {
        &self.root
    }

    /// The derivative by a whole string.
    pub fn derive_str(&self, s: &str) -> Regex {
        let mut node = (*self.root).clone();
        for c in s.chars() {
            node = node.derive(c);
            if node.is_nothing() {
                break;
            }
        }
        Self::from_node(node)
    }

    /// Whether `s` as a whole matches.
    pub fn fullmatch(&self, s: &str) -> bool {
        self.derive_str(s).root.nullable()
    }

    /// Whether some continuation of `s` can still match.
    pub fn is_viable_prefix(&self, s: &str) -> bool {
        !self.derive_str(s).root.is_nothing()
    }

    pub fn is_nothing(&self) -> bool {
        self.root.is_nothing()
    }

    pub fn nullable(&self) -> bool {
        self.root.nullable()
    }
}

impl Display for Regex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.root)
    }
}
