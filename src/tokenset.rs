//! Symbolic sets of vocabulary tokens.
//!
//! A [`TokenSet`] is either concrete (a sparse id list or a dense bitset, both possibly
//! complemented) or symbolic (a [`TokenPredicate`] over token texts). Set operations fold
//! concrete operands eagerly and keep symbolic ones lazy until [`TokenSet::materialise`]
//! turns the whole expression into a bitset over the vocabulary.
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;
use tinyvec::TinyVec;

use crate::regex::{DerivativeCache, Regex};
use crate::tokenizer::Tokenizer;
use crate::vocabulary::TokenTrie;

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum Comparison {
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
}

impl Comparison {
    pub fn apply<T: PartialOrd>(self, lhs: &T, rhs: &T) -> bool {
        match self {
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Ge => lhs >= rhs,
        }
    }

    /// The operator with its operands swapped, so that `a op b` is `b op.flipped() a`.
    pub fn flipped(self) -> Self {
        match self {
            Comparison::Lt => Comparison::Gt,
            Comparison::Le => Comparison::Ge,
            Comparison::Gt => Comparison::Lt,
            Comparison::Ge => Comparison::Le,
            x => x,
        }
    }
}

/// Counts sentences incrementally.
///
/// A sentence is a run of text containing a non-whitespace character and ending at a
/// terminator (`.`, `!`, `?`) or at the end of the text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SentenceCounter {
    complete: u32,
    open: bool,
}

impl SentenceCounter {
    pub fn is_terminator(c: char) -> bool {
        matches!(c, '.' | '!' | '?')
    }

    pub fn feed(mut self, text: &str) -> Self {
        for c in text.chars() {
            if Self::is_terminator(c) {
                if self.open {
                    self.complete += 1;
                    self.open = false;
                }
            } else if !c.is_whitespace() {
                self.open = true;
            }
        }
        self
    }

    pub fn count(&self) -> u32 {
        self.complete + self.open as u32
    }
}

/// A length measure over a growing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Measure {
    /// Byte length of the appended token.
    Bytes,
    /// Sentence count after appending the token to text in the given state.
    Sentences(SentenceCounter),
}

impl Measure {
    pub fn of(&self, token: &str) -> i64 {
        match self {
            Measure::Bytes => token.len() as i64,
            Measure::Sentences(counter) => counter.feed(token).count() as i64,
        }
    }
}

/// A predicate over the text of a single token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TokenPredicate {
    /// The token text is one of the strings.
    OneOf(Vec<String>),
    /// The token text is a non-empty prefix of the string, the string included.
    PrefixOf(String),
    /// The token text starts with the string.
    StartsWith(String),
    /// `tail` followed by the token text contains `needle`.
    CompletesSubstring { tail: String, needle: String },
    /// `prefix` followed by the token text occurs in `haystack`.
    StaysWithin { prefix: String, haystack: String },
    /// Some continuation of the token text matches the regex.
    RegexAlive(Regex),
    /// The token text matches the regex.
    RegexAccepts(Regex),
    /// `measure(token) cmp rhs`.
    Measure {
        measure: Measure,
        cmp: Comparison,
        rhs: i64,
    },
}

impl TokenPredicate {
    /// Evaluates the predicate on a single token text.
    pub fn matches(&self, text: &str, derivatives: &mut DerivativeCache) -> bool {
        if text.is_empty() {
            return false;
        }
        match self {
            TokenPredicate::OneOf(options) => options.iter().any(|x| x == text),
            TokenPredicate::PrefixOf(s) => s.starts_with(text),
            TokenPredicate::StartsWith(s) => text.starts_with(s.as_str()),
            TokenPredicate::CompletesSubstring { tail, needle } => {
                let joined = format!("{}{}", tail, text);
                crate::utils::find_occurrence_ending_after(&joined, needle, tail.len()).is_some()
            }
            TokenPredicate::StaysWithin { prefix, haystack } => {
                haystack.contains(format!("{}{}", prefix, text).as_str())
            }
            TokenPredicate::RegexAlive(regex) => {
                let start = derivatives.intern_regex(regex);
                let end = derivatives.walk(start, text);
                !derivatives.is_dead(end)
            }
            TokenPredicate::RegexAccepts(regex) => derivatives.fullmatch(regex, text),
            TokenPredicate::Measure { measure, cmp, rhs } => cmp.apply(&measure.of(text), rhs),
        }
    }
}

impl Display for TokenPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenPredicate::OneOf(options) => write!(f, "one_of({:?})", options),
            TokenPredicate::PrefixOf(s) => write!(f, "prefix_of({:?})", s),
            TokenPredicate::StartsWith(s) => write!(f, "starts_with({:?})", s),
            TokenPredicate::CompletesSubstring { tail, needle } => {
                write!(f, "completes({:?}, {:?})", tail, needle)
            }
            TokenPredicate::StaysWithin { prefix, haystack } => {
                write!(f, "within({:?}, {:?})", prefix, haystack)
            }
            TokenPredicate::RegexAlive(r) => write!(f, "regex_alive(/{}/)", r),
            TokenPredicate::RegexAccepts(r) => write!(f, "regex_accepts(/{}/)", r),
            TokenPredicate::Measure {
                measure: Measure::Bytes,
                cmp,
                rhs,
            } => write!(f, "len {} {}", cmp, rhs),
            TokenPredicate::Measure {
                measure: Measure::Sentences(counter),
                cmp,
                rhs,
            } => write!(f, "sentences({}) {} {}", counter.count(), cmp, rhs),
        }
    }
}

/// A dense bitset over token ids, compared by its members.
#[derive(Clone)]
pub struct DenseIds(pub FixedBitSet);

impl PartialEq for DenseIds {
    fn eq(&self, other: &Self) -> bool {
        self.0.ones().eq(other.0.ones())
    }
}

impl Eq for DenseIds {}

impl Hash for DenseIds {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for id in self.0.ones() {
            id.hash(state);
        }
    }
}

impl PartialOrd for DenseIds {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DenseIds {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.ones().cmp(other.0.ones())
    }
}

impl Debug for DenseIds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(crate::utils::get_display_form_from_bitset(&self.0))
            .finish()
    }
}

pub type IdList = TinyVec<[u32; 4]>;

/// A set of vocabulary tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TokenSet {
    Empty,
    Any,
    /// Sorted, deduplicated ids, or every id but those when `complement` is set.
    Sparse { ids: IdList, complement: bool },
    /// A bitset over the vocabulary, ids beyond its length are not members.
    Dense(DenseIds),
    Symbolic {
        pred: Arc<TokenPredicate>,
        complement: bool,
    },
    /// Canonical: flattened, sorted, deduplicated, at least two members, at most one concrete.
    Intersection(Vec<TokenSet>),
    /// Canonical: flattened, sorted, deduplicated, at least two members, at most one concrete.
    Union(Vec<TokenSet>),
}

fn sorted_ids(ids: impl IntoIterator<Item = u32>) -> IdList {
    let mut ids: Vec<u32> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    ids.into_iter().collect()
}

fn sparse(ids: IdList, complement: bool) -> TokenSet {
    match (ids.is_empty(), complement) {
        (true, false) => TokenSet::Empty,
        (true, true) => TokenSet::Any,
        _ => TokenSet::Sparse { ids, complement },
    }
}

fn ids_intersection(a: &IdList, b: &IdList) -> IdList {
    a.iter().copied().filter(|x| b.binary_search(x).is_ok()).collect()
}

fn ids_difference(a: &IdList, b: &IdList) -> IdList {
    a.iter().copied().filter(|x| b.binary_search(x).is_err()).collect()
}

fn ids_union(a: &IdList, b: &IdList) -> IdList {
    sorted_ids(a.iter().chain(b.iter()).copied())
}

fn full_bitset(size: usize) -> FixedBitSet {
    let mut all = FixedBitSet::with_capacity(size);
    all.insert_range(..);
    all
}

fn is_concrete(set: &TokenSet) -> bool {
    matches!(set, TokenSet::Sparse { .. } | TokenSet::Dense(_))
}

impl TokenSet {
    pub fn empty() -> Self {
        TokenSet::Empty
    }

    pub fn wildcard() -> Self {
        TokenSet::Any
    }

    pub fn singleton(id: u32) -> Self {
        sparse(sorted_ids([id]), false)
    }

    pub fn from_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        sparse(sorted_ids(ids), false)
    }

    /// Every id except the given ones.
    pub fn all_except(ids: impl IntoIterator<Item = u32>) -> Self {
        sparse(sorted_ids(ids), true)
    }

    pub fn dense(bits: FixedBitSet) -> Self {
        TokenSet::Dense(DenseIds(bits))
    }

    pub fn predicate(pred: TokenPredicate) -> Self {
        TokenSet::Symbolic {
            pred: Arc::new(pred),
            complement: false,
        }
    }

    /// Tokens whose text is a prefix of `s`.
    pub fn from_literal_prefix(s: &str) -> Self {
        if s.is_empty() {
            return TokenSet::Empty;
        }
        Self::predicate(TokenPredicate::PrefixOf(s.to_string()))
    }

    /// Tokens that keep `regex` satisfiable, `regex` being the derivative by the text so far.
    pub fn from_regex_tail(regex: &Regex) -> Self {
        if regex.is_nothing() {
            return TokenSet::Empty;
        }
        Self::predicate(TokenPredicate::RegexAlive(regex.clone()))
    }

    pub fn complement(&self) -> Self {
        match self {
            TokenSet::Empty => TokenSet::Any,
            TokenSet::Any => TokenSet::Empty,
            TokenSet::Sparse { ids, complement } => sparse(ids.clone(), !complement),
            TokenSet::Dense(bits) => {
                let mut all = full_bitset(bits.0.len());
                all.difference_with(&bits.0);
                TokenSet::dense(all)
            }
            TokenSet::Symbolic { pred, complement } => TokenSet::Symbolic {
                pred: pred.clone(),
                complement: !complement,
            },
            TokenSet::Intersection(items) => {
                Self::union_all(items.iter().map(|x| x.complement()).collect())
            }
            TokenSet::Union(items) => {
                Self::intersect_all(items.iter().map(|x| x.complement()).collect())
            }
        }
    }

    pub fn union(&self, other: &TokenSet) -> Self {
        Self::union_all(vec![self.clone(), other.clone()])
    }

    pub fn intersect(&self, other: &TokenSet) -> Self {
        Self::intersect_all(vec![self.clone(), other.clone()])
    }

    pub fn setminus(&self, other: &TokenSet) -> Self {
        self.intersect(&other.complement())
    }

    /// Whether the set is empty without looking at the vocabulary.
    ///
    /// `false` only means emptiness could not be decided structurally.
    pub fn is_trivially_empty(&self) -> bool {
        matches!(self, TokenSet::Empty)
            || matches!(self, TokenSet::Dense(bits) if bits.0.ones().next().is_none())
    }

    /// Whether the set has no member in the vocabulary of `materialiser`.
    pub fn is_empty(&self, materialiser: &Materialiser) -> bool {
        self.is_trivially_empty() || self.materialise(materialiser).ones().next().is_none()
    }

    pub fn intersect_all(items: Vec<TokenSet>) -> Self {
        let mut flat = Vec::with_capacity(items.len());
        for item in items {
            match item {
                TokenSet::Empty => return TokenSet::Empty,
                TokenSet::Any => {}
                TokenSet::Intersection(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        let (concrete, mut lazy): (Vec<_>, Vec<_>) = flat.into_iter().partition(is_concrete);
        if let Some(folded) = concrete.into_iter().reduce(|a, b| concrete_intersect(&a, &b)) {
            match folded {
                TokenSet::Empty => return TokenSet::Empty,
                TokenSet::Any => {}
                x => lazy.push(x),
            }
        }
        lazy.sort_unstable();
        lazy.dedup();
        if has_complementary_pair(&lazy) {
            return TokenSet::Empty;
        }
        match lazy.len() {
            0 => TokenSet::Any,
            1 => lazy.pop().unwrap_or(TokenSet::Any),
            _ => TokenSet::Intersection(lazy),
        }
    }

    pub fn union_all(items: Vec<TokenSet>) -> Self {
        let mut flat = Vec::with_capacity(items.len());
        for item in items {
            match item {
                TokenSet::Any => return TokenSet::Any,
                TokenSet::Empty => {}
                TokenSet::Union(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        let (concrete, mut lazy): (Vec<_>, Vec<_>) = flat.into_iter().partition(is_concrete);
        if let Some(folded) = concrete.into_iter().reduce(|a, b| concrete_union(&a, &b)) {
            match folded {
                TokenSet::Any => return TokenSet::Any,
                TokenSet::Empty => {}
                x => lazy.push(x),
            }
        }
        lazy.sort_unstable();
        lazy.dedup();
        if has_complementary_pair(&lazy) {
            return TokenSet::Any;
        }
        match lazy.len() {
            0 => TokenSet::Empty,
            1 => lazy.pop().unwrap_or(TokenSet::Empty),
            _ => TokenSet::Union(lazy),
        }
    }

    /// Materialises the set into a bitset of length `materialiser.size()`.
    pub fn materialise(&self, materialiser: &Materialiser) -> FixedBitSet {
        let size = materialiser.size();
        match self {
            TokenSet::Empty => FixedBitSet::with_capacity(size),
            TokenSet::Any => full_bitset(size),
            TokenSet::Sparse { ids, complement } => {
                let mut bits = FixedBitSet::with_capacity(size);
                for &id in ids.iter().filter(|id| (**id as usize) < size) {
                    bits.insert(id as usize);
                }
                if *complement {
                    let mut all = full_bitset(size);
                    all.difference_with(&bits);
                    all
                } else {
                    bits
                }
            }
            TokenSet::Dense(dense) => {
                let mut bits = FixedBitSet::with_capacity(size);
                for id in dense.0.ones().filter(|id| *id < size) {
                    bits.insert(id);
                }
                bits
            }
            TokenSet::Symbolic { pred, complement } => {
                let matched = materialiser.predicate(pred);
                if *complement {
                    let mut all = full_bitset(size);
                    all.difference_with(&matched);
                    all
                } else {
                    (*matched).clone()
                }
            }
            TokenSet::Intersection(items) => {
                let mut bits = full_bitset(size);
                for item in items {
                    bits.intersect_with(&item.materialise(materialiser));
                }
                bits
            }
            TokenSet::Union(items) => {
                let mut bits = FixedBitSet::with_capacity(size);
                for item in items {
                    bits.union_with(&item.materialise(materialiser));
                }
                bits
            }
        }
    }
}

fn has_complementary_pair(items: &[TokenSet]) -> bool {
    items.iter().any(|x| match x {
        TokenSet::Symbolic {
            pred,
            complement: false,
        } => items.iter().any(|y| {
            matches!(y, TokenSet::Symbolic { pred: p, complement: true } if p == pred)
        }),
        _ => false,
    })
}

fn dense_with(bits: &FixedBitSet, ids: &IdList) -> FixedBitSet {
    let mut bits = bits.clone();
    if let Some(max) = ids.last() {
        if *max as usize >= bits.len() {
            bits.grow(*max as usize + 1);
        }
    }
    for id in ids.iter() {
        bits.insert(*id as usize);
    }
    bits
}

fn dense_without(bits: &FixedBitSet, ids: &IdList) -> FixedBitSet {
    let mut bits = bits.clone();
    let len = bits.len();
    for id in ids.iter().filter(|id| (**id as usize) < len) {
        bits.set(*id as usize, false);
    }
    bits
}

fn concrete_intersect(a: &TokenSet, b: &TokenSet) -> TokenSet {
    use TokenSet::{Dense, Sparse};
    match (a, b) {
        (
            Sparse {
                ids: x,
                complement: cx,
            },
            Sparse {
                ids: y,
                complement: cy,
            },
        ) => match (cx, cy) {
            (false, false) => sparse(ids_intersection(x, y), false),
            (false, true) => sparse(ids_difference(x, y), false),
            (true, false) => sparse(ids_difference(y, x), false),
            (true, true) => sparse(ids_union(x, y), true),
        },
        (Sparse { ids, complement }, Dense(d)) | (Dense(d), Sparse { ids, complement }) => {
            if *complement {
                TokenSet::dense(dense_without(&d.0, ids))
            } else {
                sparse(
                    ids.iter()
                        .copied()
                        .filter(|id| (*id as usize) < d.0.len() && d.0.contains(*id as usize))
                        .collect(),
                    false,
                )
            }
        }
        (Dense(x), Dense(y)) => {
            let mut bits = x.0.clone();
            bits.intersect_with(&y.0);
            TokenSet::dense(bits)
        }
        _ => TokenSet::intersect_all(vec![a.clone(), b.clone()]),
    }
}

fn concrete_union(a: &TokenSet, b: &TokenSet) -> TokenSet {
    use TokenSet::{Dense, Sparse};
    match (a, b) {
        (
            Sparse {
                ids: x,
                complement: cx,
            },
            Sparse {
                ids: y,
                complement: cy,
            },
        ) => match (cx, cy) {
            (false, false) => sparse(ids_union(x, y), false),
            (false, true) => sparse(ids_difference(y, x), true),
            (true, false) => sparse(ids_difference(x, y), true),
            (true, true) => sparse(ids_intersection(x, y), true),
        },
        (Sparse { ids, complement }, Dense(d)) | (Dense(d), Sparse { ids, complement }) => {
            if *complement {
                sparse(
                    ids.iter()
                        .copied()
                        .filter(|id| (*id as usize) >= d.0.len() || !d.0.contains(*id as usize))
                        .collect(),
                    true,
                )
            } else {
                TokenSet::dense(dense_with(&d.0, ids))
            }
        }
        (Dense(x), Dense(y)) => {
            let mut bits = x.0.clone();
            if y.0.len() > bits.len() {
                bits.grow(y.0.len());
            }
            bits.union_with(&y.0);
            TokenSet::dense(bits)
        }
        _ => TokenSet::union_all(vec![a.clone(), b.clone()]),
    }
}

impl Display for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSet::Empty => f.write_str("{}"),
            TokenSet::Any => f.write_str("*"),
            TokenSet::Sparse { ids, complement } => {
                let ids: Vec<String> = ids.iter().map(|x| x.to_string()).collect();
                if *complement {
                    write!(f, "*\\{{{}}}", ids.join(", "))
                } else {
                    write!(f, "{{{}}}", ids.join(", "))
                }
            }
            TokenSet::Dense(bits) => write!(f, "{:?}", bits),
            TokenSet::Symbolic { pred, complement } => {
                if *complement {
                    write!(f, "!{}", pred)
                } else {
                    write!(f, "{}", pred)
                }
            }
            TokenSet::Intersection(items) | TokenSet::Union(items) => {
                let sep = if matches!(self, TokenSet::Intersection(_)) {
                    " & "
                } else {
                    " | "
                };
                let items: Vec<String> = items.iter().map(|x| x.to_string()).collect();
                write!(f, "({})", items.join(sep))
            }
        }
    }
}

/// Process-wide caches shared by every query run: interned regex derivatives and
/// materialised predicates keyed by `(tokenizer id, predicate)`.
#[derive(Debug, Default)]
pub struct TokenSetCache {
    materialised: RwLock<AHashMap<(String, Arc<TokenPredicate>), Arc<FixedBitSet>>>,
    derivatives: RwLock<DerivativeCache>,
}

impl TokenSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with exclusive access to the derivative cache.
    pub fn with_derivatives<T>(&self, f: impl FnOnce(&mut DerivativeCache) -> T) -> T {
        let mut guard = self
            .derivatives
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Number of materialised predicates.
    pub fn len(&self) -> usize {
        self.materialised
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, key: &(String, Arc<TokenPredicate>)) -> Option<Arc<FixedBitSet>> {
        self.materialised
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn insert(&self, key: (String, Arc<TokenPredicate>), bits: Arc<FixedBitSet>) {
        self.materialised
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, bits);
    }
}

/// Turns token sets into bitsets over one tokenizer's vocabulary.
pub struct Materialiser<'a> {
    tokenizer: &'a dyn Tokenizer,
    cache: &'a TokenSetCache,
}

impl<'a> Materialiser<'a> {
    pub fn new(tokenizer: &'a dyn Tokenizer, cache: &'a TokenSetCache) -> Self {
        Self { tokenizer, cache }
    }

    /// Length of materialised bitsets, reserved tag ids included.
    pub fn size(&self) -> usize {
        self.tokenizer.vocab_size()
    }

    pub fn tokenizer(&self) -> &'a dyn Tokenizer {
        self.tokenizer
    }

    /// The tokens matching `pred`. EOS never matches a predicate.
    pub fn predicate(&self, pred: &Arc<TokenPredicate>) -> Arc<FixedBitSet> {
        let key = (self.tokenizer.identifier().to_string(), pred.clone());
        if let Some(bits) = self.cache.get(&key) {
            return bits;
        }
        let mut bits = self.compute(pred);
        let eos = self.tokenizer.eos_token_id() as usize;
        if eos < bits.len() {
            bits.set(eos, false);
        }
        let bits = Arc::new(bits);
        log::debug!(
            "Materialised {} for {}: {} tokens.",
            pred,
            self.tokenizer.identifier(),
            bits.count_ones(..)
        );
        self.cache.insert(key, bits.clone());
        bits
    }

    fn compute(&self, pred: &TokenPredicate) -> FixedBitSet {
        let vocabulary = self.tokenizer.vocabulary();
        let trie = vocabulary.trie();
        let mut bits = FixedBitSet::with_capacity(self.size());
        match pred {
            TokenPredicate::PrefixOf(s) => insert_prefixes_of(trie, s, &mut bits),
            TokenPredicate::StaysWithin { prefix, haystack } => {
                for start in 0..=haystack.len() {
                    if !haystack.is_char_boundary(start) {
                        continue;
                    }
                    if let Some(rest) = haystack[start..].strip_prefix(prefix.as_str()) {
                        insert_prefixes_of(trie, rest, &mut bits);
                    }
                }
            }
            TokenPredicate::OneOf(options) => {
                for option in options {
                    if let Some(node) = walk(trie, option) {
                        for id in trie.node(node).token_ids() {
                            bits.insert(id as usize);
                        }
                    }
                }
            }
            TokenPredicate::StartsWith(s) => {
                // only tokens sharing the first byte can start with `s`
                match s.as_bytes().first() {
                    Some(&first) => {
                        for id in vocabulary.token_ids_starting_with(first).ones() {
                            if let Some(text) = vocabulary.token_text(id as u32) {
                                if text.starts_with(s.as_str()) {
                                    bits.insert(id);
                                }
                            }
                        }
                    }
                    None => {
                        for (id, _) in vocabulary.texts() {
                            bits.insert(id as usize);
                        }
                    }
                }
            }
            TokenPredicate::RegexAlive(regex) | TokenPredicate::RegexAccepts(regex) => {
                let accepting = matches!(pred, TokenPredicate::RegexAccepts(_));
                self.cache.with_derivatives(|derivatives| {
                    let start = derivatives.intern_regex(regex);
                    let mut stack = vec![(TokenTrie::ROOT, start)];
                    while let Some((node, state)) = stack.pop() {
                        for &(c, next) in trie.node(node).children.iter() {
                            let next_state = derivatives.step(state, c);
                            if derivatives.is_dead(next_state) {
                                continue;
                            }
                            if !accepting || derivatives.nullable(next_state) {
                                for id in trie.node(next).token_ids() {
                                    bits.insert(id as usize);
                                }
                            }
                            stack.push((next, next_state));
                        }
                    }
                });
            }
            TokenPredicate::CompletesSubstring { .. } | TokenPredicate::Measure { .. } => {
                self.cache.with_derivatives(|derivatives| {
                    for (id, text) in vocabulary.texts() {
                        if pred.matches(text, derivatives) {
                            bits.insert(id as usize);
                        }
                    }
                });
            }
        }
        bits
    }
}

/// Inserts every token whose text is a non-empty prefix of `s`.
fn insert_prefixes_of(trie: &TokenTrie, s: &str, bits: &mut FixedBitSet) {
    let mut node = TokenTrie::ROOT;
    for c in s.chars() {
        match child(trie, node, c) {
            Some(next) => node = next,
            None => break,
        }
        for id in trie.node(node).token_ids() {
            bits.insert(id as usize);
        }
    }
}

fn child(trie: &TokenTrie, node: u32, c: char) -> Option<u32> {
    let children = &trie.node(node).children;
    children
        .binary_search_by_key(&c, |(k, _)| *k)
        .ok()
        .map(|i| children[i].1)
}

fn walk(trie: &TokenTrie, s: &str) -> Option<u32> {
    s.chars().try_fold(TokenTrie::ROOT, |node, c| child(trie, node, c))
}
