//! Memoised derivatives and dead-prefix blocklists.
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use super::{Regex, RegexNode};

/// An interned regex derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) u32);

/// Interns regex derivatives and memoises single-character steps between them.
///
/// A [`StateId`] is only meaningful for the cache that produced it.
#[derive(Debug)]
pub struct DerivativeCache {
    states: Vec<RegexNode>,
    nullable: Vec<bool>,
    index: AHashMap<RegexNode, StateId>,
    transitions: AHashMap<(StateId, char), StateId>,
    dead_prefixes: AHashMap<Regex, DeadPrefixTrie>,
    /// Tries loaded from disk that were not claimed by a regex yet, keyed by display form.
    pending_dead_prefixes: AHashMap<String, DeadPrefixTrie>,
}

impl Default for DerivativeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DerivativeCache {
    /// The state of [`RegexNode::Nothing`].
    pub const NOTHING: StateId = StateId(0);

    pub fn new() -> Self {
        let mut cache = Self {
            states: Vec::new(),
            nullable: Vec::new(),
            index: AHashMap::default(),
            transitions: AHashMap::default(),
            dead_prefixes: AHashMap::default(),
            pending_dead_prefixes: AHashMap::default(),
        };
        cache.intern(&RegexNode::Nothing);
        cache
    }

    pub fn intern(&mut self, node: &RegexNode) -> StateId {
        if let Some(id) = self.index.get(node) {
            return *id;
        }
        let id = StateId(self.states.len() as u32);
        self.states.push(node.clone());
        self.nullable.push(node.nullable());
        self.index.insert(node.clone(), id);
        id
    }

    pub fn intern_regex(&mut self, regex: &Regex) -> StateId {
        self.intern(regex.node())
    }

    /// The derivative of `state` by `c`.
    pub fn step(&mut self, state: StateId, c: char) -> StateId {
        if state == Self::NOTHING {
            return state;
        }
        if let Some(next) = self.transitions.get(&(state, c)) {
            return *next;
        }
        let derived = self.states[state.0 as usize].derive(c);
        let next = self.intern(&derived);
        self.transitions.insert((state, c), next);
        next
    }

    /// The derivative of `state` by every character of `s`, stopping early at [`Self::NOTHING`].
    pub fn walk(&mut self, mut state: StateId, s: &str) -> StateId {
        for c in s.chars() {
            state = self.step(state, c);
            if state == Self::NOTHING {
                break;
            }
        }
        state
    }

    pub fn nullable(&self, state: StateId) -> bool {
        self.nullable[state.0 as usize]
    }

    pub fn is_dead(&self, state: StateId) -> bool {
        state == Self::NOTHING
    }

    pub fn regex(&self, state: StateId) -> Regex {
        Regex::from_node(self.states[state.0 as usize].clone())
    }

    /// Number of interned states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Whether `text` can still be extended into a full match of `root`.
    ///
    /// Prefixes found to be dead are remembered per root regex, so repeated queries
    /// on the same generation short-circuit.
    pub fn is_viable(&mut self, root: &Regex, text: &str) -> bool {
        if !self.dead_prefixes.contains_key(root) {
            let trie = self
                .pending_dead_prefixes
                .remove(&root.to_string())
                .unwrap_or_default();
            self.dead_prefixes.insert(root.clone(), trie);
        }
        if self
            .dead_prefixes
            .get(root)
            .is_some_and(|trie| trie.has_dead_prefix(text))
        {
            return false;
        }
        let mut state = self.intern_regex(root);
        for (offset, c) in text.char_indices() {
            state = self.step(state, c);
            if state == Self::NOTHING {
                let end = offset + c.len_utf8();
                if let Some(trie) = self.dead_prefixes.get_mut(root) {
                    trie.insert(&text[..end]);
                }
                return false;
            }
        }
        true
    }

    /// Whether `text` fully matches `root`.
    pub fn fullmatch(&mut self, root: &Regex, text: &str) -> bool {
        let state = self.intern_regex(root);
        let end = self.walk(state, text);
        self.nullable(end)
    }

    /// Every non-empty dead-prefix trie, keyed by the display form of its root regex.
    pub fn export_dead_prefixes(&self) -> Vec<(String, DeadPrefixTrie)> {
        let mut tries: Vec<_> = self
            .dead_prefixes
            .iter()
            .filter(|(_, trie)| !trie.is_empty())
            .map(|(regex, trie)| (regex.to_string(), trie.clone()))
            .chain(
                self.pending_dead_prefixes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            )
            .collect();
        tries.sort_by(|a, b| a.0.cmp(&b.0));
        tries
    }

    pub fn import_dead_prefixes(&mut self, tries: impl IntoIterator<Item = (String, DeadPrefixTrie)>) {
        self.pending_dead_prefixes.extend(tries);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct DeadNode {
    children: Vec<(char, u32)>,
    dead: bool,
}

/// A trie of prefixes after which a regex can no longer match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadPrefixTrie {
    nodes: Vec<DeadNode>,
}

impl Default for DeadPrefixTrie {
    fn default() -> Self {
        Self {
            nodes: vec![DeadNode::default()],
        }
    }
}

impl DeadPrefixTrie {
    pub fn insert(&mut self, prefix: &str) {
        let mut node = 0usize;
        for c in prefix.chars() {
            if self.nodes[node].dead {
                return;
            }
            let children = &self.nodes[node].children;
            node = match children.binary_search_by_key(&c, |(k, _)| *k) {
                Ok(i) => children[i].1 as usize,
                Err(i) => {
                    let next = self.nodes.len();
                    self.nodes.push(DeadNode::default());
                    self.nodes[node].children.insert(i, (c, next as u32));
                    next
                }
            };
        }
        self.nodes[node].dead = true;
    }

    /// Whether some prefix of `s`, `s` included, is dead.
    pub fn has_dead_prefix(&self, s: &str) -> bool {
        let mut node = 0usize;
        for c in s.chars() {
            let children = &self.nodes[node].children;
            match children.binary_search_by_key(&c, |(k, _)| *k) {
                Ok(i) => node = children[i].1 as usize,
                Err(_) => return false,
            }
            if self.nodes[node].dead {
                return true;
            }
        }
        false
    }

    /// Whether no dead prefix is recorded.
    pub fn is_empty(&self) -> bool {
        !self.nodes.iter().any(|x| x.dead)
    }
}
