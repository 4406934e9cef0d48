//! The tokenizer contract and a greedy longest-match tokenizer over a [`Vocabulary`].
use std::fmt::Debug;
use std::sync::Arc;

use crate::vocabulary::{Token, TokenTrie, Vocabulary};

/// Roles that can be emitted as reserved tag tokens (`<lmql:ROLE/>`).
pub const SPECIAL_ROLES: [&str; 3] = ["system", "user", "assistant"];

/// Returns the textual form of a reserved role tag.
pub fn role_tag(role: &str) -> String {
    format!("<lmql:{}/>", role)
}

/// The contract every tokenizer used by the runtime implements.
pub trait Tokenizer: Send + Sync + Debug {
    /// A stable identifier. Two tokenizers with the same identifier produce the same ids.
    fn identifier(&self) -> &str;
    /// Tokenizes text into token ids.
    fn tokenize(&self, text: &str) -> Vec<u32>;
    /// Decodes token ids into text.
    fn decode(&self, ids: &[u32]) -> String {
        self.convert_bytes_to_string(&self.decode_tokens_bytes(ids))
    }
    /// Losslessly decodes each token into its bytes.
    fn decode_tokens_bytes(&self, ids: &[u32]) -> Vec<Vec<u8>>;
    /// Joins per-token bytes into text.
    fn convert_bytes_to_string(&self, bytes: &[Vec<u8>]) -> String {
        let joined: Vec<u8> = bytes.iter().flatten().copied().collect();
        String::from_utf8_lossy(&joined).into_owned()
    }
    /// The underlying vocabulary.
    fn vocabulary(&self) -> &Arc<Vocabulary>;
    /// One greater than the highest id in use, reserved tag ids included.
    fn vocab_size(&self) -> usize;
    /// The beginning-of-sequence token, if the model uses one.
    fn bos_token_id(&self) -> Option<u32>;
    /// The end-of-sequence token.
    fn eos_token_id(&self) -> u32;
    /// The reserved id of a role tag, if the role is known.
    fn special_tag_id(&self, role: &str) -> Option<u32>;
}

/// A tokenizer that segments text greedily by the longest matching token.
///
/// Characters without a matching token fall back to single-byte tokens when the
/// vocabulary has them and are dropped otherwise.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    identifier: String,
    vocabulary: Arc<Vocabulary>,
    eos_token_id: u32,
    bos_token_id: Option<u32>,
    natural_size: usize,
}

impl VocabTokenizer {
    /// Creates a tokenizer. `eos_token_id` must be an id of `vocabulary`.
    pub fn new(
        identifier: impl Into<String>,
        vocabulary: Arc<Vocabulary>,
        eos_token_id: u32,
        bos_token_id: Option<u32>,
    ) -> Self {
        let natural_size = vocabulary.vocab_size();
        Self {
            identifier: identifier.into(),
            vocabulary,
            eos_token_id,
            bos_token_id,
            natural_size,
        }
    }

    fn longest_match(&self, text: &str) -> Option<(u32, usize)> {
        let trie: &TokenTrie = self.vocabulary.trie();
        let mut node = TokenTrie::ROOT;
        let mut best = None;
        for (offset, c) in text.char_indices() {
            let children = &trie.node(node).children;
            match children.binary_search_by_key(&c, |(k, _)| *k) {
                Ok(i) => node = children[i].1,
                Err(_) => break,
            }
            let end = offset + c.len_utf8();
            if let Some(id) = trie.node(node).token_ids().find(|id| *id != self.eos_token_id) {
                // lossy texts may not round-trip, only accept exact byte matches
                if self.vocabulary.token(id).map(|t| &t.0[..]) == Some(text[..end].as_bytes()) {
                    best = Some((id, end));
                }
            }
        }
        best
    }

    fn special_prefix(&self, text: &str) -> Option<(u32, usize)> {
        if !text.starts_with("<lmql:") {
            return None;
        }
        SPECIAL_ROLES.iter().enumerate().find_map(|(i, role)| {
            let tag = role_tag(role);
            text.starts_with(&tag)
                .then(|| ((self.natural_size + i) as u32, tag.len()))
        })
    }
}

impl Tokenizer for VocabTokenizer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn tokenize(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            if let Some((id, len)) = self
                .special_prefix(rest)
                .or_else(|| self.longest_match(rest))
            {
                ids.push(id);
                rest = &rest[len..];
                continue;
            }
            let c = rest.chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            for &byte in rest[..c].as_bytes() {
                match self.vocabulary.token_id(&Token(vec![byte].into_boxed_slice())) {
                    Some(id) => ids.push(id),
                    None => log::warn!(
                        "Byte {:#04x} of {:?} has no token in vocabulary {}; it is dropped.",
                        byte,
                        &rest[..c],
                        self.identifier
                    ),
                }
            }
            rest = &rest[c..];
        }
        ids
    }

    fn decode_tokens_bytes(&self, ids: &[u32]) -> Vec<Vec<u8>> {
        ids.iter()
            .map(|&id| {
                if id == self.eos_token_id {
                    return Vec::new();
                }
                if let Some(token) = self.vocabulary.token(id) {
                    return token.0.to_vec();
                }
                let index = (id as usize).wrapping_sub(self.natural_size);
                SPECIAL_ROLES
                    .get(index)
                    .map(|role| role_tag(role).into_bytes())
                    .unwrap_or_default()
            })
            .collect()
    }

    fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    fn vocab_size(&self) -> usize {
        self.natural_size + SPECIAL_ROLES.len()
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn special_tag_id(&self, role: &str) -> Option<u32> {
        SPECIAL_ROLES
            .iter()
            .position(|r| *r == role)
            .map(|i| (self.natural_size + i) as u32)
    }
}
