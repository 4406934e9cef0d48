//! This module contains the `Vocabulary` struct, which represents a language model's vocabulary.
use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;
use nonmax::NonMaxU32;
use serde::{Deserialize, Serialize};
use std::array;
use std::collections::hash_map::Entry;
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::utils;
use crate::utils::ByteSet;

/// A wrapper struct that represents a token in bytes in a language model's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Token(pub Box<[u8]>);

impl Token {
    /// Creates a token from its UTF-8 text.
    pub fn from_text(text: &str) -> Self {
        Token(text.as_bytes().to_vec().into_boxed_slice())
    }
}

/// A trie over the textual form of every token, walked character by character.
///
/// Shared prefixes between tokens are visited once, which is what makes
/// regex-tail materialisation affordable.
#[derive(Debug, Clone, Default)]
pub struct TokenTrie {
    nodes: Vec<TrieNode>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TrieNode {
    /// Sorted by character.
    pub(crate) children: Vec<(char, u32)>,
    pub(crate) token_id: Option<NonMaxU32>,
    /// Tokens whose lossy text collides with `token_id`'s text.
    pub(crate) aliases: Vec<u32>,
}

impl TokenTrie {
    pub(crate) const ROOT: u32 = 0;

    fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }

    fn insert(&mut self, text: &str, token_id: u32) {
        let mut node = Self::ROOT;
        for c in text.chars() {
            let children = &self.nodes[node as usize].children;
            node = match children.binary_search_by_key(&c, |(k, _)| *k) {
                Ok(i) => children[i].1,
                Err(i) => {
                    let next = self.nodes.len() as u32;
                    self.nodes.push(TrieNode::default());
                    self.nodes[node as usize].children.insert(i, (c, next));
                    next
                }
            };
        }
        let leaf = &mut self.nodes[node as usize];
        match (leaf.token_id, NonMaxU32::new(token_id)) {
            (None, Some(id)) => leaf.token_id = Some(id),
            _ => leaf.aliases.push(token_id),
        }
    }

    pub(crate) fn node(&self, id: u32) -> &TrieNode {
        &self.nodes[id as usize]
    }

    /// Number of nodes in the trie, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the trie only contains its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }
}

impl TrieNode {
    pub(crate) fn token_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.token_id
            .map(|x| x.get())
            .into_iter()
            .chain(self.aliases.iter().copied())
    }
}

/// The struct represents a language model's vocabulary.
#[derive(Clone)]
pub struct Vocabulary {
    pub(crate) token_to_id: AHashMap<Token, u32>,
    pub(crate) id_to_token: AHashMap<u32, Token>,
    pub(crate) id_to_token_string: AHashMap<u32, String>,
    pub(crate) first_byte_to_token_ids: Vec<FixedBitSet>,
    /// Lossy UTF-8 text of every token, indexed by token id.
    pub(crate) id_to_text: Vec<Option<Box<str>>>,
    pub(crate) trie: TokenTrie,
}

impl Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("vocab_size", &self.vocab_size())
            .field(
                "id_to_token_string",
                &utils::get_deterministic_display_form_from_hash_map(
                    &self.id_to_token_string,
                    |(k, v)| (*k, v.clone()),
                ),
            )
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for [Vocabulary] creation.
pub enum CreateVocabularyError {
    /// The vocabulary size exceeds the maximum supported size.
    #[error("The vocabulary size is {0}, while the maximum supported is {1}.")]
    VocabularyTooLarge(usize, usize),
    #[error("IO error: {0}")]
    /// Error due to I/O operations while reading a vocabulary file.
    IoError(#[from] std::io::Error),
    #[error("Serde json error: {0}")]
    /// The vocabulary file is not valid JSON.
    JsonError(#[from] serde_json::Error),
    #[error("Invalid vocabulary entry {0}: {1}")]
    /// An entry of the vocabulary file has an unexpected shape.
    InvalidEntry(String, String),
}

/// The serialized form of a [Vocabulary], used by the on-disk cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyRecord {
    /// `(id, bytes, display string)` triples.
    pub tokens: Vec<(u32, Vec<u8>, String)>,
}

impl Vocabulary {
    /// Creates a new instance of [Vocabulary].
    ///
    /// # Arguments
    ///
    /// * `id_to_token` - A map from token IDs to tokens.
    /// * `id_to_token_string` - A map from token IDs to tokens in UTF-8 String representation.
    ///     This parameter is necessary because a token's UTF-8 representation may not be equivalent to the UTF-8 string decoded from its bytes,
    ///     vice versa. For example, a token may contain `0xFF` byte.
    pub fn new(
        id_to_token: AHashMap<u32, Token>,
        id_to_token_string: AHashMap<u32, String>,
    ) -> Result<Vocabulary, CreateVocabularyError> {
        if id_to_token.len() >= 0x1000000 {
            return Err(CreateVocabularyError::VocabularyTooLarge(
                id_to_token.len(),
                0x1000000,
            ));
        }
        let mut token_to_id = AHashMap::with_capacity(id_to_token.len());
        for (&token_id, token) in id_to_token.iter() {
            match token_to_id.entry(token.clone()) {
                Entry::Occupied(entry) => {
                    log::warn!(
                        "Token ID {} and token ID {} corresponds to the same token. \
                        The second token ID will be ignored when matching tokens to ids. \
                        Seeing this warning likely indicates the vocabulary is not loaded correctly.",
                        entry.get(),
                        token_id
                    );
                }
                Entry::Vacant(entry) => {
                    entry.insert(token_id);
                }
            }
        }
        let vocab_size = id_to_token
            .keys()
            .copied()
            .max()
            .map(|x| x + 1)
            .unwrap_or(0) as usize;
        let mut temp: [Vec<u32>; 256] = array::from_fn(|_| (vec![]));
        let mut id_to_text = vec![None; vocab_size];
        let mut trie = TokenTrie::new();
        let mut ids: Vec<u32> = id_to_token.keys().copied().collect();
        ids.sort_unstable();
        for token_id in ids {
            let token = &id_to_token[&token_id];
            if token.0.is_empty() {
                log::warn!(
                    "Token ID {} corresponds to an empty token. The token will be ignored.",
                    token_id
                );
                continue;
            }
            temp[token.0[0] as usize].push(token_id);
            let text = String::from_utf8_lossy(&token.0);
            trie.insert(&text, token_id);
            id_to_text[token_id as usize] = Some(text.into_owned().into_boxed_str());
        }
        let first_byte_to_token_ids = temp
            .into_iter()
            .map(|tokens| {
                let mut set = FixedBitSet::with_capacity(vocab_size);
                for token_id in tokens {
                    set.insert(token_id as usize);
                }
                set
            })
            .collect();
        Self::check_vocabulary_utf8_support(&token_to_id);
        Ok(Self {
            token_to_id,
            id_to_token,
            id_to_token_string,
            first_byte_to_token_ids,
            id_to_text,
            trie,
        })
    }

    /// Creates a vocabulary from token texts, assigning ids in order.
    pub fn from_strings<'a>(
        tokens: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vocabulary, CreateVocabularyError> {
        let mut id_to_token = AHashMap::default();
        let mut id_to_token_string = AHashMap::default();
        for (id, text) in tokens.into_iter().enumerate() {
            id_to_token.insert(id as u32, Token::from_text(text));
            id_to_token_string.insert(id as u32, text.to_string());
        }
        Self::new(id_to_token, id_to_token_string)
    }

    /// Reads a vocabulary from a JSON file mapping token ids to either strings or byte arrays.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Vocabulary, CreateVocabularyError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let data: serde_json::Map<String, serde_json::Value> = serde_json::from_reader(reader)?;
        let mut id_to_token: AHashMap<u32, Token> = AHashMap::default();
        let mut id_to_token_string: AHashMap<u32, String> = AHashMap::default();
        for (key, value) in data {
            let id = key
                .parse::<u32>()
                .map_err(|e| CreateVocabularyError::InvalidEntry(key.clone(), e.to_string()))?;
            match value {
                serde_json::Value::Array(x) => {
                    let mut token = Vec::with_capacity(x.len());
                    for x in x {
                        let byte = x
                            .as_u64()
                            .filter(|b| *b <= u8::MAX as u64)
                            .ok_or_else(|| {
                                CreateVocabularyError::InvalidEntry(
                                    key.clone(),
                                    format!("{} is not a byte", x),
                                )
                            })?;
                        token.push(byte as u8);
                    }
                    id_to_token_string.insert(id, format!("{:?}", token));
                    id_to_token.insert(id, Token(token.into_boxed_slice()));
                }
                serde_json::Value::String(x) => {
                    id_to_token.insert(id, Token::from_text(&x));
                    id_to_token_string.insert(id, x);
                }
                other => {
                    return Err(CreateVocabularyError::InvalidEntry(
                        key,
                        format!("unexpected value {}", other),
                    ))
                }
            };
        }
        Self::new(id_to_token, id_to_token_string)
    }

    /// Rebuilds a vocabulary from its serialized record.
    pub fn from_record(record: VocabularyRecord) -> Result<Vocabulary, CreateVocabularyError> {
        let mut id_to_token = AHashMap::default();
        let mut id_to_token_string = AHashMap::default();
        for (id, bytes, string) in record.tokens {
            id_to_token.insert(id, Token(bytes.into_boxed_slice()));
            id_to_token_string.insert(id, string);
        }
        Self::new(id_to_token, id_to_token_string)
    }

    /// Serializes the vocabulary into a record with deterministic order.
    pub fn to_record(&self) -> VocabularyRecord {
        let mut tokens: Vec<_> = self
            .id_to_token
            .iter()
            .map(|(id, token)| {
                (
                    *id,
                    token.0.to_vec(),
                    self.id_to_token_string
                        .get(id)
                        .cloned()
                        .unwrap_or_default(),
                )
            })
            .collect();
        tokens.sort_by_key(|x| x.0);
        VocabularyRecord { tokens }
    }

    fn check_vocabulary_utf8_support(token_to_id: &AHashMap<Token, u32>) {
        let mut existing_bytes = ByteSet::with_capacity(256);
        for token in token_to_id.keys() {
            for &byte in token.0.iter() {
                existing_bytes.insert(byte as usize);
            }
        }
        let mut present = [false; 256];
        for byte in existing_bytes.ones() {
            present[byte] = true;
        }
        let missing: Vec<usize> = (32..127usize).filter(|b| !present[*b]).collect();
        if !missing.is_empty() {
            log::warn!(
                "The following printable ASCII bytes are not present in any token: {:?}. \
                Some prompts can not be tokenized losslessly with this vocabulary.",
                missing
            );
        }
    }

    /// Retrieves the token associated with the given token ID.
    pub fn token(&self, token_id: u32) -> Option<&Token> {
        self.id_to_token.get(&token_id)
    }

    /// Retrieves the token string associated with the given token ID.
    pub fn token_string(&self, token_id: u32) -> Option<&str> {
        self.id_to_token_string.get(&token_id).map(|x| x.as_str())
    }

    /// Retrieves the lossy UTF-8 text of the given token ID.
    pub fn token_text(&self, token_id: u32) -> Option<&str> {
        self.id_to_text
            .get(token_id as usize)
            .and_then(|x| x.as_deref())
    }

    /// Iterates over `(token id, text)` pairs of every non-empty token.
    pub fn texts(&self) -> impl Iterator<Item = (u32, &str)> {
        self.id_to_text
            .iter()
            .enumerate()
            .filter_map(|(id, text)| text.as_deref().map(|t| (id as u32, t)))
    }

    /// Token ids whose first byte is `byte`.
    pub fn token_ids_starting_with(&self, byte: u8) -> &FixedBitSet {
        &self.first_byte_to_token_ids[byte as usize]
    }

    /// The trie over token texts.
    pub fn trie(&self) -> &TokenTrie {
        &self.trie
    }
}
impl Vocabulary {
    /// Retrieves the token ID associated with the given token.
    pub fn token_id(&self, token: &Token) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Retrieves the token ID whose bytes equal the given text.
    pub fn token_id_of_text(&self, text: &str) -> Option<u32> {
        self.token_id(&Token::from_text(text))
    }

    /// Retrieves the size of the vocabulary.
    pub fn vocab_size(&self) -> usize {
        self.id_to_text.len()
    }
}
