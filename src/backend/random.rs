//! A deterministic backend whose logits are a pure function of the seed and the input ids.
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use fixedbitset_stack::FixedBitSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{BackendError, GenerateOutput, GenerateRequest, ModelBackend};
use crate::config::BackendConfig;
use crate::decoding::head::unpad;
use crate::decoding::sampling::{argmax, log_softmax, sample};
use crate::query::KeywordArgs;
use crate::tokenizer::{Tokenizer, VocabTokenizer};
use crate::vocabulary::{Token, Vocabulary};

/// The logit of tokens the backend never prefers: EOS, reserved tags and partial UTF-8.
const LOW_LOGIT: f32 = -10.0;

/// The text of the end-of-sequence token of the demo vocabulary.
pub const DEMO_EOS: &str = "</s>";

/// A backend for tests and demos that draws logits from a `StdRng` seeded by the
/// seed and the input ids.
#[derive(Debug)]
pub struct RandomBackend {
    identifier: String,
    seed: u64,
    tokenizer: Arc<dyn Tokenizer>,
    low: FixedBitSet,
}

impl RandomBackend {
    /// The built-in vocabulary: printable ASCII, `\n`, `\t`, byte-fallback tokens for
    /// `0x80..=0xFF` and `</s>`.
    pub fn demo_vocabulary() -> Result<Vocabulary, BackendError> {
        let mut id_to_token = AHashMap::default();
        let mut id_to_token_string = AHashMap::default();
        let mut add = |bytes: Vec<u8>, display: String| {
            let id = id_to_token.len() as u32;
            id_to_token.insert(id, Token(bytes.into_boxed_slice()));
            id_to_token_string.insert(id, display);
        };
        for byte in 0x20u8..=0x7E {
            add(vec![byte], (byte as char).to_string());
        }
        add(b"\n".to_vec(), "\n".to_string());
        add(b"\t".to_vec(), "\t".to_string());
        for byte in 0x80u8..=0xFF {
            add(vec![byte], format!("<0x{:02X}>", byte));
        }
        add(DEMO_EOS.as_bytes().to_vec(), DEMO_EOS.to_string());
        Ok(Vocabulary::new(id_to_token, id_to_token_string)?)
    }

    /// A backend over the demo vocabulary.
    pub fn new(seed: u64) -> Result<Self, BackendError> {
        let identifier = format!("random(seed={})", seed);
        Self::with_vocabulary(identifier, seed, Arc::new(Self::demo_vocabulary()?), DEMO_EOS)
    }

    /// A backend over `vocabulary`, whose token with text `eos` ends sequences.
    pub fn with_vocabulary(
        identifier: String,
        seed: u64,
        vocabulary: Arc<Vocabulary>,
        eos: &str,
    ) -> Result<Self, BackendError> {
        let eos_id = vocabulary
            .token_id_of_text(eos)
            .ok_or_else(|| BackendError::InvalidArgument {
                model: identifier.clone(),
                key: "eos".to_string(),
                message: format!("{:?} is not a token of the vocabulary", eos),
            })?;
        let natural_size = vocabulary.vocab_size();
        let tokenizer = VocabTokenizer::new(
            format!("{}:{}", identifier, natural_size),
            vocabulary.clone(),
            eos_id,
            None,
        );
        let size = tokenizer.vocab_size();
        let mut low = FixedBitSet::with_capacity(size);
        low.insert_range(natural_size..);
        low.insert(eos_id as usize);
        for id in 0..natural_size as u32 {
            match vocabulary.token(id) {
                Some(token) if std::str::from_utf8(&token.0).is_ok() => {}
                _ => low.insert(id as usize),
            }
        }
        Ok(Self {
            identifier,
            seed,
            tokenizer: Arc::new(tokenizer),
            low,
        })
    }

    /// The constructor registered for the `random` prefix. Arguments: `seed`, `vocab` (a
    /// JSON vocabulary file) and `eos` (the text of its end-of-sequence token).
    pub fn construct(
        spec: &str,
        args: &KeywordArgs,
        _config: &BackendConfig,
    ) -> Result<Arc<dyn ModelBackend>, BackendError> {
        let invalid = |key: &str, message: &str| BackendError::InvalidArgument {
            model: spec.to_string(),
            key: key.to_string(),
            message: message.to_string(),
        };
        let seed = match args.get("seed") {
            None => 0,
            Some(seed) => seed
                .as_u64()
                .ok_or_else(|| invalid("seed", "expected a non-negative integer"))?,
        };
        let vocabulary = match args.get("vocab") {
            None => Self::demo_vocabulary()?,
            Some(path) => {
                let path = path
                    .as_str()
                    .ok_or_else(|| invalid("vocab", "expected a file name"))?;
                Vocabulary::from_json_file(path)?
            }
        };
        let eos = match args.get("eos") {
            None => DEMO_EOS,
            Some(eos) => eos.as_str().ok_or_else(|| invalid("eos", "expected a string"))?,
        };
        Ok(Arc::new(Self::with_vocabulary(
            spec.to_string(),
            seed,
            Arc::new(vocabulary),
            eos,
        )?))
    }

    fn rng_for(&self, input_ids: &[u32]) -> StdRng {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ self.seed;
        for id in input_ids {
            hash ^= *id as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        StdRng::seed_from_u64(hash)
    }

    /// The next-token logits after `input_ids`.
    pub fn logits(&self, input_ids: &[u32]) -> Vec<f32> {
        let mut rng = self.rng_for(input_ids);
        (0..self.tokenizer.vocab_size())
            .map(|id| {
                let x: f32 = rng.gen_range(-3.0..3.0);
                if self.low.contains(id) {
                    LOW_LOGIT
                } else {
                    x
                }
            })
            .collect()
    }
}

#[async_trait]
impl ModelBackend for RandomBackend {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn tokenizer(&self) -> Arc<dyn Tokenizer> {
        self.tokenizer.clone()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateOutput, BackendError> {
        if request.input_ids.len() != request.attention_mask.len() {
            return Err(BackendError::Protocol(format!(
                "{} rows but {} attention masks",
                request.input_ids.len(),
                request.attention_mask.len()
            )));
        }
        let eos = self.tokenizer.eos_token_id();
        let mut output = GenerateOutput::default();
        for (row, (ids, mask)) in request
            .input_ids
            .iter()
            .zip(&request.attention_mask)
            .enumerate()
        {
            let mut ids = unpad(ids, mask).to_vec();
            let prompt_len = ids.len();
            let mut scores = Vec::with_capacity(request.max_new_tokens);
            for step in 0..request.max_new_tokens {
                let mut logits = self.logits(&ids);
                if step == 0 {
                    if let Some(Some(bias)) = request.bias.get(row) {
                        bias.apply(&mut logits);
                    }
                }
                let token = if request.temperature <= 0.0 {
                    argmax(&logits)
                } else {
                    sample(&logits, request.temperature, None, &mut self.rng_for(&ids))
                };
                scores.push(logits);
                let Some(token) = token else {
                    break;
                };
                ids.push(token);
                if let Some(streamer) = &request.streamer {
                    streamer.put(row, token);
                }
                if token == eos {
                    break;
                }
            }
            output.sequences.push(ids.split_off(prompt_len));
            output.scores.push(scores);
        }
        if let Some(streamer) = &request.streamer {
            streamer.end();
        }
        Ok(output)
    }

    async fn score(
        &self,
        input_ids: Vec<Vec<u32>>,
        attention_mask: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<f32>>, BackendError> {
        Ok(input_ids
            .iter()
            .zip(&attention_mask)
            .map(|(ids, mask)| {
                let ids = unpad(ids, mask);
                (0..ids.len())
                    .map(|i| match i {
                        0 => 0.0,
                        _ => log_softmax(&self.logits(&ids[..i]))[ids[i] as usize],
                    })
                    .collect()
            })
            .collect())
    }

    fn max_batch_size(&self) -> usize {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logits_are_a_function_of_the_input() {
        let backend = RandomBackend::new(123).ok();
        let backend = backend.as_ref();
        let a = backend.map(|b| b.logits(&[1, 2, 3]));
        let b = backend.map(|b| b.logits(&[1, 2, 3]));
        let c = backend.map(|b| b.logits(&[1, 2, 4]));
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn demo_vocabulary_round_trips_ascii() {
        let backend = RandomBackend::new(0).ok();
        let tokenizer = backend.map(|b| b.tokenizer());
        let Some(tokenizer) = tokenizer else {
            panic!("demo backend could not be created");
        };
        let ids = tokenizer.tokenize("Hello,\tworld!\n");
        assert_eq!(ids.len(), 14);
        assert_eq!(tokenizer.decode(&ids), "Hello,\tworld!\n");
        assert_eq!(tokenizer.eos_token_id(), 225);
    }

    #[tokio::test]
    async fn eos_is_never_preferred() {
        let backend = RandomBackend::new(123).ok();
        let Some(backend) = backend else {
            panic!("demo backend could not be created");
        };
        let ids = backend.tokenizer().tokenize("Hello");
        let output = backend
            .generate(GenerateRequest {
                input_ids: vec![ids.clone()],
                attention_mask: vec![vec![1; ids.len()]],
                temperature: 0.0,
                max_new_tokens: 4,
                bias: vec![None],
                streamer: None,
            })
            .await;
        let Ok(output) = output else {
            panic!("generation failed");
        };
        assert_eq!(output.sequences[0].len(), 4);
        assert!(!output.sequences[0].contains(&225));
    }
}
