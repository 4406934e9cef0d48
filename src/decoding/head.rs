//! Decoder heads: in-flight sequences and the only way to mutate them between steps.

/// A single in-flight generation sequence.
///
/// Heads store their ids without padding. Padding and attention masks are built by
/// [`pad_batch`] when a batch is sent to a backend.
#[derive(Debug, Clone)]
pub struct DecoderHead<U> {
    pub id: usize,
    pub input_ids: Vec<u32>,
    /// The token chosen in the last step.
    pub next_token_id: Option<u32>,
    /// The masked logits of the last step.
    pub next_token_logits: Vec<f32>,
    pub next_token_logprob: f32,
    /// Sum of the log-probabilities of all generated tokens.
    pub logprob: f32,
    pub user_data: U,
    pub eos_id: u32,
    /// Length of the prompt the head was created with.
    pub initial_prompt_offset: usize,
    /// Where the current hole starts.
    pub value_offset: usize,
}

/// A mutation of a head between two forward passes.
#[derive(Debug, Clone)]
pub struct RewrittenInputIds<U> {
    pub appended_ids: Vec<u32>,
    /// Drop a trailing EOS before truncating and appending.
    pub strip_eos: bool,
    pub truncate_to: Option<usize>,
    pub user_data: Option<U>,
    pub value_offset: Option<usize>,
}

impl<U> Default for RewrittenInputIds<U> {
    fn default() -> Self {
        Self {
            appended_ids: Vec::new(),
            strip_eos: false,
            truncate_to: None,
            user_data: None,
            value_offset: None,
        }
    }
}

impl<U> RewrittenInputIds<U> {
    pub fn append(ids: Vec<u32>) -> Self {
        Self {
            appended_ids: ids,
            ..Default::default()
        }
    }
}

impl<U> DecoderHead<U> {
    pub fn new(id: usize, input_ids: Vec<u32>, eos_id: u32, user_data: U) -> Self {
        let len = input_ids.len();
        Self {
            id,
            input_ids,
            next_token_id: None,
            next_token_logits: Vec::new(),
            next_token_logprob: 0.0,
            logprob: 0.0,
            user_data,
            eos_id,
            initial_prompt_offset: len,
            value_offset: len,
        }
    }

    /// Applies a rewrite: strip EOS, truncate, append, then replace the user data and the
    /// value offset.
    pub fn rewrite(&mut self, rewrite: RewrittenInputIds<U>) {
        if rewrite.strip_eos && self.input_ids.last() == Some(&self.eos_id) {
            self.input_ids.pop();
        }
        if let Some(len) = rewrite.truncate_to {
            self.input_ids.truncate(len);
        }
        self.input_ids.extend(rewrite.appended_ids);
        if let Some(user_data) = rewrite.user_data {
            self.user_data = user_data;
        }
        if let Some(offset) = rewrite.value_offset {
            self.value_offset = offset;
        }
        self.value_offset = self.value_offset.min(self.input_ids.len());
    }

    /// Appends a generated token.
    pub fn push(&mut self, token: u32, logprob: f32) {
        self.input_ids.push(token);
        self.next_token_id = Some(token);
        self.next_token_logprob = logprob;
        self.logprob += logprob;
    }

    /// The ids of the current hole.
    pub fn value_ids(&self) -> &[u32] {
        &self.input_ids[self.value_offset.min(self.input_ids.len())..]
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Left-pads `sequences` to a common length, returning the padded ids and the attention
/// masks.
pub fn pad_batch(sequences: &[&[u32]], pad_id: u32) -> (Vec<Vec<u32>>, Vec<Vec<u8>>) {
    let width = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
    sequences
        .iter()
        .map(|s| {
            let pad = width - s.len();
            let mut ids = vec![pad_id; pad];
            ids.extend_from_slice(s);
            let mut mask = vec![0u8; pad];
            mask.resize(width, 1);
            (ids, mask)
        })
        .unzip()
}

/// Removes left padding from a batch row.
pub fn unpad<'a>(ids: &'a [u32], attention_mask: &[u8]) -> &'a [u32] {
    let start = attention_mask
        .iter()
        .position(|m| *m != 0)
        .unwrap_or(attention_mask.len());
    &ids[start.min(ids.len())..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_strips_truncates_and_appends() {
        let mut head = DecoderHead::new(0, vec![1, 2, 3], 9, ());
        head.push(4, -0.5);
        head.push(9, -0.1);
        head.rewrite(RewrittenInputIds {
            appended_ids: vec![7],
            strip_eos: true,
            truncate_to: Some(4),
            user_data: None,
            value_offset: Some(3),
        });
        assert_eq!(head.input_ids, vec![1, 2, 3, 4, 7]);
        assert_eq!(head.value_ids(), &[4, 7]);
        assert!((head.logprob + 0.6).abs() < 1e-6);
    }

    #[test]
    fn padding_is_left_aligned() {
        let (ids, mask) = pad_batch(&[&[1, 2], &[3]], 0);
        assert_eq!(ids, vec![vec![1, 2], vec![0, 3]]);
        assert_eq!(mask, vec![vec![1, 1], vec![0, 1]]);
        assert_eq!(unpad(&ids[1], &mask[1]), &[3]);
    }
}
