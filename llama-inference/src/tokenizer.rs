//! Byte-level BPE tokenizer for Llama 3 vocabularies.
//!
//! - Text is mapped byte by byte onto printable codepoints (GPT-2 scheme) and
//!   split into chunks with the Llama 3 pre-tokenization pattern.
//! - Each chunk starts as one token per codepoint; the adjacent pair with the
//!   lowest merge rank is merged repeatedly until no known merge remains.
//! - Special tokens are only produced when the caller explicitly allows them.
//! - Decoding concatenates token strings and maps codepoints back to bytes.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tokenizer_test;

use crate::error::LlamaError;
use crate::gguf::{GgufFile, MetadataValue};
use anyhow::{Context, Result};
use fancy_regex::Regex;
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Pre-tokenization pattern of Llama 3.
pub const LLAMA_3_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// Base vocabulary size of Llama 3; tokens past it are special when the
/// file carries no token types.
const LLAMA_3_BASE_TOKENS: usize = 128000;
/// `tokenizer.ggml.token_type` values marking special tokens.
const TOKEN_TYPE_CONTROL: i64 = 3;
const TOKEN_TYPE_USER_DEFINED: i64 = 4;
const SUPPORTED_TOKENIZER_MODEL: &str = "gpt2";

/// Indexed token strings.
#[derive(Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>) -> Self {
        // first occurrence wins for duplicated strings
        let mut index = HashMap::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            index.entry(token.clone()).or_insert(i);
        }
        Self { tokens, index }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }

    pub fn index_of(&self, token: &str) -> Option<usize> {
        self.index.get(token).copied()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary").field("size", &self.tokens.len()).finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Merge {
    rank: usize,
    token: usize,
}

/// Maps every byte to a printable codepoint and back (GPT-2 `bytes_to_unicode`).
pub(crate) struct ByteLevel {
    encoder: [char; 256],
    decoder: HashMap<char, u8>,
}

impl ByteLevel {
    const UNICODE_OFFSET: u32 = 256;

    fn new() -> Self {
        let mut encoder = ['\0'; 256];
        let mut decoder = HashMap::with_capacity(256);
        let mut shifted = 0u32;

        for b in 0..=255u8 {
            let ch = if matches!(b, 33..=126 | 161..=172 | 174..=255) {
                b as char
            } else {
                shifted += 1;
                char::from_u32(Self::UNICODE_OFFSET + shifted - 1).unwrap_or(char::REPLACEMENT_CHARACTER)
            };
            encoder[b as usize] = ch;
            decoder.insert(ch, b);
        }

        Self { encoder, decoder }
    }

    pub(crate) fn get() -> &'static Self {
        static BYTE_LEVEL: OnceLock<ByteLevel> = OnceLock::new();
        BYTE_LEVEL.get_or_init(Self::new)
    }

    pub(crate) fn encode(&self, text: &str) -> String {
        text.bytes().map(|b| self.encoder[b as usize]).collect()
    }

    /// Codepoints outside the table fall back to their own UTF-8 bytes.
    pub(crate) fn decode(&self, text: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(text.len());
        for ch in text.chars() {
            match self.decoder.get(&ch) {
                Some(&b) => bytes.push(b),
                None => bytes.extend_from_slice(ch.encode_utf8(&mut [0; 4]).as_bytes()),
            }
        }
        bytes
    }
}

/// BPE tokenizer over a [`Vocabulary`], a ranked merge table and a set of
/// special tokens.
pub struct Tokenizer {
    vocabulary: Vocabulary,
    merges: HashMap<(usize, usize), Merge>,
    special_tokens: HashMap<String, usize>,
    special_ids: HashSet<usize>,
    pattern: Regex,
}

impl Tokenizer {
    /// Builds a tokenizer from `"left right"` merge rules listed in rank order.
    pub fn new<S: AsRef<str>>(
        vocabulary: Vocabulary,
        merge_rules: &[S],
        special_tokens: HashMap<String, usize>,
    ) -> Result<Self> {
        let mut merges = HashMap::with_capacity(merge_rules.len());
        for (rank, rule) in merge_rules.iter().enumerate() {
            let rule = rule.as_ref();
            let (left, right) = rule
                .split_once(' ')
                .ok_or_else(|| LlamaError::Vocabulary(format!("Malformed merge rule '{rule}'")))?;

            let lookup = |token: &str| {
                vocabulary
                    .index_of(token)
                    .ok_or_else(|| LlamaError::Vocabulary(format!("Merge rule '{rule}' refers to unknown token '{token}'")))
            };
            let pair = (lookup(left)?, lookup(right)?);
            let token = lookup(&format!("{left}{right}"))?;

            merges.entry(pair).or_insert(Merge { rank, token });
        }

        for (name, &id) in &special_tokens {
            if vocabulary.get(id) != Some(name.as_str()) {
                anyhow::bail!(LlamaError::Vocabulary(format!("Special token '{name}' does not match vocabulary id {id}")));
            }
        }

        let special_ids = special_tokens.values().copied().collect();
        let pattern = Regex::new(LLAMA_3_PATTERN).context("Failed to compile pre-tokenization pattern")?;

        Ok(Self { vocabulary, merges, special_tokens, special_ids, pattern })
    }

    /// Reads the vocabulary, merges and special tokens from GGUF metadata.
    pub fn from_gguf(gguf: &GgufFile) -> Result<Self> {
        let model = gguf.get("tokenizer.ggml.model").and_then(MetadataValue::as_str);
        if model != Some(SUPPORTED_TOKENIZER_MODEL) {
            anyhow::bail!(LlamaError::Vocabulary(format!(
                "Unsupported tokenizer model {model:?}, expected '{SUPPORTED_TOKENIZER_MODEL}'"
            )));
        }

        let tokens = string_array(gguf, "tokenizer.ggml.tokens")?
            .ok_or_else(|| LlamaError::Format("Missing metadata key 'tokenizer.ggml.tokens'".to_string()))?;
        let merges = string_array(gguf, "tokenizer.ggml.merges")?.unwrap_or_default();
        let vocabulary = Vocabulary::new(tokens);

        let special_tokens = match gguf.get("tokenizer.ggml.token_type").and_then(MetadataValue::as_array) {
            Some(types) => types
                .iter()
                .enumerate()
                .filter(|(_, t)| matches!(t.as_i64(), Some(TOKEN_TYPE_CONTROL | TOKEN_TYPE_USER_DEFINED)))
                .filter_map(|(id, _)| vocabulary.get(id).map(|name| (name.to_string(), id)))
                .collect(),
            None => (LLAMA_3_BASE_TOKENS..vocabulary.len())
                .filter_map(|id| vocabulary.get(id).map(|name| (name.to_string(), id)))
                .collect(),
        };

        Self::new(vocabulary, &merges, special_tokens)
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn vocab_size(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn special_tokens(&self) -> &HashMap<String, usize> {
        &self.special_tokens
    }

    pub fn special_token(&self, name: &str) -> Option<usize> {
        self.special_tokens.get(name).copied()
    }

    pub fn is_special_token(&self, id: usize) -> bool {
        self.special_ids.contains(&id)
    }

    /// Encodes ordinary text; special token strings are tokenized as plain text.
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        let mapped = ByteLevel::get().encode(text);
        let mut ids = Vec::new();
        for chunk in self.pattern.find_iter(&mapped) {
            let chunk = chunk.context("Pre-tokenization failed")?;
            ids.extend(self.encode_chunk(chunk.as_str())?);
        }
        Ok(ids)
    }

    /// Encodes text, turning exact occurrences of the `allowed_special` names
    /// into their ids. With no allowed names this is [`Tokenizer::encode`].
    pub fn encode_with_special(&self, text: &str, allowed_special: &[&str]) -> Result<Vec<usize>> {
        if allowed_special.is_empty() {
            return self.encode(text);
        }

        let mut allowed = Vec::with_capacity(allowed_special.len());
        for &name in allowed_special {
            let id = self
                .special_token(name)
                .ok_or_else(|| LlamaError::Vocabulary(format!("'{name}' is not a special token")))?;
            allowed.push((name, id));
        }

        let mut ids = Vec::new();
        let mut rest = text;
        // earliest match first, longest name on ties
        while let Some((start, name, id)) = allowed
            .iter()
            .filter_map(|&(name, id)| rest.find(name).map(|start| (start, name, id)))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())))
        {
            ids.extend(self.encode(&rest[..start])?);
            ids.push(id);
            rest = &rest[start + name.len()..];
        }
        ids.extend(self.encode(rest)?);

        Ok(ids)
    }

    fn encode_chunk(&self, chunk: &str) -> Result<Vec<usize>> {
        let mut ids = chunk
            .chars()
            .map(|ch| {
                self.vocabulary
                    .index_of(ch.encode_utf8(&mut [0; 4]))
                    .ok_or_else(|| LlamaError::Vocabulary(format!("No token for symbol {ch:?}")).into())
            })
            .collect::<Result<Vec<_>>>()?;

        while ids.len() >= 2 {
            // pairs without a merge rank last; ties keep the leftmost pair
            let best = ids
                .windows(2)
                .map(|w| (w[0], w[1]))
                .min_by_key(|pair| self.merges.get(pair).map_or(usize::MAX, |m| m.rank));

            let Some((pair, merge)) = best.and_then(|pair| self.merges.get(&pair).map(|m| (pair, *m))) else {
                break;
            };
            ids = merge_pair(&ids, pair, merge.token);
        }

        Ok(ids)
    }

    /// Concatenates the token strings and maps them back to bytes; invalid
    /// UTF-8 is replaced and unknown ids are skipped.
    pub fn decode(&self, tokens: &[usize]) -> String {
        let mut text = String::new();
        for &id in tokens {
            match self.vocabulary.get(id) {
                Some(token) => text.push_str(token),
                None => warn!("Skipping unknown token id {id} while decoding"),
            }
        }
        String::from_utf8_lossy(&ByteLevel::get().decode(&text)).into_owned()
    }
}

/// Incremental decoder for streamed output.
///
/// Bytes of a character split across tokens are held back until the
/// character is complete; invalid sequences are replaced as soon as they are
/// known to be invalid.
pub struct StreamDecoder<'a> {
    tokenizer: &'a Tokenizer,
    pending: Vec<u8>,
}

impl<'a> StreamDecoder<'a> {
    pub fn new(tokenizer: &'a Tokenizer) -> Self {
        Self { tokenizer, pending: Vec::new() }
    }

    /// Adds one token and returns the text that became printable.
    pub fn push(&mut self, id: usize) -> String {
        match self.tokenizer.vocabulary.get(id) {
            Some(token) => self.pending.extend(ByteLevel::get().decode(token)),
            None => warn!("Skipping unknown token id {id} while decoding"),
        }

        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match err.error_len() {
                        // incomplete character at the end, wait for more bytes
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + len);
                        }
                    }
                }
            }
        }
        text
    }

    /// Bytes still waiting for the rest of their character.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Flushes whatever is left, replacing an unfinished character.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocabulary.len())
            .field("merges", &self.merges.len())
            .field("special_tokens", &self.special_tokens.len())
            .finish_non_exhaustive()
    }
}

/// Replaces every non-overlapping occurrence of `pair`, scanning left to right.
fn merge_pair(ids: &[usize], pair: (usize, usize), token: usize) -> Vec<usize> {
    let mut merged = Vec::with_capacity(ids.len());
    let mut i = 0;
    while i < ids.len() {
        if i + 1 < ids.len() && (ids[i], ids[i + 1]) == pair {
            merged.push(token);
            i += 2;
        } else {
            merged.push(ids[i]);
            i += 1;
        }
    }
    merged
}

fn string_array(gguf: &GgufFile, key: &str) -> Result<Option<Vec<String>>> {
    let Some(value) = gguf.get(key) else {
        return Ok(None);
    };
    let values = value
        .as_array()
        .ok_or_else(|| LlamaError::Format(format!("Metadata '{key}' must be an array, got {value}")))?;
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| LlamaError::Format(format!("Metadata '{key}' must hold strings, got {v}")).into())
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}
