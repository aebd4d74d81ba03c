//! Llama 3 instruct prompt layout:
//!
//! ```text
//! <|begin_of_text|><|start_header_id|>system<|end_header_id|>\n{system}<|eot_id|>
//! <|start_header_id|>user<|end_header_id|>\n{user}<|eot_id|>
//! <|start_header_id|>assistant<|end_header_id|>\n
//! ```

#[cfg(test)]
#[path = "../tests/unit/chat_test.rs"]
mod chat_test;

use crate::error::LlamaError;
use crate::tokenizer::Tokenizer;
use anyhow::Result;
use std::collections::HashSet;

pub const BEGIN_OF_TEXT: &str = "<|begin_of_text|>";
pub const END_OF_TEXT: &str = "<|end_of_text|>";
pub const START_HEADER: &str = "<|start_header_id|>";
pub const END_HEADER: &str = "<|end_header_id|>";
pub const END_OF_TURN: &str = "<|eot_id|>";
/// Only present in Llama 3.1 vocabularies.
pub const END_OF_MESSAGE: &str = "<|eom_id|>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// Encodes chat messages into Llama 3 instruct token sequences.
pub struct ChatFormat<'a> {
    tokenizer: &'a Tokenizer,
    begin_of_text: usize,
    start_header: usize,
    end_header: usize,
    end_of_turn: usize,
    end_of_text: usize,
    end_of_message: Option<usize>,
}

impl<'a> ChatFormat<'a> {
    pub fn new(tokenizer: &'a Tokenizer) -> Result<Self> {
        let required = |name: &str| {
            tokenizer
                .special_token(name)
                .ok_or_else(|| LlamaError::Vocabulary(format!("Missing chat special token '{name}'")))
        };

        Ok(Self {
            tokenizer,
            begin_of_text: required(BEGIN_OF_TEXT)?,
            start_header: required(START_HEADER)?,
            end_header: required(END_HEADER)?,
            end_of_turn: required(END_OF_TURN)?,
            end_of_text: required(END_OF_TEXT)?,
            end_of_message: tokenizer.special_token(END_OF_MESSAGE),
        })
    }

    pub fn begin_of_text(&self) -> usize {
        self.begin_of_text
    }

    pub fn end_of_message(&self) -> Option<usize> {
        self.end_of_message
    }

    /// Tokens that end an assistant turn.
    pub fn stop_tokens(&self) -> HashSet<usize> {
        HashSet::from([self.end_of_text, self.end_of_turn])
    }

    pub fn encode_header(&self, role: Role) -> Result<Vec<usize>> {
        let mut tokens = vec![self.start_header];
        tokens.extend(self.tokenizer.encode(role.as_str())?);
        tokens.push(self.end_header);
        tokens.extend(self.tokenizer.encode("\n")?);
        Ok(tokens)
    }

    /// Header, trimmed content and end-of-turn.
    pub fn encode_message(&self, message: &Message) -> Result<Vec<usize>> {
        let mut tokens = self.encode_header(message.role)?;
        tokens.extend(self.tokenizer.encode(message.content.trim())?);
        tokens.push(self.end_of_turn);
        Ok(tokens)
    }

    /// Begin-of-text, every message, and optionally an open assistant header for the model to complete.
    pub fn encode_dialog_prompt(&self, dialog: &[Message], append_assistant_turn: bool) -> Result<Vec<usize>> {
        let mut tokens = vec![self.begin_of_text];
        for message in dialog {
            tokens.extend(self.encode_message(message)?);
        }
        if append_assistant_turn {
            tokens.extend(self.encode_header(Role::Assistant)?);
        }
        Ok(tokens)
    }
}
