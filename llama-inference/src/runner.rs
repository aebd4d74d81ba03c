//! Console front ends for the two inference modes.

use crate::chat::{ChatFormat, END_OF_TEXT, Message, Role};
use crate::generation::generate_tokens;
use crate::models::Model;
use crate::sampler::Sampler;
use crate::tokenizer::{StreamDecoder, Tokenizer};
use anyhow::Result;
use log::info;
use std::collections::HashSet;
use std::io::{self, BufRead, Write};

/// Continues `prompt` until end of text or the token bound.
pub fn generate(model: &Model, sampler: &mut Sampler, prompt: Option<&str>, max_tokens: usize) -> Result<()> {
    let tokenizer = model.tokenizer();
    let prompt_tokens = tokenizer.encode(prompt.unwrap_or(""))?;

    if prompt_tokens.is_empty() {
        anyhow::bail!("Please provide a prompt");
    }

    let stop_tokens: HashSet<usize> = tokenizer.special_token(END_OF_TEXT).into_iter().collect();
    let mut state = model.create_session();
    let mut printer = TokenPrinter::new(tokenizer, 0);

    let response = generate_tokens(
        model,
        &mut state,
        0,
        &prompt_tokens,
        &stop_tokens,
        Some(max_tokens),
        sampler,
        Some(&mut |token| printer.print(token)),
    )?;

    printer.finish();
    println!();
    info!("[{}]", response.stats);
    Ok(())
}

/// Multi-turn chat on one session; a prompt given on the command line runs a single turn.
pub fn chat(
    model: &Model,
    sampler: &mut Sampler,
    cli_user_prompt: Option<&str>,
    system_prompt: Option<&str>,
    max_tokens: usize,
) -> Result<()> {
    let tokenizer = model.tokenizer();
    let format = ChatFormat::new(tokenizer)?;
    let stop_tokens = format.stop_tokens();
    let context_length = model.config().context_length;
    let stdin = io::stdin();

    let mut state = model.create_session();
    let mut position = 0;
    let mut turns = 0;

    loop {
        let user_prompt = match cli_user_prompt {
            Some(prompt) if turns == 0 => prompt.to_string(),
            Some(_) => break,
            None => match read_user_input(&stdin)? {
                Some(input) => input,
                None => break,
            },
        };

        let user = Message::new(Role::User, user_prompt);
        let prompt_tokens = if position == 0 {
            let mut dialog = Vec::with_capacity(2);
            if let Some(system) = system_prompt {
                dialog.push(Message::new(Role::System, system));
            }
            dialog.push(user);
            format.encode_dialog_prompt(&dialog, true)?
        } else {
            let mut tokens = format.encode_message(&user)?;
            tokens.extend(format.encode_header(Role::Assistant)?);
            tokens
        };

        let bound = (position + max_tokens).min(context_length);
        let mut printer = TokenPrinter::new(tokenizer, prompt_tokens.len());
        let response = generate_tokens(
            model,
            &mut state,
            position,
            &prompt_tokens,
            &stop_tokens,
            Some(bound),
            sampler,
            Some(&mut |token| printer.print(token)),
        )?;

        printer.finish();
        println!();
        info!("[{}]", response.stats);

        turns += 1;
        position += response.stats.total_tokens;
        if position + 1 >= context_length {
            info!("Context window exhausted, starting a new conversation");
            state = model.create_session();
            position = 0;
        } else if let Some(&last) = response.tokens.last().filter(|&token| stop_tokens.contains(token)) {
            // The stop token closes the assistant turn in the cache.
            state.latest_token = last;
        }
    }

    Ok(())
}

fn read_user_input(stdin: &io::Stdin) -> Result<Option<String>> {
    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    if stdin.lock().read_line(&mut input)? == 0 {
        return Ok(None);
    }
    let input = input.trim();
    Ok((!input.is_empty()).then(|| input.to_string()))
}

/// Streams sampled, non-special tokens to stdout, holding back the bytes of
/// a character until the token that completes it arrives.
struct TokenPrinter<'a> {
    tokenizer: &'a Tokenizer,
    decoder: StreamDecoder<'a>,
    skip: usize,
}

impl<'a> TokenPrinter<'a> {
    fn new(tokenizer: &'a Tokenizer, skip: usize) -> Self {
        Self { tokenizer, decoder: StreamDecoder::new(tokenizer), skip }
    }

    fn print(&mut self, token: usize) {
        if self.skip > 0 {
            self.skip -= 1;
            return;
        }
        if !self.tokenizer.is_special_token(token) {
            let text = self.decoder.push(token);
            if !text.is_empty() {
                print!("{text}");
                let _ = io::stdout().flush();
            }
        }
    }

    fn finish(&mut self) {
        print!("{}", self.decoder.finish());
    }
}
