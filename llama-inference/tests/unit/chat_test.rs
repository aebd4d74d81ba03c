use super::*;
use crate::gguf::GgufFile;
use crate::gguf_writer::{GgufWriter, TinyLlama, Value};

fn tokenizer_for(tiny: &TinyLlama) -> Tokenizer {
    let mut writer = GgufWriter::new()
        .string("tokenizer.ggml.model", "gpt2")
        .metadata("tokenizer.ggml.tokens", Value::strings(&tiny.tokens));
    if let Some(types) = &tiny.token_types {
        writer = writer.metadata("tokenizer.ggml.token_type", Value::i32s(types));
    }
    Tokenizer::from_gguf(&GgufFile::from_bytes(writer.build()).unwrap()).unwrap()
}

fn ids(tokenizer: &Tokenizer, text: &str) -> Vec<usize> {
    tokenizer.encode(text).unwrap()
}

#[test]
fn test_role_names() {
    assert_eq!(Role::System.as_str(), "system");
    assert_eq!(Role::User.as_str(), "user");
    assert_eq!(Role::Assistant.as_str(), "assistant");
}

#[test]
fn test_header_layout() -> Result<()> {
    let tiny = TinyLlama::chat();
    let tokenizer = tokenizer_for(&tiny);
    let format = ChatFormat::new(&tokenizer)?;

    let mut expected = vec![tiny.token_id(START_HEADER)];
    expected.extend(ids(&tokenizer, "user"));
    expected.push(tiny.token_id(END_HEADER));
    expected.extend(ids(&tokenizer, "\n"));

    assert_eq!(format.encode_header(Role::User)?, expected);

    Ok(())
}

#[test]
fn test_message_content_is_trimmed() -> Result<()> {
    let tiny = TinyLlama::chat();
    let tokenizer = tokenizer_for(&tiny);
    let format = ChatFormat::new(&tokenizer)?;

    let tokens = format.encode_message(&Message::new(Role::User, "  hi there \n"))?;

    let mut expected = format.encode_header(Role::User)?;
    expected.extend(ids(&tokenizer, "hi there"));
    expected.push(tiny.token_id(END_OF_TURN));
    assert_eq!(tokens, expected);

    Ok(())
}

#[test]
fn test_dialog_prompt() -> Result<()> {
    let tiny = TinyLlama::chat();
    let tokenizer = tokenizer_for(&tiny);
    let format = ChatFormat::new(&tokenizer)?;
    let dialog = [Message::new(Role::System, "be brief"), Message::new(Role::User, "hello")];

    let closed = format.encode_dialog_prompt(&dialog, false)?;
    let open = format.encode_dialog_prompt(&dialog, true)?;

    assert_eq!(closed[0], format.begin_of_text());
    assert_eq!(closed.last(), Some(&tiny.token_id(END_OF_TURN)));
    assert_eq!(open[..closed.len()], closed[..]);
    assert_eq!(open[closed.len()..], format.encode_header(Role::Assistant)?[..]);

    let text = tokenizer.decode(&open);
    assert_eq!(
        text,
        "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\nbe brief<|eot_id|>\
         <|start_header_id|>user<|end_header_id|>\nhello<|eot_id|>\
         <|start_header_id|>assistant<|end_header_id|>\n"
    );

    Ok(())
}

#[test]
fn test_stop_tokens() -> Result<()> {
    let tiny = TinyLlama::chat();
    let tokenizer = tokenizer_for(&tiny);
    let format = ChatFormat::new(&tokenizer)?;

    assert_eq!(format.stop_tokens(), HashSet::from([tiny.token_id(END_OF_TEXT), tiny.token_id(END_OF_TURN)]));
    assert_eq!(format.end_of_message(), None);

    Ok(())
}

#[test]
fn test_missing_chat_tokens() {
    let tokenizer = tokenizer_for(&TinyLlama::new());

    let err = ChatFormat::new(&tokenizer).err().unwrap();
    assert!(matches!(err.downcast_ref::<LlamaError>(), Some(LlamaError::Vocabulary(msg)) if msg.contains(START_HEADER)));
}
