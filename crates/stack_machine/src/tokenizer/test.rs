use super::*;

fn tokens(source: &str) -> Vec<String> {
    let mut tokenizer = Tokenizer::new(source.as_bytes());
    let mut out = Vec::new();
    while let Some(token) = tokenizer.next_token().unwrap() {
        out.push(token);
    }
    out
}

#[test]
fn splits_on_every_kind_of_whitespace() {
    assert_eq!(
        tokens("push 1\tpush\r\n2  add\n\n  outnum"),
        ["push", "1", "push", "2", "add", "outnum"]
    );
}

#[test]
fn empty_and_blank_sources_have_no_tokens() {
    assert!(tokens("").is_empty());
    assert!(tokens(" \n\t\r\n ").is_empty());
}

#[test]
fn end_of_input_is_sticky() {
    let mut tokenizer = Tokenizer::new("halt".as_bytes());
    assert_eq!(tokenizer.next_token().unwrap().as_deref(), Some("halt"));
    assert_eq!(tokenizer.next_token().unwrap(), None);
    assert_eq!(tokenizer.next_token().unwrap(), None);
}

#[test]
fn line_numbers_follow_the_token_just_read() {
    let mut tokenizer = Tokenizer::new("a\nb\n\nc".as_bytes());
    assert_eq!(tokenizer.line(), 1);
    tokenizer.next_token().unwrap();
    assert_eq!(tokenizer.line(), 1);
    tokenizer.next_token().unwrap();
    assert_eq!(tokenizer.line(), 2);
    tokenizer.next_token().unwrap();
    assert_eq!(tokenizer.line(), 4);
}

#[test]
fn skip_line_drops_rest_of_comment() {
    let mut tokenizer = Tokenizer::new("; a comment with words\nnext ;x\nlast".as_bytes());
    assert_eq!(tokenizer.next_token().unwrap().as_deref(), Some(";"));
    tokenizer.skip_line().unwrap();
    assert_eq!(tokenizer.line(), 2);
    assert_eq!(tokenizer.next_token().unwrap().as_deref(), Some("next"));
    assert_eq!(tokenizer.next_token().unwrap().as_deref(), Some(";x"));
    tokenizer.skip_line().unwrap();
    assert_eq!(tokenizer.next_token().unwrap().as_deref(), Some("last"));
    assert_eq!(tokenizer.line(), 3);
}

#[test]
fn skip_line_at_end_of_input() {
    let mut tokenizer = Tokenizer::new(";".as_bytes());
    tokenizer.next_token().unwrap();
    tokenizer.skip_line().unwrap();
    assert_eq!(tokenizer.next_token().unwrap(), None);
}

#[test]
fn rejects_invalid_utf8() {
    let source: &[u8] = b"ok \xff\xfe";
    let mut tokenizer = Tokenizer::new(source);
    assert_eq!(tokenizer.next_token().unwrap().as_deref(), Some("ok"));
    assert_eq!(
        tokenizer.next_token(),
        Err(TokenizerError::InvalidUtf8 { line: 1 })
    );
}
