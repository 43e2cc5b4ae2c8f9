use thiserror::Error;

use super::{Pipeline, Script, Stage};

/// Fatal parse failures. The `#[error]` strings are the exact messages the
/// driver prints after its `parse error: ` prefix.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("trailing escape")]
    TrailingEscape,
    #[error("unterminated double quote")]
    UnterminatedDoubleQuote,
    #[error("unterminated single quote")]
    UnterminatedSingleQuote,
    #[error("unterminated escape in quotes")]
    UnterminatedQuoteEscape,
    #[error("empty pipeline stage")]
    EmptyPipelineStage,
    #[error("redirection without command")]
    RedirectionWithoutCommand,
    #[error("missing redirection target")]
    MissingRedirectionTarget,
    #[error("expected word")]
    ExpectedWord,
    #[error("pipeline stage missing command")]
    MissingPipelineCommand,
}

/// Byte cursor over the source. End of input reads as NUL, which is also a
/// token terminator, so an embedded NUL ends parsing like the end of the
/// script does.
struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a [u8]) -> Self {
        Cursor { src, pos: 0 }
    }

    fn peek(&self) -> u8 {
        self.src.get(self.pos).copied().unwrap_or(0)
    }

    fn bump(&mut self) -> u8 {
        let b = self.peek();
        if self.pos < self.src.len() {
            self.pos += 1;
        }
        b
    }

    /// Skip space, tab, and CR. Newlines are statement separators and are
    /// never skipped here.
    fn skip_inline_ws(&mut self) {
        while matches!(self.peek(), b' ' | b'\t' | b'\r') {
            self.pos += 1;
        }
    }
}

fn is_token_terminator(b: u8) -> bool {
    matches!(b, 0 | b' ' | b'\t' | b'\r' | b'\n' | b'|' | b';' | b'<' | b'>')
}

/// Accumulate one word: any run of adjacent bare, escaped, double-quoted,
/// and single-quoted segments. Returns `None` when the accumulation is empty
/// (e.g. the cursor sits on a terminator, or the word was `""`).
fn parse_word(cur: &mut Cursor) -> Result<Option<Vec<u8>>, ParseError> {
    let mut word = Vec::new();
    loop {
        let b = cur.peek();
        if b == b'\\' {
            cur.bump();
            if cur.peek() == 0 {
                return Err(ParseError::TrailingEscape);
            }
            word.push(cur.bump());
            continue;
        }
        if b == b'"' {
            cur.bump();
            let mut closed = false;
            while cur.peek() != 0 {
                let c = cur.bump();
                if c == b'"' {
                    closed = true;
                    break;
                }
                if c == b'\\' {
                    let esc = cur.peek();
                    if esc == 0 {
                        return Err(ParseError::UnterminatedQuoteEscape);
                    }
                    cur.bump();
                    match esc {
                        b'"' | b'\\' | b'$' | b'`' => word.push(esc),
                        // backslash-newline is a line continuation
                        b'\n' => {}
                        _ => {
                            word.push(b'\\');
                            word.push(esc);
                        }
                    }
                } else {
                    word.push(c);
                }
            }
            if !closed {
                return Err(ParseError::UnterminatedDoubleQuote);
            }
            continue;
        }
        if b == b'\'' {
            cur.bump();
            while cur.peek() != 0 && cur.peek() != b'\'' {
                word.push(cur.bump());
            }
            if cur.peek() != b'\'' {
                return Err(ParseError::UnterminatedSingleQuote);
            }
            cur.bump();
            continue;
        }
        if is_token_terminator(b) {
            break;
        }
        word.push(cur.bump());
    }
    if word.is_empty() {
        Ok(None)
    } else {
        Ok(Some(word))
    }
}

/// Parse a script source into its pipeline structure.
pub fn parse(src: &[u8]) -> Result<Script, ParseError> {
    let mut script = Script::default();
    let mut pipeline = Pipeline::default();
    let mut stage = Stage::default();
    let mut expect_stage = false;
    let mut cur = Cursor::new(src);

    loop {
        cur.skip_inline_ws();
        let b = cur.peek();
        if b == 0 {
            break;
        }
        match b {
            b'\n' | b';' => {
                if expect_stage {
                    return Err(ParseError::MissingPipelineCommand);
                }
                if !stage.argv.is_empty() {
                    pipeline.stages.push(std::mem::take(&mut stage));
                } else if stage.has_redir() {
                    return Err(ParseError::RedirectionWithoutCommand);
                }
                if !pipeline.stages.is_empty() {
                    script.pipelines.push(std::mem::take(&mut pipeline));
                }
                while matches!(cur.peek(), b'\n' | b';') {
                    cur.bump();
                }
            }
            b'|' => {
                if stage.argv.is_empty() {
                    return Err(ParseError::EmptyPipelineStage);
                }
                pipeline.stages.push(std::mem::take(&mut stage));
                expect_stage = true;
                cur.bump();
            }
            b'<' | b'>' => {
                let op = cur.bump();
                let mut append = false;
                if op == b'>' && cur.peek() == b'>' {
                    append = true;
                    cur.bump();
                }
                cur.skip_inline_ws();
                if matches!(cur.peek(), 0 | b'\n' | b'|' | b';' | b'<' | b'>') {
                    return Err(ParseError::MissingRedirectionTarget);
                }
                let target =
                    parse_word(&mut cur)?.ok_or(ParseError::MissingRedirectionTarget)?;
                if op == b'<' {
                    stage.in_redir = Some(target);
                } else {
                    stage.out_redir = Some(target);
                    stage.out_append = append;
                }
            }
            _ => {
                let word = parse_word(&mut cur)?.ok_or(ParseError::ExpectedWord)?;
                stage.argv.push(word);
                expect_stage = false;
            }
        }
    }

    if expect_stage {
        return Err(ParseError::MissingPipelineCommand);
    }
    if !stage.argv.is_empty() {
        pipeline.stages.push(stage);
    } else if stage.has_redir() {
        return Err(ParseError::RedirectionWithoutCommand);
    }
    if !pipeline.stages.is_empty() {
        script.pipelines.push(pipeline);
    }
    Ok(script)
}
