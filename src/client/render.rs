//! Streaming markdown-ish highlighting for daemon responses.
//!
//! The highlighter only adds colour escapes; every input character is
//! written exactly once and in order, so the plain text survives intact when
//! colour is off or stripped.

use crossterm::queue;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use std::io::{self, Write};

/// 256-colour palette entries.
pub const BLOCK_COLOR: u8 = 111;
pub const INLINE_COLOR: u8 = 214;
pub const LANG_COLOR: u8 = 242;

/// Renderer state carried across stream chunks.
#[derive(Debug, Default)]
pub struct Highlighter {
    colors: bool,
    /// Backticks seen but not yet classified.
    ticks: usize,
    in_block: bool,
    in_inline: bool,
    /// Between an opening fence and the first whitespace after it.
    in_lang: bool,
    lang: String,
    active: Option<u8>,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    partial: Vec<u8>,
}

impl Highlighter {
    pub fn new(colors: bool) -> Self {
        Self {
            colors,
            ..Self::default()
        }
    }

    pub fn in_code_block(&self) -> bool {
        self.in_block
    }

    pub fn in_inline_code(&self) -> bool {
        self.in_inline
    }

    pub fn feed<W: Write>(&mut self, text: &str, out: &mut W) -> io::Result<()> {
        for c in text.chars() {
            self.push_char(c, out)?;
        }
        out.flush()
    }

    /// Feed raw bytes, holding back a UTF-8 sequence split across chunks.
    pub fn feed_bytes<W: Write>(&mut self, bytes: &[u8], out: &mut W) -> io::Result<()> {
        let mut buf = std::mem::take(&mut self.partial);
        buf.extend_from_slice(bytes);

        let mut start = 0;
        while start < buf.len() {
            match std::str::from_utf8(&buf[start..]) {
                Ok(text) => {
                    for c in text.chars() {
                        self.push_char(c, out)?;
                    }
                    start = buf.len();
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    let text = std::str::from_utf8(&buf[start..valid]).unwrap_or_default();
                    for c in text.chars() {
                        self.push_char(c, out)?;
                    }
                    match e.error_len() {
                        Some(len) => {
                            self.push_char(char::REPLACEMENT_CHARACTER, out)?;
                            start = valid + len;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }

        buf.drain(..start);
        self.partial = buf;
        out.flush()
    }

    /// Emit anything still pending and restore the default colour.
    pub fn finish<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            for c in String::from_utf8_lossy(&rest).chars() {
                self.push_char(c, out)?;
            }
        }
        self.flush_ticks(out)?;
        self.end_lang(out)?;
        self.paint(None, out)?;
        out.flush()
    }

    fn push_char<W: Write>(&mut self, c: char, out: &mut W) -> io::Result<()> {
        if c == '`' {
            self.end_lang(out)?;
            self.ticks += 1;
            if self.ticks == 3 {
                self.ticks = 0;
                self.toggle_block(out)?;
            }
            return Ok(());
        }

        self.flush_ticks(out)?;

        if self.in_lang {
            if !c.is_whitespace() {
                self.lang.push(c);
                return Ok(());
            }
            self.end_lang(out)?;
        }

        self.paint(self.state_color(), out)?;
        queue!(out, Print(c))
    }

    fn toggle_block<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        self.paint(Some(BLOCK_COLOR), out)?;
        queue!(out, Print("```"))?;
        if self.in_block {
            self.in_block = false;
        } else {
            self.in_block = true;
            self.in_inline = false;
            self.in_lang = true;
        }
        Ok(())
    }

    /// Single or double backticks: literal inside a block, inline toggles
    /// outside one.
    fn flush_ticks<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        for _ in 0..std::mem::take(&mut self.ticks) {
            if self.in_block {
                self.paint(Some(BLOCK_COLOR), out)?;
            } else {
                self.in_inline = !self.in_inline;
                self.paint(Some(INLINE_COLOR), out)?;
            }
            queue!(out, Print('`'))?;
        }
        Ok(())
    }

    fn end_lang<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if !self.in_lang {
            return Ok(());
        }
        self.in_lang = false;
        if !self.lang.is_empty() {
            let lang = std::mem::take(&mut self.lang);
            self.paint(Some(LANG_COLOR), out)?;
            queue!(out, Print(lang))?;
        }
        Ok(())
    }

    fn state_color(&self) -> Option<u8> {
        if self.in_lang {
            Some(LANG_COLOR)
        } else if self.in_block {
            Some(BLOCK_COLOR)
        } else if self.in_inline {
            Some(INLINE_COLOR)
        } else {
            None
        }
    }

    fn paint<W: Write>(&mut self, want: Option<u8>, out: &mut W) -> io::Result<()> {
        if !self.colors || want == self.active {
            return Ok(());
        }
        match want {
            Some(n) => queue!(out, SetForegroundColor(Color::AnsiValue(n)))?,
            None => queue!(out, ResetColor)?,
        }
        self.active = want;
        Ok(())
    }
}
