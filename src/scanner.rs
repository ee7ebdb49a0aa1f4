//! Scans an input buffer (a compiler's dependency output) character by
//! character.

use std::path::Path;

#[derive(Debug)]
pub struct ParseError {
    msg: String,
    ofs: usize,
}
pub type ParseResult<T> = Result<T, ParseError>;

pub struct Scanner<'a> {
    buf: &'a [u8],
    pub ofs: usize,
    pub line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Scanner {
            buf,
            ofs: 0,
            line: 1,
        }
    }

    /// Returns '\0' at end of input.
    pub fn peek(&self) -> char {
        self.buf.get(self.ofs).map(|&c| c as char).unwrap_or('\0')
    }
    pub fn at_end(&self) -> bool {
        self.ofs >= self.buf.len()
    }
    pub fn next(&mut self) {
        if self.at_end() {
            panic!("scanned past end")
        }
        if self.peek() == '\n' {
            self.line += 1;
        }
        self.ofs += 1;
    }
    pub fn back(&mut self) {
        if self.ofs == 0 {
            panic!("back at start")
        }
        self.ofs -= 1;
        if self.peek() == '\n' {
            self.line -= 1;
        }
    }
    pub fn read(&mut self) -> char {
        let c = self.peek();
        if !self.at_end() {
            self.next();
        }
        c
    }
    /// Like read(), but returns the raw byte, which may be part of a
    /// multi-byte UTF-8 sequence.
    pub fn read_byte(&mut self) -> u8 {
        let b = self.buf.get(self.ofs).copied().unwrap_or(0);
        if !self.at_end() {
            self.next();
        }
        b
    }
    pub fn skip(&mut self, ch: char) -> bool {
        if !self.at_end() && self.peek() == ch {
            self.next();
            return true;
        }
        false
    }

    pub fn expect(&mut self, ch: char) -> ParseResult<()> {
        let r = self.read();
        if r != ch {
            return self.parse_error(format!("expected {:?}, got {:?}", ch, r));
        }
        Ok(())
    }

    pub fn parse_error<T, S: Into<String>>(&self, msg: S) -> ParseResult<T> {
        Err(ParseError {
            msg: msg.into(),
            ofs: self.ofs,
        })
    }

    pub fn format_parse_error(&self, filename: &Path, err: ParseError) -> String {
        let mut ofs = 0;
        for (line_number, line) in self.buf.split(|&c| c == b'\n').enumerate() {
            if ofs + line.len() >= err.ofs {
                let prefix = format!("{}:{}: ", filename.display(), line_number + 1);
                let mut context = String::from_utf8_lossy(line).into_owned();
                let col = (err.ofs - ofs).min(context.len());
                if context.len() > 60 {
                    context.truncate(60);
                    context.push_str("...");
                }
                return format!(
                    "parse error: {}\n{}{}\n{}^\n",
                    err.msg,
                    prefix,
                    context,
                    " ".repeat(prefix.len() + col.min(63))
                );
            }
            ofs += line.len() + 1;
        }
        format!("parse error: {}\n{}: at end of input\n", err.msg, filename.display())
    }
}
