//! Positional field extraction over a single AT response line.
//!
//! A line such as `+CREG: 2,1,"00C3","0000A13F"` is consumed left to right. Every
//! extractor fails on an exhausted or malformed field, and callers are expected to
//! give up on the whole line when that happens.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("line has no ':' separator")]
    NoPrefix,
    #[error("no more fields in line")]
    Exhausted,
    #[error("field {0:?} is not an integer")]
    NotAnInteger(String),
    #[error("field {0} is not a boolean")]
    NotABoolean(i32),
    #[error("value {0} is out of range")]
    OutOfRange(i64),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone)]
pub struct Tokenizer<'a> {
    rest: Option<&'a str>,
}

impl<'a> Tokenizer<'a> {
    /// Starts tokenizing after the `+XXXX:` prefix of `line`.
    pub fn start(line: &'a str) -> Result<Self, ParseError> {
        let (_, rest) = line.split_once(':').ok_or(ParseError::NoPrefix)?;

        Ok(Self { rest: Some(rest) })
    }

    /// Tokenizes a line that carries no prefix, like the reply to `AT+CGSN`.
    pub fn bare(line: &'a str) -> Self {
        Self { rest: Some(line) }
    }

    pub fn has_more(&self) -> bool {
        self.rest.is_some_and(|rest| !rest.is_empty())
    }

    fn next_token(&mut self) -> Result<&'a str, ParseError> {
        let rest = self.rest.ok_or(ParseError::Exhausted)?.trim_start();

        if let Some(quoted) = rest.strip_prefix('"') {
            return match quoted.split_once('"') {
                Some((token, tail)) => {
                    self.rest = tail.split_once(',').map(|(_, t)| t);
                    Ok(token)
                }
                None => {
                    self.rest = None;
                    Ok(quoted)
                }
            };
        }

        match rest.split_once(',') {
            Some((token, tail)) => {
                self.rest = Some(tail);
                Ok(token)
            }
            None => {
                self.rest = None;
                Ok(rest)
            }
        }
    }

    fn next_radix(&mut self, radix: u32) -> Result<i32, ParseError> {
        let token = self.next_token()?;
        let value = leading_int(token, radix)
            .ok_or_else(|| ParseError::NotAnInteger(token.to_owned()))?;

        i32::try_from(value)
            .or_else(|_| u32::try_from(value).map(|v| v as i32))
            .map_err(|_| ParseError::OutOfRange(value))
    }

    pub fn next_int(&mut self) -> Result<i32, ParseError> {
        self.next_radix(10)
    }

    pub fn next_hex(&mut self) -> Result<i32, ParseError> {
        self.next_radix(16)
    }

    pub fn next_u32(&mut self) -> Result<u32, ParseError> {
        let value = self.next_int()?;
        u32::try_from(value).map_err(|_| ParseError::OutOfRange(value.into()))
    }

    pub fn next_bool(&mut self) -> Result<bool, ParseError> {
        match self.next_int()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ParseError::NotABoolean(other)),
        }
    }

    pub fn next_str(&mut self) -> Result<&'a str, ParseError> {
        self.next_token()
    }

    /// Everything left on the line, without tokenizing it.
    pub fn remainder(&mut self) -> &'a str {
        self.rest.take().unwrap_or_default()
    }
}

/// Parses the integer at the start of `token`, ignoring trailing garbage the way
/// modems tend to need (`"20 "`, `"0x1F"`).
fn leading_int(token: &str, radix: u32) -> Option<i64> {
    let token = token.trim_start();
    let (negative, digits) = match token.as_bytes().first() {
        Some(b'-') => (true, &token[1..]),
        Some(b'+') => (false, &token[1..]),
        _ => (false, token),
    };
    let digits = if radix == 16 {
        digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits)
    } else {
        digits
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    let value = i64::from_str_radix(&digits[..end], radix).ok()?;
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_extracts_mixed_fields() {
        // Arrange
        let mut tok = Tokenizer::start(r#"+CREG: 2,1,"00C3","0000A13F""#).unwrap();

        // Act & Assert
        assert_eq!(tok.next_int(), Ok(2));
        assert_eq!(tok.next_int(), Ok(1));
        assert!(tok.has_more());
        assert_eq!(tok.next_hex(), Ok(0xC3));
        assert_eq!(tok.next_hex(), Ok(0xA13F));
        assert!(!tok.has_more());
        assert_eq!(tok.next_int(), Err(ParseError::Exhausted));
    }

    #[test]
    fn it_reads_quoted_strings_containing_commas() {
        let mut tok = Tokenizer::start(r#"+COPS: 0,0,"Foo, Inc",2"#).unwrap();

        assert_eq!(tok.next_int(), Ok(0));
        assert_eq!(tok.next_int(), Ok(0));
        assert_eq!(tok.next_str(), Ok("Foo, Inc"));
        assert_eq!(tok.next_int(), Ok(2));
    }

    #[test]
    fn it_reads_empty_quoted_string() {
        let mut tok = Tokenizer::start(r#"+CLCC: "",2"#).unwrap();

        assert_eq!(tok.next_str(), Ok(""));
        assert!(tok.has_more());
        assert_eq!(tok.next_int(), Ok(2));
    }

    #[test]
    fn it_exhausts_after_trailing_quoted_field() {
        let mut tok = Tokenizer::start(r#"+CUSATP: "D0""#).unwrap();

        assert_eq!(tok.next_str(), Ok("D0"));
        assert!(!tok.has_more());
        assert_eq!(tok.next_str(), Err(ParseError::Exhausted));
    }

    #[test]
    fn it_rejects_lines_without_prefix() {
        assert_eq!(Tokenizer::start("OK").unwrap_err(), ParseError::NoPrefix);
    }

    #[test]
    fn it_rejects_non_boolean() {
        let mut tok = Tokenizer::start("+CFUN: 4").unwrap();

        assert_eq!(tok.next_bool(), Err(ParseError::NotABoolean(4)));
    }

    #[test]
    fn it_tolerates_trailing_garbage_after_digits() {
        let mut tok = Tokenizer::bare("12abc,x");

        assert_eq!(tok.next_int(), Ok(12));
        assert_eq!(
            tok.next_int(),
            Err(ParseError::NotAnInteger("x".to_owned()))
        );
    }

    #[test]
    fn it_parses_full_width_hex() {
        let mut tok = Tokenizer::bare("FFFFFFFF");

        assert_eq!(tok.next_hex(), Ok(-1));
    }
}
