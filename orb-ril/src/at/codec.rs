use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

const MAX_LINE_LEN: usize = 8 * 1024;
const SMS_PROMPT: &[u8] = b"> ";

/// Splits modem output into lines.
///
/// Lines end in `\r`, `\n` or both, empty lines are dropped, and the `> ` prompt
/// that asks for an SMS PDU is yielded on its own even though no line ending
/// follows it.
#[derive(Debug, Default)]
pub struct AtLineCodec;

impl Decoder for AtLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let skip = src
            .iter()
            .take_while(|b| matches!(b, b'\r' | b'\n'))
            .count();
        src.advance(skip);

        if src.starts_with(SMS_PROMPT) {
            src.advance(SMS_PROMPT.len());
            return Ok(Some(String::from_utf8_lossy(SMS_PROMPT).into_owned()));
        }

        match src.iter().position(|b| matches!(b, b'\r' | b'\n')) {
            Some(end) => {
                let line = src.split_to(end);
                src.advance(1);
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None if src.len() > MAX_LINE_LEN => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {MAX_LINE_LEN} bytes"),
            )),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let line = src.split();
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<String> {
        let mut codec = AtLineCodec;
        let mut buf = BytesMut::from(input);
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn it_splits_crlf_lines_and_skips_empty_ones() {
        let lines = decode_all(b"\r\n+CSQ: 20,99\r\n\r\nOK\r\n");

        assert_eq!(lines, vec!["+CSQ: 20,99", "OK"]);
    }

    #[test]
    fn it_yields_sms_prompt_without_line_ending() {
        let lines = decode_all(b"\r\n> ");

        assert_eq!(lines, vec!["> "]);
    }

    #[test]
    fn it_waits_for_incomplete_line() {
        let mut codec = AtLineCodec;
        let mut buf = BytesMut::from(&b"+CREG: 1"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b",2\r");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("+CREG: 1,2".to_owned()));
    }

    #[test]
    fn it_flushes_trailing_bytes_at_eof() {
        let mut codec = AtLineCodec;
        let mut buf = BytesMut::from(&b"NO CARRIER"[..]);

        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some("NO CARRIER".to_owned())
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
