use bytes::{Buf, BufMut, BytesMut};
use std::{io, str};
use tokio_util::codec::{Decoder, Encoder};

/// Every command and response ends with a line feed.
pub const LINE_DELIMITER: u8 = b'\n';

/// Longest line the decoder buffers before giving up on it.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// A decoded inbound record.
///
/// Bytes that do not form a printable ASCII line are still handed upwards
/// as `Malformed` instead of failing the stream, so one burst of line noise
/// does not tear down the whole link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundLine {
    Text(String),
    Malformed { raw: Vec<u8>, reason: &'static str },
}

#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    // Where to resume the delimiter search on the next call.
    next_index: usize,
    // Prefix of an over-long line that is being skipped up to its delimiter.
    overflow: Option<Vec<u8>>,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl LineCodec {
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            overflow: None,
        }
    }

    fn convert_line(raw: &[u8]) -> InboundLine {
        let raw = match raw.last() {
            Some(b'\r') => &raw[..raw.len() - 1],
            _ => raw,
        };
        let printable = raw
            .iter()
            .all(|b| b.is_ascii() && (!b.is_ascii_control() || *b == b'\t' || *b == b'\r'));
        match str::from_utf8(raw) {
            Ok(text) if printable => InboundLine::Text(text.trim().to_string()),
            _ => InboundLine::Malformed {
                raw: raw.to_vec(),
                reason: "non-printable bytes",
            },
        }
    }
}

impl Decoder for LineCodec {
    type Item = InboundLine;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let offset = src[self.next_index..]
            .iter()
            .position(|b| *b == LINE_DELIMITER);

        match offset {
            Some(n) => {
                let end = self.next_index + n;
                self.next_index = 0;
                let line = src.split_to(end + 1);
                if let Some(raw) = self.overflow.take() {
                    return Ok(Some(InboundLine::Malformed {
                        raw,
                        reason: "line exceeds maximum length",
                    }));
                }
                let content = match line[..end].last() {
                    Some(b'\r') => end - 1,
                    _ => end,
                };
                if content > self.max_length {
                    return Ok(Some(InboundLine::Malformed {
                        raw: line[..self.max_length].to_vec(),
                        reason: "line exceeds maximum length",
                    }));
                }
                Ok(Some(Self::convert_line(&line[..end])))
            }
            None if self.overflow.is_some() => {
                src.advance(src.len());
                self.next_index = 0;
                Ok(None)
            }
            // One byte of slack for a carriage return still waiting for its line feed.
            None if src.len() > self.max_length + 1 => {
                self.overflow = Some(src[..self.max_length].to_vec());
                src.advance(src.len());
                self.next_index = 0;
                Ok(None)
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() && self.overflow.is_none() => Ok(None),
            None => {
                self.next_index = 0;
                let rest = src.split_to(src.len());
                if let Some(raw) = self.overflow.take() {
                    return Ok(Some(InboundLine::Malformed {
                        raw,
                        reason: "line exceeds maximum length",
                    }));
                }
                Ok(Some(Self::convert_line(&rest)))
            }
        }
    }
}

/// Commands must be a single printable ASCII line without the delimiter.
pub fn is_valid_command(text: &str) -> bool {
    !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii() && (!b.is_ascii_control() || b == b'\t'))
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let text = item.as_ref();
        if !is_valid_command(text) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Refusing to encode {:?}", text),
            ));
        }
        dst.reserve(text.len() + 1);
        dst.put_slice(text.as_bytes());
        dst.put_u8(LINE_DELIMITER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<InboundLine> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).expect("decode") {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn splits_lines_and_strips_carriage_return() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"FLUKE, 8808A, 1234567, 1.0 D1.0\r\n+1.234E-3 VDC\n"[..]);
        let lines = decode_all(&mut codec, &mut buf);
        assert_eq!(
            lines,
            vec![
                InboundLine::Text("FLUKE, 8808A, 1234567, 1.0 D1.0".into()),
                InboundLine::Text("+1.234E-3 VDC".into()),
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_delimiter() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"6.467E-"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"3 VDC\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundLine::Text("6.467E-3 VDC".into()))
        );
    }

    #[test]
    fn flags_binary_garbage() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&[0xff, 0x00, b'A', b'\n', b'O', b'K', b'\n'][..]);
        let lines = decode_all(&mut codec, &mut buf);
        assert!(matches!(lines[0], InboundLine::Malformed { .. }));
        assert_eq!(lines[1], InboundLine::Text("OK".into()));
    }

    #[test]
    fn skips_overlong_line_and_recovers() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789ABCDEF"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"XYZ\nOK\n");
        let lines = decode_all(&mut codec, &mut buf);
        assert_eq!(lines.len(), 2);
        match &lines[0] {
            InboundLine::Malformed { raw, reason } => {
                assert_eq!(raw, b"01234567");
                assert_eq!(*reason, "line exceeds maximum length");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(lines[1], InboundLine::Text("OK".into()));
    }

    #[test]
    fn overlong_line_in_one_chunk() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"123456\nOK\n"[..]);
        let lines = decode_all(&mut codec, &mut buf);
        assert!(matches!(&lines[0], InboundLine::Malformed { raw, .. } if raw == b"1234"));
        assert_eq!(lines[1], InboundLine::Text("OK".into()));
    }

    #[test]
    fn carriage_return_does_not_count_towards_length() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"1234\r"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\n12345\r\n");
        let lines = decode_all(&mut codec, &mut buf);
        assert_eq!(lines[0], InboundLine::Text("1234".into()));
        assert!(matches!(lines[1], InboundLine::Malformed { .. }));
    }

    #[test]
    fn trailing_partial_line_at_eof() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"VAL1?"[..]);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(InboundLine::Text("VAL1?".into()))
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn encodes_with_delimiter() {
        let mut codec = LineCodec::default();
        let mut dst = BytesMut::new();
        codec.encode("*IDN?", &mut dst).unwrap();
        assert_eq!(&dst[..], b"*IDN?\n");
    }

    #[test]
    fn rejects_embedded_delimiters() {
        let mut codec = LineCodec::default();
        let mut dst = BytesMut::new();
        assert!(codec.encode("VAL1?\nVAL2?", &mut dst).is_err());
        assert!(codec.encode("", &mut dst).is_err());
        assert!(dst.is_empty());
    }
}
