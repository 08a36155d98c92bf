//! Streaming reader for large GeoJSON feature collections
//!
//! The reader walks the document byte by byte, skips every top-level member
//! other than `features` and hands out one array element at a time. Only the
//! bytes of the current feature are buffered, so memory stays flat whatever
//! the size of the source. Members other than `features` are still checked
//! for well-formed JSON. There is no seeking: to read again, reopen.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::de::IgnoredAny;

use crate::error::{LoadError, Result};
use crate::feature::Feature;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    /// Looking for the `features` member of the top-level object
    Seeking,
    /// Inside the features array; `first` until an element has been read
    InArray { first: bool },
    Done,
}

/// Lazy, forward-only sequence of features from a serialized collection
pub struct FeatureStreamReader<R> {
    reader: R,
    offset: u64,
    state: ReaderState,
    scratch: Vec<u8>,
}

impl FeatureStreamReader<BufReader<File>> {
    /// Open a GeoJSON file for streaming
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::with_capacity(READ_BUFFER_SIZE, file)))
    }
}

impl<R: BufRead> FeatureStreamReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            state: ReaderState::Seeking,
            scratch: Vec::new(),
        }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn error(&self, message: impl Into<String>) -> LoadError {
        LoadError::Parse {
            offset: self.offset,
            message: message.into(),
        }
    }

    fn peek(&mut self) -> Result<Option<u8>> {
        let buf = self.reader.fill_buf()?;
        Ok(buf.first().copied())
    }

    fn bump(&mut self) {
        self.reader.consume(1);
        self.offset += 1;
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        let byte = self.peek()?;
        if byte.is_some() {
            self.bump();
        }
        Ok(byte)
    }

    fn require_byte(&mut self) -> Result<u8> {
        self.next_byte()?
            .ok_or_else(|| self.error("unexpected end of input"))
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        while let Some(byte) = self.peek()? {
            if !byte.is_ascii_whitespace() {
                break;
            }
            self.bump();
        }
        Ok(())
    }

    fn expect(&mut self, wanted: u8) -> Result<()> {
        self.skip_whitespace()?;
        let byte = self.require_byte()?;
        if byte == wanted {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected '{}' but found '{}'",
                wanted as char, byte as char
            )))
        }
    }

    /// Read the rest of a string whose opening quote was consumed
    fn scan_string_body(&mut self, capture: bool) -> Result<()> {
        let mut escaped = false;
        loop {
            let byte = self.require_byte()?;
            if capture {
                self.scratch.push(byte);
            }
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                return Ok(());
            }
        }
    }

    /// Consume one JSON value, copying its bytes into `scratch` if asked
    fn scan_value(&mut self, capture: bool) -> Result<()> {
        self.skip_whitespace()?;
        let first = self
            .peek()?
            .ok_or_else(|| self.error("unexpected end of input"))?;

        match first {
            b'{' | b'[' => {
                // closers still owed, innermost last
                let mut open: Vec<u8> = Vec::new();
                loop {
                    let byte = self.require_byte()?;
                    if capture {
                        self.scratch.push(byte);
                    }
                    match byte {
                        b'"' => self.scan_string_body(capture)?,
                        b'{' => open.push(b'}'),
                        b'[' => open.push(b']'),
                        b'}' | b']' => {
                            if open.pop() != Some(byte) {
                                return Err(self.error(format!("mismatched '{}'", byte as char)));
                            }
                            if open.is_empty() {
                                return Ok(());
                            }
                        }
                        _ => {}
                    }
                }
            }
            b'"' => {
                self.bump();
                if capture {
                    self.scratch.push(b'"');
                }
                self.scan_string_body(capture)
            }
            _ => {
                let start = self.offset;
                while let Some(byte) = self.peek()? {
                    if matches!(byte, b',' | b'}' | b']') || byte.is_ascii_whitespace() {
                        break;
                    }
                    if capture {
                        self.scratch.push(byte);
                    }
                    self.bump();
                }
                if self.offset == start {
                    return Err(self.error(format!("unexpected '{}'", first as char)));
                }
                Ok(())
            }
        }
    }

    /// Consume a member value that is not `features`, checking it is valid JSON
    fn skip_member_value(&mut self) -> Result<()> {
        self.skip_whitespace()?;
        let start = self.offset;
        self.scratch.clear();
        self.scan_value(true)?;
        serde_json::from_slice::<IgnoredAny>(&self.scratch)
            .map(|_| ())
            .map_err(|e| LoadError::Parse {
                offset: start,
                message: format!("invalid member value: {e}"),
            })
    }

    /// Only whitespace may follow the top-level object
    fn expect_end(&mut self) -> Result<()> {
        self.skip_whitespace()?;
        match self.peek()? {
            None => Ok(()),
            Some(other) => Err(self.error(format!(
                "trailing '{}' after the collection",
                other as char
            ))),
        }
    }

    /// Read the members after the `features` array up to the closing brace
    fn finish_document(&mut self) -> Result<()> {
        loop {
            self.skip_whitespace()?;
            match self.peek()? {
                Some(b'}') => {
                    self.bump();
                    return self.expect_end();
                }
                Some(b',') => self.bump(),
                Some(other) => {
                    return Err(self.error(format!(
                        "expected ',' or '}}' but found '{}'",
                        other as char
                    )))
                }
                None => return Err(self.error("unexpected end of input after features")),
            }

            self.expect(b'"')?;
            self.scan_string_body(false)?;
            self.expect(b':')?;
            self.skip_member_value()?;
        }
    }

    /// Position the reader just inside the `features` array
    ///
    /// Returns false when the top-level object has no `features` member.
    fn seek_features(&mut self) -> Result<bool> {
        self.expect(b'{')?;
        let mut first_member = true;

        loop {
            self.skip_whitespace()?;
            match self.peek()? {
                Some(b'}') => {
                    self.bump();
                    self.expect_end()?;
                    return Ok(false);
                }
                Some(b',') if !first_member => self.bump(),
                Some(_) if first_member => {}
                Some(other) => {
                    return Err(self.error(format!(
                        "expected ',' or '}}' but found '{}'",
                        other as char
                    )))
                }
                None => return Err(self.error("unexpected end of input")),
            }
            first_member = false;

            self.expect(b'"')?;
            self.scratch.clear();
            self.scan_string_body(true)?;
            let is_features = self.scratch.as_slice() == b"features\"";
            self.expect(b':')?;

            if is_features {
                self.skip_whitespace()?;
                match self.peek()? {
                    Some(b'[') => {
                        self.bump();
                        return Ok(true);
                    }
                    _ => return Err(self.error("\"features\" is not an array")),
                }
            }
            self.skip_member_value()?;
        }
    }

    fn read_feature(&mut self, first: bool) -> Result<Option<Feature>> {
        self.skip_whitespace()?;
        match self.peek()? {
            Some(b']') => {
                self.bump();
                return Ok(None);
            }
            Some(b',') if !first => self.bump(),
            Some(_) if first => {}
            Some(other) => {
                return Err(self.error(format!(
                    "expected ',' or ']' but found '{}'",
                    other as char
                )))
            }
            None => return Err(self.error("unexpected end of input inside features")),
        }

        self.skip_whitespace()?;
        let start = self.offset;
        self.scratch.clear();
        self.scan_value(true)?;

        serde_json::from_slice::<Feature>(&self.scratch)
            .map(Some)
            .map_err(|e| LoadError::Parse {
                offset: start,
                message: format!("invalid feature: {e}"),
            })
    }

    fn advance(&mut self) -> Result<Option<Feature>> {
        loop {
            match self.state {
                ReaderState::Done => return Ok(None),
                ReaderState::Seeking => {
                    self.state = if self.seek_features()? {
                        ReaderState::InArray { first: true }
                    } else {
                        ReaderState::Done
                    };
                }
                ReaderState::InArray { first } => {
                    return match self.read_feature(first)? {
                        Some(feature) => {
                            self.state = ReaderState::InArray { first: false };
                            Ok(Some(feature))
                        }
                        None => {
                            self.state = ReaderState::Done;
                            self.finish_document()?;
                            Ok(None)
                        }
                    };
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for FeatureStreamReader<R> {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(feature)) => Some(Ok(feature)),
            Ok(None) => None,
            Err(e) => {
                // a framing error ends the stream
                self.state = ReaderState::Done;
                Some(Err(e))
            }
        }
    }
}

/// Count the features of a collection in one streaming pass
pub fn count_features(path: impl AsRef<Path>) -> Result<u64> {
    let mut count = 0u64;
    for feature in FeatureStreamReader::open(path)? {
        feature?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(input: &str) -> Result<Vec<Feature>> {
        FeatureStreamReader::new(Cursor::new(input.as_bytes().to_vec())).collect()
    }

    #[test]
    fn test_reads_features_in_order() {
        let input = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [1, 2]}, "properties": {"n": 1}},
                {"type": "Feature", "geometry": null, "properties": {"n": 2}}
            ]
        }"#;

        let features = read_all(input).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].properties.as_ref().unwrap()["n"], 1);
        assert!(features[1].geometry.is_none());
    }

    #[test]
    fn test_skips_members_before_features() {
        let input = r#"{"type":"FeatureCollection","name":"a \"quoted\" ]}name","crs":{"type":"name","properties":{"name":"[x]"}},"bbox":[0,1,2,3],"count":7,"ok":true,"features":[{"type":"Feature","geometry":null,"properties":{}}]}"#;
        assert_eq!(read_all(input).unwrap().len(), 1);
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_framing() {
        let input = r#"{"features":[{"type":"Feature","geometry":null,"properties":{"note":"}{][\\"}},{"type":"Feature","geometry":null,"properties":{}}]}"#;
        let features = read_all(input).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].properties.as_ref().unwrap()["note"], "}{][\\");
    }

    #[test]
    fn test_empty_and_missing_features() {
        assert!(read_all(r#"{"type":"FeatureCollection","features":[]}"#)
            .unwrap()
            .is_empty());
        assert!(read_all(r#"{"type":"FeatureCollection"}"#).unwrap().is_empty());
        assert!(read_all(" {} ").unwrap().is_empty());
    }

    #[test]
    fn test_truncated_input_is_a_parse_error() {
        let input = r#"{"features":[{"type":"Feature","geometry":null},{"type":"Fea"#;
        let mut reader = FeatureStreamReader::new(Cursor::new(input.as_bytes().to_vec()));

        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
        // the stream is finished after a framing error
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(read_all("[1, 2]"), Err(LoadError::Parse { .. })));
        assert!(matches!(
            read_all(r#"{"features": {"a": 1}}"#),
            Err(LoadError::Parse { .. })
        ));
        assert!(matches!(
            read_all(r#"{"features": [{"type":"Feature"} {"type":"Feature"}]}"#),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_broken_member_before_features_is_rejected() {
        // the mismatched closer in "crs" must not swallow the features array
        let input = r#"{"crs":{"x":[1},"features":[{"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]},"properties":{}}]}}"#;
        assert!(matches!(read_all(input), Err(LoadError::Parse { .. })));

        let input = r#"{"name":{"a" 1},"features":[]}"#;
        match read_all(input) {
            Err(LoadError::Parse { offset, message }) => {
                assert_eq!(offset, 8);
                assert!(message.contains("invalid member value"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_document_must_close_after_features() {
        let truncated = r#"{"type":"FeatureCollection","features":[{"type":"Feature","geometry":null}]"#;
        let mut reader = FeatureStreamReader::new(Cursor::new(truncated.as_bytes().to_vec()));
        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(reader.next(), Some(Err(LoadError::Parse { .. }))));
        assert!(reader.next().is_none());

        let trailing_members = r#"{"features":[{"geometry":null}],"bbox":[0,0,1,1],"name":"x"} "#;
        assert_eq!(read_all(trailing_members).unwrap().len(), 1);

        assert!(matches!(
            read_all(r#"{"features":[],"bbox":[0,0}"#),
            Err(LoadError::Parse { .. })
        ));
        assert!(matches!(
            read_all(r#"{"features":[]} {"#),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_feature_reports_its_offset() {
        let input = r#"{"features":[42]}"#;
        match read_all(input) {
            Err(LoadError::Parse { offset, message }) => {
                assert_eq!(offset, 13);
                assert!(message.contains("invalid feature"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_count_features_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("Delaware.geojson");
        std::fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[{"geometry":null},{"geometry":null},{"geometry":null}]}"#,
        )
        .unwrap();
        assert_eq!(count_features(&path).unwrap(), 3);
    }
}
