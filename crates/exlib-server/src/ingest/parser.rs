//! Incremental dataset parser
//!
//! The dataset is one JSON array of exercise objects. Chunks are fed as
//! they arrive; each top-level element is cut out with a small byte-level
//! scanner and decoded on its own, so one bad element becomes a
//! [`RecordError`] instead of poisoning the whole array, and memory stays
//! bounded by [`MAX_ELEMENT_BYTES`] rather than the dataset.
//!
//! Only the container itself is fatal: a stream that does not open with
//! `[`, carries data after the closing `]`, or ends before it. An element
//! is held back until its delimiter is seen, so junk after it (a stray
//! `}` from unbalanced brackets) turns that element into a [`RecordError`]
//! and scanning resumes at the next top-level `,`.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

use super::exercise::{ExerciseRecord, Normalizer, RawExercise};
use super::fetcher::{ByteStream, FetchError};
use super::jobs::RecordDiagnostic;

/// Elements larger than this are rejected without being buffered
pub const MAX_ELEMENT_BYTES: usize = 1024 * 1024;

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalParseError {
    #[error("Dataset is not a JSON array: found {found:?} at byte {offset}")]
    NotAnArray { offset: u64, found: char },

    #[error("Unexpected {found:?} at byte {offset}")]
    UnexpectedByte { offset: u64, found: char },

    #[error("Trailing data after the closing ']' at byte {offset}")]
    TrailingData { offset: u64 },

    #[error("Dataset is empty")]
    Empty,

    #[error("Dataset ended before the closing ']' after {items} items")]
    Truncated { items: u64 },
}

/// A dataset element that could not become an [`ExerciseRecord`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("record {index}: {message}")]
pub struct RecordError {
    pub index: u64,
    pub external_id: Option<String>,
    pub message: String,
}

impl RecordError {
    pub fn diagnostic(&self) -> RecordDiagnostic {
        RecordDiagnostic {
            index: self.index,
            external_id: self.external_id.clone(),
            message: self.message.clone(),
        }
    }
}

/// One element of the parsed sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedItem {
    Record { index: u64, record: ExerciseRecord },
    Invalid(RecordError),
}

/// Fatal failure while reading the source: transport or container
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] FatalParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    FirstElement,
    NextElement,
    InElement,
    AfterElement,
    Skipping,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Container,
    Text,
    Scalar,
}

/// A completed element waiting for its delimiter
struct Held {
    index: u64,
    bytes: Vec<u8>,
    oversized: bool,
}

pub struct DatasetParser {
    normalizer: Normalizer,
    state: State,
    shape: Shape,
    element: Vec<u8>,
    oversized: bool,
    held: Option<Held>,
    depth: u32,
    in_string: bool,
    escaped: bool,
    next_index: u64,
    offset: u64,
    seen: HashSet<String>,
}

impl DatasetParser {
    pub fn new(normalizer: Normalizer) -> Self {
        Self {
            normalizer,
            state: State::Start,
            shape: Shape::Scalar,
            element: Vec::new(),
            oversized: false,
            held: None,
            depth: 0,
            in_string: false,
            escaped: false,
            next_index: 0,
            offset: 0,
            seen: HashSet::new(),
        }
    }

    /// Elements completed so far
    pub fn items_seen(&self) -> u64 {
        self.next_index
    }

    /// Consume one chunk, returning every element it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ParsedItem>, FatalParseError> {
        let mut items = Vec::new();
        let mut i = 0;

        while i < chunk.len() {
            let byte = chunk[i];
            let offset = self.offset + i as u64;

            match self.state {
                State::Start => {
                    let bom = offset < 3 && byte == UTF8_BOM[offset as usize];
                    if byte == b'[' {
                        self.state = State::FirstElement;
                    } else if !bom && !is_whitespace(byte) {
                        return Err(FatalParseError::NotAnArray {
                            offset,
                            found: char::from(byte),
                        });
                    }
                    i += 1;
                },
                State::FirstElement | State::NextElement => {
                    if is_whitespace(byte) {
                        i += 1;
                    } else if byte == b']' && self.state == State::FirstElement {
                        self.state = State::Done;
                        i += 1;
                    } else if byte == b']' || byte == b',' {
                        return Err(FatalParseError::UnexpectedByte {
                            offset,
                            found: char::from(byte),
                        });
                    } else {
                        self.begin_element(byte);
                    }
                },
                State::InElement => {
                    if self.shape == Shape::Scalar && is_scalar_end(byte) {
                        // terminator belongs to the array, re-read it
                        self.complete_element();
                        continue;
                    }

                    self.push(byte);
                    i += 1;
                    if self.element_closed(byte) {
                        self.complete_element();
                    }
                },
                State::AfterElement => {
                    match byte {
                        b',' | b']' => {
                            items.extend(self.release());
                            self.state = if byte == b',' {
                                State::NextElement
                            } else {
                                State::Done
                            };
                        },
                        b if is_whitespace(b) => {},
                        other => {
                            items.extend(self.reject(other));
                            self.state = State::Skipping;
                            self.depth = 0;
                            self.in_string = false;
                            self.escaped = false;
                            if let Some(next) = self.skip(other) {
                                self.state = next;
                            }
                        },
                    }
                    i += 1;
                },
                State::Skipping => {
                    if let Some(next) = self.skip(byte) {
                        self.state = next;
                    }
                    i += 1;
                },
                State::Done => {
                    if !is_whitespace(byte) {
                        return Err(FatalParseError::TrailingData { offset });
                    }
                    i += 1;
                },
            }
        }

        self.offset += chunk.len() as u64;
        Ok(items)
    }

    /// Signal end of input
    pub fn finish(&mut self) -> Result<Vec<ParsedItem>, FatalParseError> {
        match self.state {
            State::Done => Ok(Vec::new()),
            State::Start => Err(FatalParseError::Empty),
            _ => Err(FatalParseError::Truncated {
                items: self.next_index,
            }),
        }
    }

    /// Parse a complete buffer in one go
    pub fn parse_all(
        normalizer: Normalizer,
        bytes: &[u8],
    ) -> Result<Vec<ParsedItem>, FatalParseError> {
        let mut parser = Self::new(normalizer);
        let mut items = parser.feed(bytes)?;
        items.extend(parser.finish()?);
        Ok(items)
    }

    /// Lazily parse a fetched byte stream
    ///
    /// The sequence ends after the first fatal error.
    pub fn parse_stream(self, bytes: ByteStream) -> BoxStream<'static, Result<ParsedItem, SourceError>> {
        struct Cursor {
            parser: DatasetParser,
            bytes: ByteStream,
            pending: VecDeque<ParsedItem>,
            done: bool,
        }

        let cursor = Cursor {
            parser: self,
            bytes,
            pending: VecDeque::new(),
            done: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(item) = cursor.pending.pop_front() {
                    return Some((Ok(item), cursor));
                }
                if cursor.done {
                    return None;
                }

                let fed = match cursor.bytes.next().await {
                    Some(Ok(chunk)) => feed_chunk(&mut cursor.parser, chunk),
                    Some(Err(e)) => Err(SourceError::Fetch(e)),
                    None => {
                        cursor.done = true;
                        cursor.parser.finish().map_err(SourceError::from)
                    },
                };

                match fed {
                    Ok(items) => cursor.pending.extend(items),
                    Err(e) => {
                        cursor.done = true;
                        return Some((Err(e), cursor));
                    },
                }
            }
        })
        .boxed()
    }

    fn begin_element(&mut self, first: u8) {
        self.state = State::InElement;
        self.element.clear();
        self.oversized = false;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        self.shape = match first {
            b'{' | b'[' => Shape::Container,
            b'"' => Shape::Text,
            _ => Shape::Scalar,
        };
    }

    fn push(&mut self, byte: u8) {
        if self.oversized {
            return;
        }
        if self.element.len() >= MAX_ELEMENT_BYTES {
            // keep scanning to find the end, but stop buffering
            self.oversized = true;
            self.element = Vec::new();
            return;
        }
        self.element.push(byte);
    }

    /// Advance inside a string literal; true when the closing quote is seen
    fn string_byte(&mut self, byte: u8) -> bool {
        if self.escaped {
            self.escaped = false;
        } else if byte == b'\\' {
            self.escaped = true;
        } else if byte == b'"' {
            self.in_string = false;
            return true;
        }
        false
    }

    /// Track string and nesting state; true once the element is complete
    fn element_closed(&mut self, byte: u8) -> bool {
        if self.in_string {
            return self.string_byte(byte) && self.shape == Shape::Text;
        }

        match byte {
            b'"' => self.in_string = true,
            b'{' | b'[' => self.depth += 1,
            b'}' | b']' => {
                self.depth = self.depth.saturating_sub(1);
                return self.depth == 0;
            },
            _ => {},
        }
        false
    }

    /// Discard bytes up to the next top-level delimiter, returning the state it leads to
    fn skip(&mut self, byte: u8) -> Option<State> {
        if self.in_string {
            self.string_byte(byte);
            return None;
        }

        match byte {
            b'"' => self.in_string = true,
            b'{' | b'[' => self.depth += 1,
            b'}' => self.depth = self.depth.saturating_sub(1),
            b']' if self.depth > 0 => self.depth -= 1,
            b']' => return Some(State::Done),
            b',' if self.depth == 0 => return Some(State::NextElement),
            _ => {},
        }
        None
    }

    fn complete_element(&mut self) {
        self.state = State::AfterElement;
        self.held = Some(Held {
            index: self.next_index,
            bytes: std::mem::take(&mut self.element),
            oversized: self.oversized,
        });
        self.next_index += 1;
    }

    /// The held element is properly delimited; decode it
    fn release(&mut self) -> Option<ParsedItem> {
        let held = self.held.take()?;
        if held.oversized {
            return Some(ParsedItem::Invalid(RecordError {
                index: held.index,
                external_id: None,
                message: format!("element exceeds {MAX_ELEMENT_BYTES} bytes"),
            }));
        }
        Some(self.decode(held.index, &held.bytes))
    }

    /// The held element is followed by junk; it cannot be trusted
    fn reject(&mut self, found: u8) -> Option<ParsedItem> {
        let held = self.held.take()?;
        let external_id = if held.oversized {
            None
        } else {
            element_id(&held.bytes)
        };
        Some(ParsedItem::Invalid(RecordError {
            index: held.index,
            external_id,
            message: format!("unexpected {:?} after element", char::from(found)),
        }))
    }

    fn decode(&mut self, index: u64, bytes: &[u8]) -> ParsedItem {
        let invalid = |external_id: Option<String>, message: String| {
            ParsedItem::Invalid(RecordError {
                index,
                external_id,
                message,
            })
        };

        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => return invalid(None, format!("malformed JSON: {e}")),
        };

        if !value.is_object() {
            return invalid(None, "element is not an object".to_string());
        }

        let external_id = value_id(&value);

        let raw: RawExercise = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => return invalid(external_id, format!("invalid exercise: {e}")),
        };

        let record = match self.normalizer.normalize(raw) {
            Ok(record) => record,
            Err(message) => return invalid(external_id, message),
        };

        if !self.seen.insert(record.external_id.clone()) {
            return invalid(
                Some(record.external_id.clone()),
                format!("duplicate id `{}` in dataset", record.external_id),
            );
        }

        ParsedItem::Record { index, record }
    }
}

fn value_id(value: &Value) -> Option<String> {
    value
        .get("id")
        .and_then(Value::as_str)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn element_id(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(bytes).ok().as_ref().and_then(value_id)
}

fn feed_chunk(parser: &mut DatasetParser, chunk: Bytes) -> Result<Vec<ParsedItem>, SourceError> {
    parser.feed(&chunk).map_err(SourceError::from)
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

fn is_scalar_end(byte: u8) -> bool {
    byte == b',' || byte == b']' || is_whitespace(byte)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    const TWO_RECORDS: &str = r#"[
        {"id": "Air_Bike", "name": "Air Bike", "level": "beginner",
         "primaryMuscles": ["abdominals"], "instructions": ["Lie flat, then pedal."]},
        {"id": "Ab_Roller", "name": "Ab Roller", "equipment": "other",
         "instructions": ["Hold the \"roller\" } with both hands ]"]}
    ]"#;

    fn parse(input: &str) -> Result<Vec<ParsedItem>, FatalParseError> {
        DatasetParser::parse_all(Normalizer::default(), input.as_bytes())
    }

    fn ids(items: &[ParsedItem]) -> Vec<String> {
        items
            .iter()
            .filter_map(|item| match item {
                ParsedItem::Record { record, .. } => Some(record.external_id.clone()),
                ParsedItem::Invalid(_) => None,
            })
            .collect()
    }

    fn errors(items: &[ParsedItem]) -> Vec<&RecordError> {
        items
            .iter()
            .filter_map(|item| match item {
                ParsedItem::Invalid(err) => Some(err),
                ParsedItem::Record { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_parses_records_in_order() {
        let items = parse(TWO_RECORDS).unwrap();
        assert_eq!(ids(&items), vec!["Air_Bike", "Ab_Roller"]);
        assert!(errors(&items).is_empty());
    }

    #[test]
    fn test_brackets_inside_strings_do_not_split() {
        let items = parse(TWO_RECORDS).unwrap();
        let ParsedItem::Record { record, .. } = &items[1] else {
            panic!("expected a record");
        };
        assert_eq!(
            record.attributes.instructions,
            vec!["Hold the \"roller\" } with both hands ]"]
        );
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_buffer() {
        let whole = parse(TWO_RECORDS).unwrap();

        let mut parser = DatasetParser::new(Normalizer::default());
        let mut items = Vec::new();
        for byte in TWO_RECORDS.as_bytes() {
            items.extend(parser.feed(std::slice::from_ref(byte)).unwrap());
        }
        items.extend(parser.finish().unwrap());

        assert_eq!(items, whole);
    }

    #[test]
    fn test_empty_array() {
        assert!(parse("  [ ]  ").unwrap().is_empty());
    }

    #[test]
    fn test_bom_is_skipped() {
        let mut input = UTF8_BOM.to_vec();
        input.extend_from_slice(br#"[{"id":"a","name":"A"}]"#);
        let items = DatasetParser::parse_all(Normalizer::default(), &input).unwrap();
        assert_eq!(ids(&items), vec!["a"]);
    }

    #[test]
    fn test_malformed_record_is_not_fatal() {
        let items = parse(
            r#"[{"id":"a","name":"A"}, {"id":"b","name": }, 42, {"id":"c","name":"C"}]"#,
        )
        .unwrap();

        assert_eq!(ids(&items), vec!["a", "c"]);
        let errs = errors(&items);
        assert_eq!(errs.len(), 2);
        assert_eq!(errs[0].index, 1);
        assert!(errs[0].message.contains("malformed JSON"));
        assert_eq!(errs[1].index, 2);
        assert_eq!(errs[1].message, "element is not an object");
    }

    #[test]
    fn test_missing_name_keeps_identity() {
        let items = parse(r#"[{"id":"Air_Bike","force":"pull"}]"#).unwrap();
        let errs = errors(&items);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].external_id.as_deref(), Some("Air_Bike"));
    }

    #[test]
    fn test_duplicate_id_is_record_error() {
        let items = parse(
            r#"[{"id":"a","name":"First"},{"id":"a","name":"Second"},{"id":"b","name":"B"}]"#,
        )
        .unwrap();

        assert_eq!(ids(&items), vec!["a", "b"]);
        let errs = errors(&items);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].index, 1);
        assert!(errs[0].message.contains("duplicate"));
    }

    #[test]
    fn test_not_an_array_is_fatal() {
        let err = parse(r#"{"id":"a","name":"A"}"#).unwrap_err();
        assert_eq!(err, FatalParseError::NotAnArray { offset: 0, found: '{' });
        assert!(matches!(parse("<html>"), Err(FatalParseError::NotAnArray { .. })));
    }

    #[test]
    fn test_empty_input_is_fatal() {
        assert_eq!(parse("   ").unwrap_err(), FatalParseError::Empty);
    }

    #[test]
    fn test_truncated_is_fatal() {
        let err = parse(r#"[{"id":"a","name":"A"}, {"id":"b""#).unwrap_err();
        assert_eq!(err, FatalParseError::Truncated { items: 1 });
    }

    #[test]
    fn test_trailing_data_is_fatal() {
        assert!(matches!(
            parse(r#"[{"id":"a","name":"A"}] x"#),
            Err(FatalParseError::TrailingData { .. })
        ));
    }

    #[test]
    fn test_trailing_comma_is_fatal() {
        assert!(matches!(
            parse(r#"[{"id":"a","name":"A"},]"#),
            Err(FatalParseError::UnexpectedByte { found: ']', .. })
        ));
    }

    #[test]
    fn test_unbalanced_record_is_not_fatal() {
        let items = parse(
            r#"[{"id":"a","name":"A"},{"id":"b","name":"B"}},{"id":"c","name":"C"}]"#,
        )
        .unwrap();

        assert_eq!(ids(&items), vec!["a", "c"]);
        let errs = errors(&items);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].index, 1);
        assert_eq!(errs[0].external_id.as_deref(), Some("b"));
        assert_eq!(errs[0].message, "unexpected '}' after element");
    }

    #[test]
    fn test_junk_is_skipped_to_next_top_level_comma() {
        let items = parse(
            r#"[{"id":"a","name":"A"} x ["s,]", {"k": ","}], {"id":"b","name":"B"}]"#,
        )
        .unwrap();

        assert_eq!(ids(&items), vec!["b"]);
        let errs = errors(&items);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].index, 0);
        assert_eq!(errs[0].external_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_missing_separator_is_record_error() {
        let items = parse(r#"[{"id":"a","name":"A"} {"id":"b","name":"B"}]"#).unwrap();
        assert!(ids(&items).is_empty());
        let errs = errors(&items);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].message, "unexpected '{' after element");
    }

    #[test]
    fn test_junk_then_eof_is_truncated() {
        assert_eq!(
            parse(r#"[{"id":"a","name":"A"}} {"#).unwrap_err(),
            FatalParseError::Truncated { items: 1 }
        );
    }

    #[test]
    fn test_oversized_element_is_record_error() {
        let big = "x".repeat(MAX_ELEMENT_BYTES + 10);
        let input = format!(
            r#"[{{"id":"a","name":"A"}}, {{"id":"big","name":"Big","instructions":["{big}"]}}, {{"id":"c","name":"C"}}]"#
        );

        let mut parser = DatasetParser::new(Normalizer::default());
        let mut items = Vec::new();
        for chunk in input.as_bytes().chunks(64 * 1024) {
            items.extend(parser.feed(chunk).unwrap());
        }
        items.extend(parser.finish().unwrap());

        assert_eq!(ids(&items), vec!["a", "c"]);
        let errs = errors(&items);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].index, 1);
        assert_eq!(errs[0].external_id, None);
        assert!(errs[0].message.contains("exceeds"));
        assert_eq!(parser.items_seen(), 3);
    }

    #[test]
    fn test_scalar_elements_are_cut_at_separators() {
        let items = parse(r#"[1,"two" , null]"#).unwrap();
        assert_eq!(items.len(), 3);
        assert!(errors(&items).iter().all(|e| e.message == "element is not an object"));
    }

    #[tokio::test]
    async fn test_parse_stream_yields_items_then_ends() {
        let chunks: Vec<Result<Bytes, FetchError>> = vec![
            Ok(Bytes::from_static(br#"[{"id":"a","na"#)),
            Ok(Bytes::from_static(br#"me":"A"},{"id":"b","name":"B"}]"#)),
        ];
        let bytes: ByteStream = stream::iter(chunks).boxed();

        let items: Vec<ParsedItem> = DatasetParser::new(Normalizer::default())
            .parse_stream(bytes)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids(&items), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_parse_stream_surfaces_transport_failure() {
        let chunks: Vec<Result<Bytes, FetchError>> = vec![
            Ok(Bytes::from_static(br#"[{"id":"a","name":"A"},"#)),
            Err(FetchError::Transport("connection reset".to_string())),
        ];
        let bytes: ByteStream = stream::iter(chunks).boxed();

        let results: Vec<Result<ParsedItem, SourceError>> = DatasetParser::new(Normalizer::default())
            .parse_stream(bytes)
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(SourceError::Fetch(FetchError::Transport(_)))));
    }
}
