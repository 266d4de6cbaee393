//! PostgreSQL `COPY ... FROM STDIN WITH (FORMAT text)` row streams.
//!
//! One record per line, fields separated by a tab, `\N` for NULL. Backslash,
//! newline, carriage return and tab inside a value are written as two-character
//! escapes, so a raw tab or newline in the stream is always structural and the
//! literal text `\N` can never be mistaken for NULL (it is sent as `\\N`).
//!
//! Values the text format cannot carry are rejected instead of being mangled:
//! strings containing a NUL byte and non-finite floats.
//!
//! The decoder follows the server's reading rules (including octal and hex
//! escapes) so tests can check that what we send parses back to the same fields.

use thiserror::Error;

/// Field separator.
pub const DELIMITER: char = '\t';

/// Whole-field marker for NULL.
pub const NULL_MARKER: &str = "\\N";

/// End-of-data marker accepted by the server on a line of its own.
pub const END_OF_DATA: &str = "\\.";

#[derive(Debug, Error, PartialEq)]
pub enum EncodeError {
    #[error("field {field} contains a NUL byte, which COPY text cannot carry")]
    NulByte { field: usize },
    #[error("field {field} is not a finite number ({value})")]
    NonFinite { field: usize, value: f64 },
    #[error("row has {got} fields, expected {expected}")]
    Arity { expected: usize, got: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("line {line}: {got} fields, expected {expected}")]
    Arity {
        line: usize,
        expected: usize,
        got: usize,
    },
    #[error("line {line}: dangling backslash at end of field")]
    TrailingBackslash { line: usize },
    #[error("line {line}: escape sequence produced invalid UTF-8")]
    InvalidUtf8 { line: usize },
}

/// A value that knows how to lay itself out as one COPY row.
pub trait CopyRecord {
    /// Number of fields written by [`CopyRecord::encode`].
    const ARITY: usize;

    /// Push exactly `ARITY` fields. The caller terminates the row.
    fn encode(&self, row: &mut CopyBuffer) -> Result<(), EncodeError>;
}

/// Accumulates rows of a fixed arity into a COPY text payload.
///
/// A failed push discards the partially written row, so the buffer only ever
/// holds complete lines.
#[derive(Debug, Clone)]
pub struct CopyBuffer {
    arity: usize,
    buf: String,
    field: usize,
    rows: usize,
    row_start: usize,
}

impl CopyBuffer {
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            buf: String::new(),
            field: 0,
            rows: 0,
            row_start: 0,
        }
    }

    pub fn with_capacity(arity: usize, bytes: usize) -> Self {
        Self {
            buf: String::with_capacity(bytes),
            ..Self::new(arity)
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Complete rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Payload bytes of the complete rows.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf[..self.row_start].as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.buf[..self.row_start]
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.field = 0;
        self.rows = 0;
        self.row_start = 0;
    }

    /// Append a text field, escaping the characters that are structural in the stream.
    pub fn text(&mut self, value: &str) -> Result<&mut Self, EncodeError> {
        if value.contains('\0') {
            return Err(self.fail(EncodeError::NulByte { field: self.field }));
        }
        self.begin_field()?;
        for ch in value.chars() {
            match ch {
                '\\' => self.buf.push_str("\\\\"),
                '\n' => self.buf.push_str("\\n"),
                '\r' => self.buf.push_str("\\r"),
                '\t' => self.buf.push_str("\\t"),
                c => self.buf.push(c),
            }
        }
        Ok(self)
    }

    pub fn null(&mut self) -> Result<&mut Self, EncodeError> {
        self.begin_field()?;
        self.buf.push_str(NULL_MARKER);
        Ok(self)
    }

    pub fn opt_text(&mut self, value: Option<&str>) -> Result<&mut Self, EncodeError> {
        match value {
            Some(v) => self.text(v),
            None => self.null(),
        }
    }

    /// Append a float. `Display` for `f64` prints the shortest string that parses
    /// back to the same value, and never uses exponent notation.
    pub fn float(&mut self, value: f64) -> Result<&mut Self, EncodeError> {
        if !value.is_finite() {
            return Err(self.fail(EncodeError::NonFinite {
                field: self.field,
                value,
            }));
        }
        self.begin_field()?;
        use std::fmt::Write as _;
        // Writing to a String cannot fail.
        let _ = write!(self.buf, "{value}");
        Ok(self)
    }

    pub fn opt_float(&mut self, value: Option<f64>) -> Result<&mut Self, EncodeError> {
        match value {
            Some(v) => self.float(v),
            None => self.null(),
        }
    }

    /// Terminate the current row. Fails (and drops the row) when it does not
    /// have exactly `arity` fields.
    pub fn end_row(&mut self) -> Result<(), EncodeError> {
        if self.field != self.arity {
            let got = self.field;
            return Err(self.fail(EncodeError::Arity {
                expected: self.arity,
                got,
            }));
        }
        self.buf.push('\n');
        self.field = 0;
        self.rows += 1;
        self.row_start = self.buf.len();
        Ok(())
    }

    /// Encode one record as a complete row.
    pub fn push_record<R: CopyRecord>(&mut self, record: &R) -> Result<(), EncodeError> {
        debug_assert_eq!(R::ARITY, self.arity, "record arity does not match buffer");
        match record.encode(self) {
            Ok(()) => self.end_row(),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn begin_field(&mut self) -> Result<(), EncodeError> {
        if self.field == self.arity {
            return Err(self.fail(EncodeError::Arity {
                expected: self.arity,
                got: self.arity + 1,
            }));
        }
        if self.field > 0 {
            self.buf.push(DELIMITER);
        }
        self.field += 1;
        Ok(())
    }

    fn fail(&mut self, err: EncodeError) -> EncodeError {
        self.buf.truncate(self.row_start);
        self.field = 0;
        err
    }
}

/// Encode a slice of records into a fresh buffer.
pub fn encode_records<R: CopyRecord>(records: &[R]) -> Result<CopyBuffer, EncodeError> {
    let mut buffer = CopyBuffer::with_capacity(R::ARITY, records.len() * 48);
    for record in records {
        buffer.push_record(record)?;
    }
    Ok(buffer)
}

/// Split one line (without its terminating newline) into fields.
pub fn decode_line(line: &str) -> Result<Vec<Option<String>>, DecodeError> {
    decode_numbered(line, 1)
}

/// Decode a whole payload, checking every row against `arity`.
///
/// Stops at an end-of-data line (`\.`) if one is present.
pub fn decode(data: &str, arity: usize) -> Result<Vec<Vec<Option<String>>>, DecodeError> {
    let mut rows = Vec::new();
    if data.is_empty() {
        return Ok(rows);
    }
    let body = data.strip_suffix('\n').unwrap_or(data);
    for (i, line) in body.split('\n').enumerate() {
        if line == END_OF_DATA {
            break;
        }
        let line_no = i + 1;
        let fields = decode_numbered(line, line_no)?;
        if fields.len() != arity {
            return Err(DecodeError::Arity {
                line: line_no,
                expected: arity,
                got: fields.len(),
            });
        }
        rows.push(fields);
    }
    Ok(rows)
}

fn decode_numbered(line: &str, line_no: usize) -> Result<Vec<Option<String>>, DecodeError> {
    line.split(DELIMITER)
        .map(|raw| {
            if raw == NULL_MARKER {
                Ok(None)
            } else {
                unescape(raw, line_no).map(Some)
            }
        })
        .collect()
}

fn unescape(raw: &str, line: usize) -> Result<String, DecodeError> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        let Some(&next) = bytes.get(i + 1) else {
            return Err(DecodeError::TrailingBackslash { line });
        };
        i += 2;
        match next {
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'0'..=b'7' => {
                let mut value = u32::from(next - b'0');
                let mut taken = 0;
                while taken < 2 {
                    match bytes.get(i) {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                            taken += 1;
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            b'x' if bytes.get(i).is_some_and(u8::is_ascii_hexdigit) => {
                let mut value = 0u8;
                let mut taken = 0;
                while taken < 2 {
                    match bytes.get(i).and_then(|d| (*d as char).to_digit(16)) {
                        Some(d) => {
                            value = value * 16 + d as u8;
                            i += 1;
                            taken += 1;
                        }
                        None => break,
                    }
                }
                out.push(value);
            }
            // Any other escaped byte stands for itself.
            other => out.push(other),
        }
    }
    String::from_utf8(out).map_err(|_| DecodeError::InvalidUtf8 { line })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Term {
        study: String,
        contrast: Option<String>,
        term: String,
        weight: f64,
    }

    impl CopyRecord for Term {
        const ARITY: usize = 4;

        fn encode(&self, row: &mut CopyBuffer) -> Result<(), EncodeError> {
            row.text(&self.study)?
                .opt_text(self.contrast.as_deref())?
                .text(&self.term)?
                .float(self.weight)?;
            Ok(())
        }
    }

    fn term(study: &str, contrast: Option<&str>, term: &str, weight: f64) -> Term {
        Term {
            study: study.to_string(),
            contrast: contrast.map(str::to_string),
            term: term.to_string(),
            weight,
        }
    }

    fn parse_back(buffer: &CopyBuffer) -> Vec<Term> {
        decode(buffer.as_str(), 4)
            .unwrap()
            .into_iter()
            .map(|mut fields| {
                let weight = fields[3].take().unwrap().parse::<f64>().unwrap();
                Term {
                    study: fields[0].take().unwrap(),
                    contrast: fields[1].take(),
                    term: fields[2].take().unwrap(),
                    weight,
                }
            })
            .collect()
    }

    // --- round trip ---

    fn arb_field() -> impl Strategy<Value = String> {
        prop_oneof![
            3 => "[\\\\\t\n\rN.a-z ]{0,12}",
            1 => "[^\\x00]{0,8}",
        ]
    }

    fn arb_weight() -> impl Strategy<Value = f64> {
        prop::num::f64::POSITIVE | prop::num::f64::NORMAL | prop::num::f64::SUBNORMAL
    }

    fn arb_term() -> impl Strategy<Value = Term> {
        (arb_field(), prop::option::of(arb_field()), arb_field(), arb_weight()).prop_map(
            |(study, contrast, term, weight)| Term {
                study,
                contrast,
                term,
                weight,
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_round_trip_recovers_every_field(records in prop::collection::vec(arb_term(), 0..16)) {
            let buffer = encode_records(&records).unwrap();
            prop_assert_eq!(buffer.rows(), records.len());
            prop_assert_eq!(buffer.as_str().lines().count(), records.len());
            prop_assert_eq!(parse_back(&buffer), records);
        }
    }

    #[test]
    fn null_and_empty_string_stay_distinct() {
        let records = vec![term("s", None, "t", 1.0), term("s", Some(""), "t", 1.0)];
        let buffer = encode_records(&records).unwrap();
        assert_eq!(buffer.as_str(), "s\t\\N\tt\t1\ns\t\tt\t1\n");

        let decoded = parse_back(&buffer);
        assert_eq!(decoded[0].contrast, None);
        assert_eq!(decoded[1].contrast, Some(String::new()));
    }

    #[test]
    fn literal_null_marker_is_escaped() {
        let mut buffer = CopyBuffer::new(1);
        buffer.text("\\N").unwrap();
        buffer.end_row().unwrap();
        assert_eq!(buffer.as_str(), "\\\\N\n");
        assert_eq!(decode_line("\\\\N").unwrap(), vec![Some("\\N".to_string())]);
    }

    #[test]
    fn structural_characters_never_appear_raw_inside_fields() {
        let mut buffer = CopyBuffer::new(2);
        buffer.text("a\tb\nc").unwrap().text("d\re").unwrap();
        buffer.end_row().unwrap();
        let line = buffer.as_str().strip_suffix('\n').unwrap();
        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));
        assert_eq!(line.matches('\t').count(), 1);
    }

    #[test]
    fn floats_print_without_exponent_and_parse_exactly() {
        for value in [1e-7, 1e21, 123456.789, 5e-324, 0.30000000000000004] {
            let mut buffer = CopyBuffer::new(1);
            buffer.float(value).unwrap();
            buffer.end_row().unwrap();
            let text = buffer.as_str().trim_end();
            assert!(!text.contains('e'), "{text}");
            assert_eq!(text.parse::<f64>().unwrap(), value);
        }
    }

    // --- rejection ---

    #[test]
    fn rejects_nul_bytes() {
        let mut buffer = CopyBuffer::new(2);
        buffer.text("ok").unwrap();
        assert_eq!(
            buffer.text("bad\0value").unwrap_err(),
            EncodeError::NulByte { field: 1 }
        );
        assert!(buffer.is_empty());
        assert_eq!(buffer.as_str(), "");
    }

    #[test]
    fn rejects_non_finite_floats() {
        let mut buffer = CopyBuffer::new(1);
        assert!(matches!(
            buffer.float(f64::NAN),
            Err(EncodeError::NonFinite { field: 0, .. })
        ));
        assert!(buffer.float(f64::INFINITY).is_err());
        assert!(buffer.float(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn arity_is_enforced_both_ways() {
        let mut buffer = CopyBuffer::new(2);
        buffer.text("one").unwrap();
        assert_eq!(
            buffer.end_row().unwrap_err(),
            EncodeError::Arity {
                expected: 2,
                got: 1
            }
        );

        buffer.text("a").unwrap().text("b").unwrap();
        assert!(matches!(
            buffer.text("c"),
            Err(EncodeError::Arity { expected: 2, .. })
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn failed_record_leaves_earlier_rows_intact() {
        let mut buffer = CopyBuffer::new(4);
        buffer.push_record(&term("s1", None, "a", 1.0)).unwrap();
        assert!(buffer.push_record(&term("s2", None, "b", f64::NAN)).is_err());
        buffer.push_record(&term("s3", None, "c", 2.0)).unwrap();

        assert_eq!(buffer.rows(), 2);
        assert_eq!(buffer.as_str(), "s1\t\\N\ta\t1\ns3\t\\N\tc\t2\n");
    }

    // --- decoder ---

    #[test]
    fn decodes_server_escape_forms() {
        let fields = decode_line("\\101\\x42\\b\\f\\v\\q\\N").unwrap();
        assert_eq!(fields, vec![Some("AB\u{8}\u{c}\u{b}qN".to_string())]);
    }

    #[test]
    fn decode_stops_at_end_marker_and_checks_arity() {
        let rows = decode("a\tb\n\\.\nignored\n", 2).unwrap();
        assert_eq!(rows, vec![vec![Some("a".into()), Some("b".into())]]);

        assert_eq!(
            decode("a\tb\nc\n", 2).unwrap_err(),
            DecodeError::Arity {
                line: 2,
                expected: 2,
                got: 1
            }
        );
        assert!(decode("", 2).unwrap().is_empty());
    }

    #[test]
    fn decode_reports_dangling_backslash() {
        assert_eq!(
            decode_line("abc\\").unwrap_err(),
            DecodeError::TrailingBackslash { line: 1 }
        );
    }
}
