//! Destination-typed SQL literals for fetched row values.
//!
//! Every value is rendered as literal text and later cast to the destination
//! column's declared type (`'…'::timestamp with time zone`, `NULL::integer`),
//! so enum, array and timestamptz columns never depend on implicit casts.

use crate::error::PgCopyError;
use crate::models::{CellValue, DeclaredType, ScalarValue};
use crate::sql;

/// Primary quoting function. Failures fall back to [`sql::naive_quote`].
pub type Quoter = fn(&str) -> Result<String, PgCopyError>;

/// Text codecs tried, in order, when a binary value has to become text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCodec {
    Utf8,
    Latin1,
}

impl TextCodec {
    /// Decode `bytes`, or `None` if they are not valid in this encoding.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Self::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            // Every byte maps to the code point of the same value
            Self::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// Default codec order.
pub const DEFAULT_CODECS: [TextCodec; 2] = [TextCodec::Utf8, TextCodec::Latin1];

/// Renders [`CellValue`]s as SQL literals.
#[derive(Debug, Clone)]
pub struct LiteralEncoder {
    quoter: Quoter,
    codecs: Vec<TextCodec>,
}

impl Default for LiteralEncoder {
    fn default() -> Self {
        Self { quoter: sql::quote_literal, codecs: DEFAULT_CODECS.to_vec() }
    }
}

impl LiteralEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the primary quoting function.
    pub fn with_quoter(mut self, quoter: Quoter) -> Self {
        self.quoter = quoter;
        self
    }

    /// Replace the binary decoding order.
    pub fn with_codecs(mut self, codecs: Vec<TextCodec>) -> Self {
        self.codecs = codecs;
        self
    }

    /// Literal followed by an explicit cast to `ty`.
    pub fn typed(&self, value: &CellValue, ty: &DeclaredType) -> String {
        format!("{}::{}", self.encode(value, ty), ty)
    }

    /// Literal text for `value` bound for a column of type `ty`, without the cast.
    pub fn encode(&self, value: &CellValue, ty: &DeclaredType) -> String {
        match value {
            CellValue::Null => "NULL".to_string(),
            CellValue::Sequence(items) if ty.is_array() => self.quote(&self.array_literal(items)),
            CellValue::Sequence(_) | CellValue::Structured(_) => {
                self.quote(&value.to_json().to_string())
            }
            _ if ty.is_json() => self.quote(&value.to_json().to_string()),
            CellValue::Binary(bytes) if ty.is_bytea() => self.quote(&hex_bytea(bytes)),
            CellValue::Binary(bytes) => match self.decode(bytes) {
                Some(text) => self.quote(&text),
                None => self.quote(&hex_bytea(bytes)),
            },
            CellValue::Scalar(ScalarValue::Bool(b)) => b.to_string(),
            CellValue::Scalar(ScalarValue::Int(i)) => signed_literal(i.to_string()),
            CellValue::Scalar(ScalarValue::Float(f)) => float_literal(*f, |s| self.quote(s)),
            CellValue::Scalar(ScalarValue::Text(s)) => self.quote(s),
        }
    }

    fn quote(&self, text: &str) -> String {
        match (self.quoter)(text) {
            Ok(quoted) => quoted,
            Err(e) => {
                tracing::debug!(error = %e, "Primary quoting failed, using plain quoting");
                sql::naive_quote(text)
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Option<String> {
        self.codecs.iter().find_map(|codec| codec.decode(bytes))
    }

    /// `{a,NULL,"b c"}` array input syntax.
    fn array_literal(&self, items: &[CellValue]) -> String {
        let elements: Vec<String> = items
            .iter()
            .map(|item| match item {
                CellValue::Null => "NULL".to_string(),
                CellValue::Sequence(inner) => self.array_literal(inner),
                other => quote_array_element(&self.element_text(other)),
            })
            .collect();
        format!("{{{}}}", elements.join(","))
    }

    fn element_text(&self, value: &CellValue) -> String {
        match value {
            CellValue::Scalar(ScalarValue::Bool(b)) => b.to_string(),
            CellValue::Scalar(ScalarValue::Int(i)) => i.to_string(),
            CellValue::Scalar(ScalarValue::Float(f)) => float_text(*f),
            CellValue::Scalar(ScalarValue::Text(s)) => s.clone(),
            CellValue::Binary(bytes) => self.decode(bytes).unwrap_or_else(|| hex_bytea(bytes)),
            other => other.to_json().to_string(),
        }
    }
}

fn float_text(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        f.to_string()
    }
}

fn float_literal(f: f64, quote: impl Fn(&str) -> String) -> String {
    if f.is_finite() {
        signed_literal(f.to_string())
    } else {
        quote(&float_text(f))
    }
}

/// `-7::text` parses as `-(7::text)`, so negative numbers are parenthesized
/// before a cast is appended.
fn signed_literal(text: String) -> String {
    if text.starts_with('-') {
        format!("({text})")
    } else {
        text
    }
}

fn hex_bytea(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Double-quote an array element when the array parser would otherwise
/// misread it.
fn quote_array_element(text: &str) -> String {
    let needs_quotes = text.is_empty()
        || text.eq_ignore_ascii_case("NULL")
        || text.chars().any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());

    if !needs_quotes {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(text: &str) -> DeclaredType {
        DeclaredType::from_catalog(text)
    }

    fn always_fails(_: &str) -> Result<String, PgCopyError> {
        Err(PgCopyError::internal("quoting unavailable"))
    }

    #[test]
    fn test_null_is_bare() {
        let enc = LiteralEncoder::new();
        assert_eq!(enc.encode(&CellValue::Null, &ty("text")), "NULL");
        assert_eq!(enc.typed(&CellValue::Null, &ty("integer")), "NULL::integer");
    }

    #[test]
    fn test_simple_string_is_quoted() {
        let enc = LiteralEncoder::new();
        assert_eq!(enc.encode(&CellValue::text("hello"), &ty("text")), "'hello'");
    }

    #[test]
    fn test_text_array_with_null_element() {
        let enc = LiteralEncoder::new();
        let value =
            CellValue::Sequence(vec![CellValue::text("A"), CellValue::Null, CellValue::text("B")]);
        let out = enc.encode(&value, &ty("text[]"));
        assert!(out.starts_with('\''));
        assert!(out.ends_with('\''));
        assert!(out.contains("{A,NULL,B}"));
    }

    #[test]
    fn test_array_elements_with_specials_are_escaped() {
        let enc = LiteralEncoder::new();
        let value = CellValue::Sequence(vec![
            CellValue::text("a,b"),
            CellValue::text("say \"hi\""),
            CellValue::text("it's"),
            CellValue::text("null"),
        ]);
        let out = enc.encode(&value, &ty("text[]"));
        // Backslashes inside the array text switch the driver to E'' syntax
        assert_eq!(out, r#"E'{"a,b","say \\"hi\\"",it''s,"null"}'"#);
    }

    #[test]
    fn test_nested_int_array() {
        let enc = LiteralEncoder::new();
        let value = CellValue::Sequence(vec![
            CellValue::Sequence(vec![CellValue::int(1), CellValue::int(2)]),
            CellValue::Sequence(vec![CellValue::int(3), CellValue::Null]),
        ]);
        assert_eq!(enc.typed(&value, &ty("integer[]")), "'{{1,2},{3,NULL}}'::integer[]");
    }

    #[test]
    fn test_structured_value_for_jsonb_round_trips() {
        let enc = LiteralEncoder::new();
        let value = CellValue::Structured(serde_json::json!({"a": 1}));
        let out = enc.encode(&value, &ty("jsonb"));
        assert!(out.starts_with('\'') && out.ends_with('\''));
        let inner = &out[1..out.len() - 1];
        let parsed: serde_json::Value = serde_json::from_str(inner).unwrap();
        assert_eq!(parsed, serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_json_keeps_non_ascii() {
        let enc = LiteralEncoder::new();
        let value = CellValue::Structured(serde_json::json!({"city": "İzmir"}));
        assert!(enc.encode(&value, &ty("json")).contains("İzmir"));
    }

    #[test]
    fn test_text_into_json_column_is_serialized() {
        let enc = LiteralEncoder::new();
        assert_eq!(enc.encode(&CellValue::text("abc"), &ty("jsonb")), "'\"abc\"'");
    }

    #[test]
    fn test_sequence_into_non_array_column_becomes_json() {
        let enc = LiteralEncoder::new();
        let value = CellValue::Sequence(vec![CellValue::int(1), CellValue::int(2)]);
        assert_eq!(enc.encode(&value, &ty("text")), "'[1,2]'");
    }

    #[test]
    fn test_binary_falls_back_to_latin1() {
        let enc = LiteralEncoder::new();
        // "ümlaut" in Latin-1 is not valid UTF-8
        let raw = vec![0xFC, b'm', b'l', b'a', b'u', b't'];
        let out = enc.encode(&CellValue::Binary(raw), &ty("text"));
        assert_eq!(out, "'ümlaut'");
    }

    #[test]
    fn test_undecodable_binary_uses_hex_text() {
        let enc = LiteralEncoder::new().with_codecs(vec![TextCodec::Utf8]);
        let out = enc.encode(&CellValue::Binary(vec![0xFF, 0x00]), &ty("text"));
        assert_eq!(out, r"E'\\xff00'");
    }

    #[test]
    fn test_binary_into_bytea_is_hex() {
        let enc = LiteralEncoder::new();
        let out = enc.typed(&CellValue::Binary(b"hi".to_vec()), &ty("bytea"));
        assert_eq!(out, r"E'\\x6869'::bytea");
    }

    #[test]
    fn test_fallback_quoting_when_primary_fails() {
        let enc = LiteralEncoder::new().with_quoter(always_fails);
        assert_eq!(enc.encode(&CellValue::text("O'Reilly"), &ty("text")), "'O''Reilly'");
    }

    #[test]
    fn test_driver_quoting_of_apostrophe() {
        let enc = LiteralEncoder::new();
        assert_eq!(enc.encode(&CellValue::text("O'Reilly"), &ty("text")), "'O''Reilly'");
    }

    #[test]
    fn test_nul_text_falls_back_to_plain_quoting() {
        let enc = LiteralEncoder::new();
        assert_eq!(enc.encode(&CellValue::text("a\0b"), &ty("text")), "'a\0b'");
    }

    #[test]
    fn test_numeric_scalars_are_unquoted() {
        let enc = LiteralEncoder::new();
        assert_eq!(enc.typed(&CellValue::int(42), &ty("bigint")), "42::bigint");
        assert_eq!(
            enc.typed(&CellValue::Scalar(ScalarValue::Float(1.5)), &ty("double precision")),
            "1.5::double precision"
        );
        assert_eq!(
            enc.typed(&CellValue::Scalar(ScalarValue::Bool(true)), &ty("boolean")),
            "true::boolean"
        );
    }

    #[test]
    fn test_non_finite_floats_are_quoted() {
        let enc = LiteralEncoder::new();
        let nan = CellValue::Scalar(ScalarValue::Float(f64::NAN));
        let neg_inf = CellValue::Scalar(ScalarValue::Float(f64::NEG_INFINITY));
        assert_eq!(enc.encode(&nan, &ty("real")), "'NaN'");
        assert_eq!(enc.encode(&neg_inf, &ty("real")), "'-Infinity'");
    }

    #[test]
    fn test_enum_and_timestamptz_get_explicit_casts() {
        let enc = LiteralEncoder::new();
        assert_eq!(enc.typed(&CellValue::text("ACTIVE"), &ty("status_enum")), "'ACTIVE'::status_enum");
        assert_eq!(
            enc.typed(
                &CellValue::text("2025-10-07 01:23:45+10"),
                &ty("timestamp with time zone")
            ),
            "'2025-10-07 01:23:45+10'::timestamp with time zone"
        );
    }

    #[test]
    fn test_negative_numbers_keep_sign_under_cast() {
        let enc = LiteralEncoder::new();
        assert_eq!(enc.typed(&CellValue::int(-7), &ty("text")), "(-7)::text");
        assert_eq!(enc.typed(&CellValue::int(-7), &ty("integer")), "(-7)::integer");
        assert_eq!(
            enc.typed(&CellValue::Scalar(ScalarValue::Float(-1.5)), &ty("character varying(10)")),
            "(-1.5)::character varying(10)"
        );
    }

    #[test]
    fn test_negative_array_elements_are_bare() {
        let enc = LiteralEncoder::new();
        let value = CellValue::Sequence(vec![CellValue::int(-1), CellValue::int(2)]);
        assert_eq!(enc.typed(&value, &ty("integer[]")), "'{-1,2}'::integer[]");
    }
}
