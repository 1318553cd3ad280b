//! Helpers for reading TOML via [`toml_span`].
//!
//! We parse TOML with `toml_span`, so that errors point at the right place in
//! the file, then convert it to JSON and let `serde` do the rest.

use std::borrow::Cow;

use toml_span::{DeserError, value::ValueInner};

use crate::prelude::*;

/// Parse a TOML document and convert it to JSON.
pub(super) fn toml_to_json(toml_str: &str) -> Result<Value> {
    let mut value = toml_span::de::parse(toml_str)
        .map_err(|err| anyhow!("invalid TOML: {err}"))?;
    into_json(&mut value).map_err(|err| {
        let messages = err
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        anyhow!("could not convert TOML: {messages}")
    })
}

/// Convert a parsed TOML value into JSON, consuming its contents.
fn into_json(value: &mut toml_span::Value<'_>) -> Result<Value, DeserError> {
    match value.take() {
        ValueInner::String(cow) => Ok(Value::String(cow.into_owned())),
        ValueInner::Integer(i) => Ok(Value::Number(serde_json::Number::from(i))),
        ValueInner::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| custom_deser_error(value.span, "float must be finite")),
        ValueInner::Boolean(b) => Ok(Value::Bool(b)),
        ValueInner::Array(values) => values
            .into_iter()
            .map(|mut v| into_json(&mut v))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        ValueInner::Table(table) => table
            .into_iter()
            .map(|(k, mut v)| -> Result<(String, Value), DeserError> {
                Ok((k.name.into_owned(), into_json(&mut v)?))
            })
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
    }
}

/// Create a custom [`DeserError`] with a span.
fn custom_deser_error(
    span: toml_span::Span,
    msg: impl Into<Cow<'static, str>>,
) -> DeserError {
    let err_kind = toml_span::ErrorKind::Custom(msg.into());
    let err = toml_span::Error::from((err_kind, span));
    DeserError::from(err)
}
