//! Custom template filters

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Error, ErrorKind, Value};

/// Base64 encode filter
///
/// Usage: `{{ .Password | b64enc }}`
pub fn b64enc(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// Base64 decode filter
///
/// Usage: `{{ .Encoded | b64dec }}`
pub fn b64dec(value: &str) -> Result<String, Error> {
    let bytes = STANDARD.decode(value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("base64 decode error: {}", e),
        )
    })?;
    String::from_utf8(bytes).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("base64 decode produced invalid UTF-8: {}", e),
        )
    })
}

/// Wrap a value in double quotes, escaping embedded quotes
///
/// Usage: `host: {{ .Host | quote }}`
pub fn quote(value: Value) -> String {
    let s = value.to_string();
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Fail if the value is undefined or none
///
/// Usage: `{{ .Spec.Image | required }}`
pub fn required(value: Value) -> Result<Value, Error> {
    if value.is_undefined() || value.is_none() {
        Err(Error::new(
            ErrorKind::UndefinedError,
            "required value is undefined",
        ))
    } else {
        Ok(value)
    }
}
