use std::fmt;

use bytes::Bytes;
use futures_util::{FutureExt, stream};
use serde_json::{Map, Value};

/// Logged in place of image payloads.
pub const IMAGE_PLACEHOLDER: &str = "<image data>";
/// Logged in place of audio payloads.
pub const AUDIO_PLACEHOLDER: &str = "<audio data>";
/// Logged in place of HTML documents.
pub const HTML_PLACEHOLDER: &str = "<html document>";
/// Logged in place of opaque binary payloads.
pub const BINARY_PLACEHOLDER: &str = "<binary data>";
/// Logged for media types the policy does not know about.
pub const UNSUPPORTED_PLACEHOLDER: &str = "<unsupported content type>";
/// Logged when a body could not be read or parsed.
pub const NOT_CAPTURED_PLACEHOLDER: &str = "<not captured>";

/// How a body of a given media type ends up in the exchange record.
///
/// Obtained with [`classify`]. The table is closed: anything it does not list
/// is [`ContentMode::Unsupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    /// `application/json`. Requests are parsed into a key-value map,
    /// responses are pretty-printed.
    Json,
    /// `application/x-www-form-urlencoded`. Requests log the decoded form
    /// fields, responses log the raw text.
    UrlEncodedForm,
    /// `multipart/form-data`. Requests log the query fields and the text
    /// parts, file parts are skipped. Responses log the raw text.
    MultipartForm,
    /// Binary or static content, replaced by the placeholder.
    Redacted(&'static str),
    /// Anything else, including an absent media type.
    Unsupported,
}

/// Strip parameters (`; charset=utf-8`, `; boundary=...`) from a media type
/// and lower-case the rest.
pub fn normalize_media_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Map a raw `Content-Type` value to its [`ContentMode`].
///
/// Never fails; empty or malformed input is [`ContentMode::Unsupported`].
pub fn classify(raw: &str) -> ContentMode {
    let media_type = normalize_media_type(raw);

    match media_type.as_str() {
        "application/json" => ContentMode::Json,
        "application/x-www-form-urlencoded" => ContentMode::UrlEncodedForm,
        "multipart/form-data" => ContentMode::MultipartForm,
        "text/html" => ContentMode::Redacted(HTML_PLACEHOLDER),
        "application/octet-stream" => ContentMode::Redacted(BINARY_PLACEHOLDER),
        other if other.starts_with("image/") => ContentMode::Redacted(IMAGE_PLACEHOLDER),
        other if other.starts_with("audio/") => ContentMode::Redacted(AUDIO_PLACEHOLDER),
        _ => ContentMode::Unsupported,
    }
}

impl ContentMode {
    /// Derive the logged request parameters from the request body and query string.
    ///
    /// `content_type` is the raw header value, multipart bodies need its
    /// `boundary` parameter. An error means the body did not match its declared
    /// media type. Callers are expected to log it and fall back to
    /// [`BodyValue::NotCaptured`].
    pub fn request_params(
        self,
        content_type: &str,
        body: &[u8],
        query: &str,
    ) -> Result<BodyValue, BodyParseError> {
        match self {
            ContentMode::Json => {
                if body.is_empty() {
                    return Ok(BodyValue::NotCaptured);
                }
                let map: Map<String, Value> = serde_json::from_slice(body)?;
                Ok(BodyValue::Structured(map))
            }
            ContentMode::UrlEncodedForm => {
                let mut fields = form_fields(query.as_bytes())?;
                fields.extend(form_fields(body)?);
                Ok(BodyValue::Structured(group_fields(fields)))
            }
            ContentMode::MultipartForm => {
                let mut fields = form_fields(query.as_bytes())?;
                fields.extend(multipart_fields(content_type, body)?);
                Ok(BodyValue::Structured(group_fields(fields)))
            }
            ContentMode::Redacted(placeholder) => Ok(BodyValue::Redacted(placeholder)),
            ContentMode::Unsupported => Ok(BodyValue::Unsupported),
        }
    }

    /// Derive the logged response body from the bytes captured on the way out.
    pub fn response_body(self, captured: &[u8]) -> BodyValue {
        match self {
            ContentMode::Json => match serde_json::from_slice::<Value>(captured) {
                Ok(value) => match serde_json::to_string_pretty(&value) {
                    Ok(pretty) => BodyValue::Pretty(pretty),
                    Err(_) => BodyValue::Raw(String::from_utf8_lossy(captured).into_owned()),
                },
                Err(err) => {
                    log::debug!("response body is not valid JSON, logging it raw: {err}");
                    BodyValue::Raw(String::from_utf8_lossy(captured).into_owned())
                }
            },
            ContentMode::UrlEncodedForm | ContentMode::MultipartForm => {
                BodyValue::Raw(String::from_utf8_lossy(captured).into_owned())
            }
            ContentMode::Redacted(placeholder) => BodyValue::Redacted(placeholder),
            ContentMode::Unsupported => BodyValue::Unsupported,
        }
    }
}

fn form_fields(input: &[u8]) -> Result<Vec<(String, String)>, BodyParseError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_urlencoded::from_bytes(input)?)
}

// Text parts only. File parts are skipped so uploads never reach the log.
fn multipart_fields(
    content_type: &str,
    body: &[u8],
) -> Result<Vec<(String, String)>, BodyParseError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let boundary = multer::parse_boundary(content_type)?;
    let body = Bytes::copy_from_slice(body);
    let chunks = stream::once(async move { Ok::<_, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(chunks, boundary);

    let decode = async move {
        let mut fields = Vec::new();
        while let Some(field) = multipart.next_field().await? {
            if field.file_name().is_some() {
                continue;
            }
            let name = field.name().unwrap_or_default().to_owned();
            let value = field.text().await?;
            fields.push((name, value));
        }
        Ok::<_, multer::Error>(fields)
    };

    // the whole body is already in memory, so decoding never waits
    match decode.now_or_never() {
        Some(fields) => Ok(fields?),
        None => Err(BodyParseError::IncompleteMultipart),
    }
}

// Repeated keys collapse into an array, in order of appearance.
fn group_fields(fields: Vec<(String, String)>) -> Map<String, Value> {
    let mut map = Map::new();

    for (key, value) in fields {
        match map.get_mut(&key) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                map.insert(key, Value::String(value));
            }
        }
    }

    map
}

/// A request or response body as it appears in the exchange record.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyValue {
    /// The body could not be read or did not parse.
    NotCaptured,
    /// Decoded request parameters.
    Structured(Map<String, Value>),
    /// Re-indented JSON document.
    Pretty(String),
    /// Captured text, logged verbatim.
    Raw(String),
    /// Content that must never be logged, replaced by a placeholder.
    Redacted(&'static str),
    /// Media type outside of the policy table.
    Unsupported,
}

impl fmt::Display for BodyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyValue::NotCaptured => f.write_str(NOT_CAPTURED_PLACEHOLDER),
            BodyValue::Structured(map) => match serde_json::to_string(map) {
                Ok(json) => f.write_str(&json),
                Err(_) => f.write_str(NOT_CAPTURED_PLACEHOLDER),
            },
            BodyValue::Pretty(text) | BodyValue::Raw(text) => f.write_str(text),
            BodyValue::Redacted(placeholder) => f.write_str(placeholder),
            BodyValue::Unsupported => f.write_str(UNSUPPORTED_PLACEHOLDER),
        }
    }
}

/// Failure to decode a request body according to its declared media type.
#[derive(Debug, thiserror::Error)]
pub enum BodyParseError {
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed form body: {0}")]
    Form(#[from] serde_urlencoded::de::Error),
    #[error("malformed multipart body: {0}")]
    Multipart(#[from] multer::Error),
    #[error("multipart body ended before its closing boundary")]
    IncompleteMultipart,
}
