use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Record content after negotiation: the exact bytes that will be stored
/// (and hashed) plus the content type they are tagged with.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedContent {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    #[error("invalid base64 payload")]
    InvalidBase64,

    #[error("invalid data URI")]
    InvalidDataUri,

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("binary content must be base64-encoded or carry an explicit content type")]
    UndeclaredBinary,
}

/// Negotiate the stored form of a record body.
///
/// `X-Content-Type` is authoritative when present. `X-Record-Type: file`
/// marks a base64-encoded (or data-URI) binary body. Without either, the
/// value decides: data URIs are parsed, JSON bodies are stored as canonical
/// bytes tagged `application/json`, UTF-8 text falls back to `text/plain`.
/// Raw binary without a declared type is rejected.
pub fn resolve_content(
    body: &[u8],
    content_type: Option<&str>,
    x_content_type: Option<&str>,
    x_record_type: Option<&str>,
    max_size: usize,
) -> Result<ResolvedContent, ContentError> {
    let declared = x_content_type.or(content_type).map(strip_params);

    let resolved = if x_record_type.is_some_and(|t| t.eq_ignore_ascii_case("file")) {
        decode_file_body(body, declared)?
    } else {
        match declared {
            Some(t) if is_json_type(t) => ResolvedContent {
                bytes: canonical_json(body)?,
                content_type: "application/json".to_string(),
            },
            Some(t) => ResolvedContent {
                bytes: body.to_vec(),
                content_type: t.to_string(),
            },
            None => detect_content(body)?,
        }
    };

    if resolved.bytes.len() > max_size {
        return Err(ContentError::TooLarge {
            size: resolved.bytes.len(),
            max: max_size,
        });
    }

    Ok(resolved)
}

fn decode_file_body(
    body: &[u8],
    declared: Option<&str>,
) -> Result<ResolvedContent, ContentError> {
    let text = std::str::from_utf8(body).map_err(|_| ContentError::InvalidBase64)?;
    let text = text.trim();

    if text.starts_with("data:") {
        let (bytes, mime) = parse_data_uri(text)?;
        return Ok(ResolvedContent {
            bytes,
            content_type: declared.map(str::to_string).unwrap_or(mime),
        });
    }

    let bytes = BASE64
        .decode(text.as_bytes())
        .map_err(|_| ContentError::InvalidBase64)?;

    Ok(ResolvedContent {
        bytes,
        content_type: declared
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string()),
    })
}

fn detect_content(body: &[u8]) -> Result<ResolvedContent, ContentError> {
    let Ok(text) = std::str::from_utf8(body) else {
        return Err(ContentError::UndeclaredBinary);
    };

    if text.trim_start().starts_with("data:") {
        let (bytes, mime) = parse_data_uri(text.trim())?;
        return Ok(ResolvedContent {
            bytes,
            content_type: mime,
        });
    }

    if let Ok(bytes) = canonical_json(body) {
        return Ok(ResolvedContent {
            bytes,
            content_type: "application/json".to_string(),
        });
    }

    Ok(ResolvedContent {
        bytes: body.to_vec(),
        content_type: "text/plain".to_string(),
    })
}

/// Parse `data:[<mime>][;base64],<payload>` into bytes and a mime type.
fn parse_data_uri(uri: &str) -> Result<(Vec<u8>, String), ContentError> {
    let rest = uri.strip_prefix("data:").ok_or(ContentError::InvalidDataUri)?;
    let (meta, payload) = rest.split_once(',').ok_or(ContentError::InvalidDataUri)?;

    let (mime, is_base64) = match meta.strip_suffix(";base64") {
        Some(m) => (m, true),
        None => (meta, false),
    };
    let mime = if mime.is_empty() { "text/plain" } else { mime };

    let bytes = if is_base64 {
        BASE64
            .decode(payload.as_bytes())
            .map_err(|_| ContentError::InvalidBase64)?
    } else {
        payload.as_bytes().to_vec()
    };

    Ok((bytes, mime.to_string()))
}

fn canonical_json(body: &[u8]) -> Result<Vec<u8>, ContentError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ContentError::InvalidJson(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| ContentError::InvalidJson(e.to_string()))
}

fn is_json_type(content_type: &str) -> bool {
    content_type == "application/json" || content_type.ends_with("+json")
}

/// Drop `; charset=...` style parameters from a content-type header value.
fn strip_params(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_default() {
        let c = resolve_content(b"hello", None, None, None, 1024).unwrap();
        assert_eq!(c.bytes, b"hello");
        assert_eq!(c.content_type, "text/plain");
    }

    #[test]
    fn test_json_detected_and_canonicalized() {
        let c = resolve_content(b"{\"a\": 1}", None, None, None, 1024).unwrap();
        assert_eq!(c.content_type, "application/json");
        assert_eq!(c.bytes, b"{\"a\":1}");
    }

    #[test]
    fn test_declared_json_must_parse() {
        let err = resolve_content(b"not json", Some("application/json"), None, None, 1024);
        assert!(matches!(err, Err(ContentError::InvalidJson(_))));
    }

    #[test]
    fn test_x_content_type_is_authoritative() {
        let c = resolve_content(
            b"{\"a\":1}",
            Some("application/json"),
            Some("text/plain"),
            None,
            1024,
        )
        .unwrap();
        assert_eq!(c.content_type, "text/plain");
        assert_eq!(c.bytes, b"{\"a\":1}");
    }

    #[test]
    fn test_file_body_is_base64_decoded() {
        let encoded = BASE64.encode(b"\x89PNG\r\n");
        let c = resolve_content(
            encoded.as_bytes(),
            None,
            Some("image/png"),
            Some("file"),
            1024,
        )
        .unwrap();
        assert_eq!(c.bytes, b"\x89PNG\r\n");
        assert_eq!(c.content_type, "image/png");
    }

    #[test]
    fn test_data_uri_parsed() {
        let c = resolve_content(b"data:image/png;base64,iVBORw0=", None, None, None, 1024).unwrap();
        assert_eq!(c.content_type, "image/png");
        assert_eq!(c.bytes, BASE64.decode("iVBORw0=").unwrap());
    }

    #[test]
    fn test_plain_data_uri() {
        let c = resolve_content(b"data:,hello", None, None, None, 1024).unwrap();
        assert_eq!(c.content_type, "text/plain");
        assert_eq!(c.bytes, b"hello");
    }

    #[test]
    fn test_undeclared_binary_rejected() {
        let err = resolve_content(&[0xff, 0xfe, 0x00], None, None, None, 1024);
        assert!(matches!(err, Err(ContentError::UndeclaredBinary)));
    }

    #[test]
    fn test_size_cap_applies_to_decoded_bytes() {
        let encoded = BASE64.encode(vec![0u8; 2048]);
        let err = resolve_content(encoded.as_bytes(), None, None, Some("file"), 1024);
        assert!(matches!(err, Err(ContentError::TooLarge { size: 2048, .. })));
    }

    #[test]
    fn test_charset_params_stripped() {
        let c = resolve_content(b"hi", Some("text/html; charset=utf-8"), None, None, 64).unwrap();
        assert_eq!(c.content_type, "text/html");
    }
}
