//! Shared handler helpers.

use crate::error::{ApiError, ApiResult};
use crate::reader::{RangeReply, ReplyStatus};
use axum::body::Body;
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap,
    RANGE,
};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// Parse a path segment as a UUID.
pub fn parse_id(raw: &str, what: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ApiError::BadRequest(format!("invalid {what} ID: {e}")))
}

/// Value of an optional string header.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> ApiResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::BadRequest(format!("{name} header is not valid text")))
        })
        .transpose()
}

pub fn range_header(headers: &HeaderMap) -> ApiResult<Option<&str>> {
    header_str(headers, RANGE.as_str())
}

pub fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

/// Turn a reader reply into a 200 or 206 streaming response.
pub fn range_response(reply: RangeReply) -> Response {
    let status = match reply.status {
        ReplyStatus::Full => StatusCode::OK,
        ReplyStatus::Partial => StatusCode::PARTIAL_CONTENT,
    };
    let stream = reply
        .stream
        .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string())));

    let mut response = (status, Body::from_stream(stream)).into_response();
    let headers = response.headers_mut();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(reply.content_length));
    if let Ok(mime) = HeaderValue::from_str(&reply.mime) {
        headers.insert(CONTENT_TYPE, mime);
    }
    if let Some(range) = reply.content_range.and_then(|r| HeaderValue::from_str(&r).ok()) {
        headers.insert(CONTENT_RANGE, range);
    }
    if let Ok(disposition) = HeaderValue::from_str(&content_disposition(&reply.file_name)) {
        headers.insert(CONTENT_DISPOSITION, disposition);
    }
    response
}

/// `inline` disposition with an ASCII fallback and an RFC 5987 UTF-8 name.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' { c } else { '_' })
        .collect();
    let encoded: String = file_name
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
                (b as char).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect();
    format!("inline; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_escapes_non_ascii_names() {
        assert_eq!(
            content_disposition("a b.txt"),
            "inline; filename=\"a b.txt\"; filename*=UTF-8''a%20b.txt"
        );
        let header = content_disposition("résumé\".pdf");
        assert!(header.starts_with("inline; filename=\"r_sum__.pdf\""));
        assert!(header.ends_with("r%C3%A9sum%C3%A9%22.pdf"));
    }

    #[test]
    fn ids_must_be_uuids() {
        assert!(parse_id("nope", "file").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string(), "file").unwrap(), id);
    }
}
