//! Download file naming: header/URL extraction, sanitation and collision handling.

use crate::{Error, Result};
use percent_encoding::percent_decode_str;

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Map forbidden and control characters to `_` and reject reserved device names.
pub fn sanitize(name: &str) -> Result<String> {
    let mapped: String = name
        .chars()
        .map(|c| {
            if FORBIDDEN.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = mapped.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(Error::InvalidFilename(format!("empty file name: {name:?}")));
    }
    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    if RESERVED.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        return Err(Error::InvalidFilename(format!("reserved name: {trimmed}")));
    }
    Ok(trimmed.to_string())
}

/// Extract a file name from a `Content-Disposition` value, preferring RFC 5987 `filename*`.
pub fn from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;
    for param in split_params(header).into_iter().skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "filename*" => extended = decode_ext_value(value),
            "filename" => {
                let unquoted = unquote(value);
                if !unquoted.is_empty() {
                    plain = Some(unquoted);
                }
            }
            _ => {}
        }
    }
    extended.or(plain)
}

/// Split on `;` outside quoted strings.
fn split_params(header: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let (mut start, mut quoted, mut escaped) = (0, false, false);
    for (i, c) in header.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.push(&header[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(&header[start..]);
    params
}

/// Strip surrounding quotes and resolve `\x` escapes of a quoted-string.
fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .map(|v| v.strip_suffix('"').unwrap_or(v))
    else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

/// Decode `charset'lang'percent-encoded` (RFC 5987). Only UTF-8 and ISO-8859-1 are accepted.
fn decode_ext_value(value: &str) -> Option<String> {
    let value = value.trim_matches('"');
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?.to_ascii_lowercase();
    let _lang = parts.next()?;
    let encoded = parts.next()?;
    let bytes: Vec<u8> = percent_decode_str(encoded).collect();
    let decoded = match charset.as_str() {
        "utf-8" => String::from_utf8(bytes).ok()?,
        "iso-8859-1" => bytes.iter().map(|&b| char::from(b)).collect(),
        _ => return None,
    };
    (!decoded.is_empty()).then_some(decoded)
}

/// Last non-empty path segment of a URL, percent-decoded.
pub fn from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next()?;
    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or(""),
        None => without_query,
    };
    let segment = path.rsplit('/').find(|s| !s.is_empty())?;
    let decoded = percent_decode_str(segment).decode_utf8().ok()?;
    (!decoded.is_empty()).then(|| decoded.into_owned())
}

/// Fallback name when neither the header nor the URL provide one.
pub fn default_name(unix_ts: i64) -> String {
    format!("download_{unix_ts}")
}

/// Pick and sanitize a name: `Content-Disposition`, then the URL path, then a timestamp default.
pub fn choose(content_disposition: Option<&str>, url: &str, unix_ts: i64) -> Result<String> {
    let candidate = content_disposition
        .and_then(from_content_disposition)
        .or_else(|| from_url(url));
    match candidate {
        Some(name) => sanitize(&name).or_else(|_| Ok(default_name(unix_ts))),
        None => Ok(default_name(unix_ts)),
    }
}

/// Make `name` unique with `_n` suffixes before the extension.
pub fn unique_name(name: &str, mut taken: impl FnMut(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = format!("{stem}_{n}{ext}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
