//! HTTP byte ranges over a resource of known size.

use crate::{Error, Result};
use std::fmt;

/// An inclusive byte range `[start, end]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Build a range, rejecting `start > end` and spans outside `size`.
    pub fn new(start: u64, end: u64, size: u64) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRange(format!("start {start} > end {end}")));
        }
        if start >= size {
            return Err(Error::InvalidRange(format!(
                "start {start} beyond size {size}"
            )));
        }
        Ok(Self {
            start,
            end: end.min(size - 1),
        })
    }

    /// The range covering a whole resource, or `None` when it is empty.
    pub fn full(size: u64) -> Option<Self> {
        (size > 0).then(|| Self {
            start: 0,
            end: size - 1,
        })
    }

    /// Parse a `Range` header value for a resource of `size` bytes.
    ///
    /// Accepts `bytes=a-b`, `bytes=a-` and `bytes=-n`. The end is clamped to
    /// `size - 1`. Multiple ranges are not supported.
    pub fn parse(header: &str, size: u64) -> Result<Self> {
        let spec = header
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| Error::InvalidRange(format!("unsupported unit: {header}")))?;
        if spec.contains(',') {
            return Err(Error::InvalidRange("multiple ranges".to_string()));
        }
        let (first, last) = spec
            .split_once('-')
            .ok_or_else(|| Error::InvalidRange(format!("malformed range: {spec}")))?;
        let (first, last) = (first.trim(), last.trim());

        let parse_num = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| Error::InvalidRange(format!("malformed range: {spec}")))
        };

        match (first.is_empty(), last.is_empty()) {
            (false, false) => Self::new(parse_num(first)?, parse_num(last)?, size),
            (false, true) => {
                let start = parse_num(first)?;
                Self::new(start, size.saturating_sub(1).max(start), size)
            }
            (true, false) => {
                let suffix = parse_num(last)?;
                if suffix == 0 || size == 0 {
                    return Err(Error::InvalidRange(format!(
                        "unsatisfiable suffix range: {spec}"
                    )));
                }
                Ok(Self {
                    start: size.saturating_sub(suffix),
                    end: size - 1,
                })
            }
            (true, true) => Err(Error::InvalidRange(format!("malformed range: {spec}"))),
        }
    }

    /// Number of bytes in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Ranges are never empty; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` header value for a resource of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }

    /// Whether this range covers all of a resource of `size` bytes.
    pub fn is_full(&self, size: u64) -> bool {
        self.start == 0 && self.end + 1 == size
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_closed_range() {
        let r = ByteRange::parse("bytes=52428800-52429311", 104_857_600).unwrap();
        assert_eq!(r.start, 52_428_800);
        assert_eq!(r.len(), 512);
        assert_eq!(r.content_range(104_857_600), "bytes 52428800-52429311/104857600");
    }

    #[test]
    fn clamps_end_to_size() {
        let r = ByteRange::parse("bytes=10-999", 100).unwrap();
        assert_eq!(r, ByteRange { start: 10, end: 99 });
    }

    #[test]
    fn open_and_suffix_ranges() {
        assert_eq!(
            ByteRange::parse("bytes=90-", 100).unwrap(),
            ByteRange { start: 90, end: 99 }
        );
        assert_eq!(
            ByteRange::parse("bytes=-10", 100).unwrap(),
            ByteRange { start: 90, end: 99 }
        );
        assert_eq!(
            ByteRange::parse("bytes=-500", 100).unwrap(),
            ByteRange { start: 0, end: 99 }
        );
    }

    #[test]
    fn rejects_invalid_ranges() {
        for header in [
            "bytes=20-10",
            "bytes=100-",
            "bytes=100-200",
            "bytes=-0",
            "bytes=-",
            "items=0-1",
            "bytes=0-1,4-5",
            "bytes=a-b",
        ] {
            assert!(ByteRange::parse(header, 100).is_err(), "{header}");
        }
        assert!(ByteRange::parse("bytes=0-", 0).is_err());
    }

    #[test]
    fn full_range() {
        assert_eq!(ByteRange::full(0), None);
        let r = ByteRange::full(10).unwrap();
        assert!(r.is_full(10));
        assert!(!ByteRange { start: 1, end: 9 }.is_full(10));
    }
}
