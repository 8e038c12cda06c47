use compression_codecs::lz4::Lz4Decoder;
use http::header::{self, HeaderMap};
use lz4_flex::frame::{BlockMode, BlockSize, FrameInfo};

/// The registered content-coding token for the LZ4 frame format.
pub const LZ4_ENCODING: &str = "lz4";

/// Frame parameters shared by every pooled compressor.
///
/// The block size is fixed so a reused encoder does not inherit the size it guessed from the
/// first write of an earlier response.
pub(crate) fn frame_info() -> FrameInfo {
    FrameInfo::new()
        .block_size(BlockSize::Max64KB)
        .block_mode(BlockMode::Independent)
}

/// Creates a streaming LZ4 frame decoder.
pub(crate) fn decoder() -> Lz4Decoder {
    Lz4Decoder::new()
}

/// Returns true if any `Accept-Encoding` value lists `lz4` with a non-zero quality.
///
/// The header value is expected to be comma-separated encodings with optional
/// quality values (e.g., "gzip, lz4;q=0.8").
pub(crate) fn accepts_lz4(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|part| parse_encoding_with_quality(part.trim()))
        .any(|(encoding, quality)| encoding.eq_ignore_ascii_case(LZ4_ENCODING) && quality > 0.0)
}

/// Returns true if the `Content-Encoding` header names the LZ4 coding.
pub(crate) fn is_lz4_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(LZ4_ENCODING))
}

/// Parses an encoding entry like "lz4" or "lz4;q=0.8" into (encoding, quality).
fn parse_encoding_with_quality(s: &str) -> (&str, f32) {
    let mut parts = s.splitn(2, ';');
    let encoding = parts.next().unwrap_or("").trim();

    let quality = parts
        .next()
        .and_then(|q| {
            let q = q.trim();
            if q.starts_with("q=") || q.starts_with("Q=") {
                q[2..].parse::<f32>().ok()
            } else {
                None
            }
        })
        .unwrap_or(1.0);

    (encoding, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn accept(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(header::ACCEPT_ENCODING, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn test_accepts_lz4_simple() {
        assert!(accepts_lz4(&accept(&["lz4"])));
        assert!(accepts_lz4(&accept(&["LZ4"])));
        assert!(accepts_lz4(&accept(&["gzip, lz4, br"])));
    }

    #[test]
    fn test_accepts_lz4_across_header_values() {
        assert!(accepts_lz4(&accept(&["gzip", "lz4;q=0.5"])));
    }

    #[test]
    fn test_accepts_lz4_missing() {
        assert!(!accepts_lz4(&HeaderMap::new()));
        assert!(!accepts_lz4(&accept(&["gzip, br"])));
        assert!(!accepts_lz4(&accept(&["*"])));
    }

    #[test]
    fn test_accepts_lz4_quality_zero() {
        assert!(!accepts_lz4(&accept(&["lz4;q=0"])));
        assert!(!accepts_lz4(&accept(&["gzip, lz4;q=0.0"])));
        assert!(accepts_lz4(&accept(&["lz4;q=0.1"])));
    }

    #[test]
    fn test_parse_encoding_with_quality() {
        assert_eq!(parse_encoding_with_quality("lz4"), ("lz4", 1.0));
        assert_eq!(parse_encoding_with_quality("lz4;q=0.8"), ("lz4", 0.8));
        assert_eq!(parse_encoding_with_quality("lz4; Q=0.2"), ("lz4", 0.2));
        assert_eq!(parse_encoding_with_quality("lz4;level=1"), ("lz4", 1.0));
    }

    #[test]
    fn test_is_lz4_encoded() {
        let mut headers = HeaderMap::new();
        assert!(!is_lz4_encoded(&headers));

        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(!is_lz4_encoded(&headers));

        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("lz4"));
        assert!(is_lz4_encoded(&headers));
    }
}
