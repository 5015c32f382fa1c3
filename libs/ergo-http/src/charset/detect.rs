use super::content_type::ContentType;
use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use http::HeaderMap;
use http::header::CONTENT_TYPE;
use regex::bytes::Regex;
use std::sync::LazyLock;

/// Bytes of the document examined for in-content declarations.
const SCAN_LIMIT: usize = 8 * 1024;

/// Charset assumed for `text/*` without a declaration.
const TEXT_DEFAULT: &str = "iso-8859-1";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

static META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    compile(r#"(?is-u)<meta[^>]*?\scharset\s*=\s*["']*\s*([^"'>\s;/]+)"#)
});

static META_PRAGMA: LazyLock<Regex> = LazyLock::new(|| {
    compile(r#"(?is-u)<meta[^>]*?content\s*=\s*["']*[^"'>]*?charset\s*=\s*([^"'>\s;]+)"#)
});

static XML_DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    compile(r#"(?is-u)\A<\?xml[^>]*?encoding\s*=\s*["']*([^"'>\s?]+)"#)
});

#[allow(clippy::expect_used)] // static patterns, covered by the tests below
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("charset pattern is valid")
}

/// Charset a response declares through its headers.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HeaderCharset {
    /// Named by a `charset` parameter or implied by `application/json`
    Declared(String),
    /// `text/*` without a charset, where ISO-8859-1 is only a guess
    TextDefault,
}

/// Charset declared inside the document: an HTML `<meta charset>`, an HTML
/// `http-equiv` pragma, or an XML declaration, tried in that order.
///
/// Returns the lowercased label of the first match.
#[must_use]
pub fn charset_from_content(content: &[u8]) -> Option<String> {
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    let head = &content[..content.len().min(SCAN_LIMIT)];
    if head.is_empty() {
        return None;
    }

    let caps = META_CHARSET
        .captures(head)
        .or_else(|| META_PRAGMA.captures(head))
        .or_else(|| XML_DECLARATION.captures(head.trim_ascii_start()))?;
    let label = String::from_utf8_lossy(caps.get(1)?.as_bytes()).to_ascii_lowercase();
    Some(label).filter(|label| !label.is_empty())
}

/// Charset implied by the `Content-Type` header.
///
/// A `charset` parameter wins. Otherwise `text/*` falls back to
/// `iso-8859-1` and `application/json` to `utf-8`.
#[must_use]
pub fn charset_from_headers(headers: &HeaderMap) -> Option<String> {
    header_charset(headers).map(|cs| match cs {
        HeaderCharset::Declared(label) => label,
        HeaderCharset::TextDefault => TEXT_DEFAULT.to_owned(),
    })
}

fn header_charset(headers: &HeaderMap) -> Option<HeaderCharset> {
    let value = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    if value.trim().is_empty() {
        return None;
    }
    let content_type = ContentType::parse(value);

    if let Some(charset) = content_type.charset() {
        return Some(HeaderCharset::Declared(charset.to_ascii_lowercase()));
    }
    if content_type.media_type().contains("text") {
        return Some(HeaderCharset::TextDefault);
    }
    if content_type.media_type().contains("application/json") {
        return Some(HeaderCharset::Declared("utf-8".to_owned()));
    }
    None
}

/// Best-guess lowercase charset of a response body.
///
/// In-content declarations come first, then the headers. When neither
/// names a charset, or the headers only imply the `text/*` default, the
/// bytes themselves are sniffed.
///
/// ```
/// use ergo_http::charset::detect;
/// use http::HeaderMap;
///
/// let html = br#"<html><head><meta charset="GB2312"></head></html>"#;
/// assert_eq!(detect(html, &HeaderMap::new()), "gb2312");
/// ```
#[must_use]
pub fn detect(content: &[u8], headers: &HeaderMap) -> String {
    if let Some(label) = charset_from_content(content) {
        return label;
    }
    match header_charset(headers) {
        Some(HeaderCharset::Declared(label)) => label,
        Some(HeaderCharset::TextDefault) | None => sniff(content).to_ascii_lowercase(),
    }
}

/// Statistical guess from raw bytes.
///
/// A byte-order mark is trusted. Input without any byte above 0x7F cannot be
/// told apart from the web default, so it is reported as `windows-1252`;
/// valid UTF-8 is reported as such.
fn sniff(content: &[u8]) -> &'static str {
    let content = &content[..content.len().min(SCAN_LIMIT)];
    if let Some((encoding, _)) = Encoding::for_bom(content) {
        return encoding.name();
    }
    if content.is_ascii() {
        return encoding_rs::WINDOWS_1252.name();
    }
    if std::str::from_utf8(content).is_ok() {
        return encoding_rs::UTF_8.name();
    }

    let mut detector = EncodingDetector::new();
    detector.feed(content, true);
    let guess = detector.guess(None, true).name();
    tracing::trace!(charset = guess, "charset sniffed from body bytes");
    guess
}
