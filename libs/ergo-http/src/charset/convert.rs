use super::content_type::ContentType;
use crate::error::HttpError;
use encoding_rs::{BIG5, Encoding, GB18030, UTF_8};

fn lookup(label: &str) -> Result<&'static Encoding, HttpError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| HttpError::UnknownCharset(label.to_owned()))
}

/// Transcodes `input` from the `from` charset to the `to` charset.
///
/// Labels follow the WHATWG Encoding Standard, so `latin1`, `gbk` and `utf8`
/// are all accepted. Bytes that are invalid in `from` become U+FFFD and
/// characters missing from `to` become numeric character references. A
/// wrong `from` label therefore garbles the text rather than failing.
///
/// UTF-16 targets produce UTF-8, as the standard has no UTF-16 encoder.
///
/// # Errors
/// Returns `HttpError::UnknownCharset` if either label is not recognized.
pub fn convert(input: &[u8], from: &str, to: &str) -> Result<Vec<u8>, HttpError> {
    let source = lookup(from)?;
    let target = lookup(to)?;

    let (text, malformed) = source.decode_without_bom_handling(input);
    if malformed {
        tracing::debug!(from = source.name(), "input contained malformed sequences");
    }
    if target == UTF_8 {
        return Ok(text.into_owned().into_bytes());
    }
    let (out, _, unmappable) = target.encode(&text);
    if unmappable {
        tracing::debug!(to = target.name(), "characters replaced with numeric references");
    }
    Ok(out.into_owned())
}

/// Decodes `input` to a UTF-8 string using a declared charset.
///
/// `declared` may be a bare label (`"gbk"`) or a full content type
/// (`"text/html; charset=gbk"`). The GB family and `windows-1252` decode with
/// GB18030, its superset; `big5` uses Big5. Unknown or empty labels fall back
/// to lossy UTF-8.
///
/// ```
/// use ergo_http::charset::convert_to_utf8;
///
/// let gbk = [0xC4, 0xE3, 0xBA, 0xC3];
/// assert_eq!(convert_to_utf8(&gbk, "text/html; charset=GBK"), "你好");
/// ```
#[must_use]
pub fn convert_to_utf8(input: &[u8], declared: &str) -> String {
    let label = if declared.contains(';') || declared.contains('/') {
        ContentType::parse(declared)
            .charset()
            .unwrap_or_default()
            .to_ascii_lowercase()
    } else {
        declared.trim().to_ascii_lowercase()
    };

    let encoding = match label.as_str() {
        "gbk" | "gb2312" | "gb18030" | "windows-1252" => GB18030,
        "big5" => BIG5,
        "" | "utf-8" | "utf8" => UTF_8,
        other => Encoding::for_label(other.as_bytes()).unwrap_or(UTF_8),
    };
    let (text, _) = encoding.decode_without_bom_handling(input);
    text.into_owned()
}
