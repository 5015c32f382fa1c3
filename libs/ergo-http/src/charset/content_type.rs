use std::collections::HashMap;

const STRIP: &[char] = &['"', '\'', ' '];

/// `Content-Type` header split into media type and parameters.
///
/// Parsing is lenient: malformed parameters are skipped, keys are
/// lowercased, and surrounding quotes and spaces are trimmed from keys and
/// values.
///
/// ```
/// use ergo_http::charset::ContentType;
///
/// let ct = ContentType::parse("Text/HTML; Charset=\"GBK\"");
/// assert_eq!(ct.media_type(), "text/html");
/// assert_eq!(ct.charset(), Some("GBK"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentType {
    media_type: String,
    params: HashMap<String, String>,
}

impl ContentType {
    #[must_use]
    pub fn parse(header: &str) -> Self {
        let mut tokens = header.split(';');
        let media_type = tokens
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let params = tokens
            .filter_map(|param| {
                let (key, value) = param.trim().split_once('=')?;
                let key = key.trim_matches(STRIP).to_ascii_lowercase();
                let value = value.trim_matches(STRIP).to_owned();
                Some((key, value))
            })
            .collect();

        Self { media_type, params }
    }

    /// Lowercased `type/subtype`.
    #[must_use]
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Value of the `charset` parameter, with any leftover quoting removed.
    #[must_use]
    pub fn charset(&self) -> Option<&str> {
        self.param("charset")
            .map(|cs| cs.trim_matches(&['\'', '\\', '"'][..]))
            .filter(|cs| !cs.is_empty())
    }
}
