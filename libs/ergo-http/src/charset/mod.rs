//! Charset detection and conversion for non-UTF-8 responses.
//!
//! [`detect`] guesses the charset of a body from in-document declarations,
//! the `Content-Type` header and the raw bytes. [`convert`] and
//! [`convert_to_utf8`] transcode with `encoding_rs`.

mod content_type;
mod convert;
mod detect;

pub use content_type::ContentType;
pub use convert::{convert, convert_to_utf8};
pub use detect::{charset_from_content, charset_from_headers, detect};
