//! Input validation: data-URL parsing and image sniffing.
//!
//! Uploaded captures arrive as `data:<mime>;base64,<payload>` strings. The
//! declared MIME type is client-controlled, so the decoded bytes are sniffed
//! by magic number and the two must agree before the image is stored or sent
//! to a provider. Size limits are enforced on the decoded payload; an
//! estimate from the base64 length rejects oversized uploads before decoding.

use crate::config::ServiceConfig;
use crate::error::ApiError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::ImageFormat;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static RE_DATA_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^data:([A-Za-z0-9][A-Za-z0-9._+-]*/[A-Za-z0-9][A-Za-z0-9._+-]*);base64,([A-Za-z0-9+/]+={0,2})$")
        .unwrap()
});

/// A parsed `data:` URL borrowing from the input string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataUrl<'a> {
    /// MIME type exactly as declared.
    pub mime: &'a str,
    /// Base64 payload exactly as sent.
    pub payload: &'a str,
}

/// Parse `data:<mime>;base64,<payload>`. Returns `None` for any other shape.
pub fn parse_data_url(input: &str) -> Option<DataUrl<'_>> {
    let caps = RE_DATA_URL.captures(input.trim())?;
    Some(DataUrl {
        mime: caps.get(1)?.as_str(),
        payload: caps.get(2)?.as_str(),
    })
}

/// Like [`parse_data_url`] but only accepts `image/*` MIME types.
pub fn parse_image_data_url(input: &str) -> Option<DataUrl<'_>> {
    parse_data_url(input).filter(|d| d.mime.to_ascii_lowercase().starts_with("image/"))
}

/// Detect JPEG, PNG or WebP from magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Png => Some("image/png"),
        ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}

fn normalise_mime(mime: &str) -> String {
    let m = mime.to_ascii_lowercase();
    match m.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => m,
    }
}

/// Size bounds for decoded images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl From<&ServiceConfig> for ImageLimits {
    fn from(c: &ServiceConfig) -> Self {
        Self {
            min_bytes: c.min_image_bytes,
            max_bytes: c.max_image_bytes,
        }
    }
}

/// An image that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedImage {
    /// Sniffed MIME type (agrees with the declared one).
    pub mime: &'static str,
    /// Base64 payload, unchanged from the upload.
    pub base64: String,
    /// Decoded size in bytes.
    pub byte_size: usize,
}

/// Validate an uploaded image data URL.
///
/// # Errors
/// - [`ApiError::ImageTooLarge`] when the decoded size exceeds `limits.max_bytes`
/// - [`ApiError::ImageInvalid`] for a bad data URL, undecodable base64, a
///   payload under `limits.min_bytes`, an unknown format, or a declared type
///   that disagrees with the sniffed one
pub fn validate_image(data_url: &str, limits: ImageLimits) -> Result<ValidatedImage, ApiError> {
    let parsed = parse_image_data_url(data_url).ok_or_else(|| ApiError::ImageInvalid {
        detail: "expected a base64 image data URL".into(),
    })?;

    let estimated = parsed.payload.len() / 4 * 3;
    if estimated > limits.max_bytes + 2 {
        return Err(ApiError::ImageTooLarge {
            size: estimated,
            limit: limits.max_bytes,
        });
    }

    let bytes = STANDARD
        .decode(parsed.payload)
        .map_err(|e| ApiError::ImageInvalid {
            detail: format!("payload is not valid base64: {e}"),
        })?;

    if bytes.len() > limits.max_bytes {
        return Err(ApiError::ImageTooLarge {
            size: bytes.len(),
            limit: limits.max_bytes,
        });
    }
    if bytes.len() < limits.min_bytes {
        return Err(ApiError::ImageInvalid {
            detail: format!("payload too small ({} bytes), file looks corrupt", bytes.len()),
        });
    }

    let sniffed = sniff_mime(&bytes).ok_or_else(|| ApiError::ImageInvalid {
        detail: "unsupported image format (expected JPEG, PNG or WebP)".into(),
    })?;
    let declared = normalise_mime(parsed.mime);
    if declared != sniffed {
        return Err(ApiError::ImageInvalid {
            detail: format!("declared type {declared} does not match content ({sniffed})"),
        });
    }

    debug!("Validated {} image, {} bytes", sniffed, bytes.len());
    Ok(ValidatedImage {
        mime: sniffed,
        base64: parsed.payload.to_string(),
        byte_size: bytes.len(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// PNG signature padded with zeros.
    pub(crate) fn png_bytes(len: usize) -> Vec<u8> {
        let mut b = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        b.resize(len, 0);
        b
    }

    pub(crate) fn png_data_url(len: usize) -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(png_bytes(len)))
    }

    fn limits() -> ImageLimits {
        ImageLimits {
            min_bytes: 32,
            max_bytes: 1024,
        }
    }

    #[test]
    fn parse_round_trips_mime_and_payload() {
        let url = "data:image/webp;base64,UklGRg==";
        let d = parse_data_url(url).unwrap();
        assert_eq!(d.mime, "image/webp");
        assert_eq!(d.payload, "UklGRg==");
    }

    #[test]
    fn parse_rejects_other_shapes() {
        assert!(parse_data_url("").is_none());
        assert!(parse_data_url("data:image/png,abc").is_none());
        assert!(parse_data_url("data:;base64,abc").is_none());
        assert!(parse_data_url("http://x/y.png").is_none());
        assert!(parse_data_url("data:image/png;base64,").is_none());
        assert!(parse_data_url("data:image/png;base64,ab cd").is_none());
    }

    #[test]
    fn image_prefix_required() {
        assert!(parse_image_data_url("data:text/plain;base64,aGk=").is_none());
        assert!(parse_image_data_url("data:IMAGE/PNG;base64,aGk=").is_some());
    }

    #[test]
    fn sniff_known_formats() {
        assert_eq!(sniff_mime(&png_bytes(16)), Some("image/png"));
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), Some("image/jpeg"));
        assert_eq!(sniff_mime(b"RIFF\x10\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"%PDF-1.7"), None);
    }

    #[test]
    fn accepts_small_valid_png() {
        let img = validate_image(&png_data_url(40), limits()).unwrap();
        assert_eq!(img.mime, "image/png");
        assert_eq!(img.byte_size, 40);
    }

    #[test]
    fn rejects_oversized() {
        let err = validate_image(&png_data_url(2048), limits()).unwrap_err();
        assert_eq!(err.code(), "IMAGE_TOO_LARGE");
        assert_eq!(err.status(), 413);
    }

    #[test]
    fn rejects_too_small_as_invalid() {
        let err = validate_image(&png_data_url(16), limits()).unwrap_err();
        assert_eq!(err.code(), "IMAGE_INVALID");
    }

    #[test]
    fn rejects_declared_type_mismatch() {
        let url = format!("data:image/jpeg;base64,{}", STANDARD.encode(png_bytes(40)));
        let err = validate_image(&url, limits()).unwrap_err();
        assert!(err.to_string().contains("does not match"), "got: {err}");
    }

    #[test]
    fn jpg_alias_is_accepted() {
        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0];
        jpeg.resize(64, 0);
        let url = format!("data:image/jpg;base64,{}", STANDARD.encode(&jpeg));
        assert_eq!(validate_image(&url, limits()).unwrap().mime, "image/jpeg");
    }
}
