//! Ephemeral capture store.
//!
//! Uploaded photos live here for a few minutes under an opaque id so the OCR
//! and analyze routes can fetch them. Two backends implement
//! [`CaptureStore`]:
//!
//! - [`MemoryCaptureStore`]: process-local map, sweep-on-write expiry and a
//!   capacity guard (entry count and cumulative bytes)
//! - [`RedisCaptureStore`]: Redis with server-side TTL; capacity is Redis's
//!   own concern
//!
//! The backend is chosen once at startup and injected into the service.

mod memory;
mod remote;

pub use memory::MemoryCaptureStore;
pub use remote::RedisCaptureStore;

use crate::error::StoreError;
use crate::pipeline::input::ValidatedImage;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// One stored image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureImage {
    pub mime: String,
    pub base64: String,
    /// Decoded size in bytes.
    pub byte_size: usize,
}

impl From<ValidatedImage> for CaptureImage {
    fn from(v: ValidatedImage) -> Self {
        Self {
            mime: v.mime.to_string(),
            base64: v.base64,
            byte_size: v.byte_size,
        }
    }
}

/// An uploaded document photo, plus an optional OCR-optimised variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    pub id: String,
    pub image: CaptureImage,
    pub ocr_image: Option<CaptureImage>,
    /// Unix milliseconds.
    pub created_at_ms: u64,
}

impl Capture {
    /// New capture with a fresh random id.
    pub fn new(image: CaptureImage, ocr_image: Option<CaptureImage>, created_at_ms: u64) -> Self {
        Self {
            id: new_capture_id(),
            image,
            ocr_image,
            created_at_ms,
        }
    }

    /// Decoded bytes held by this capture, both images included.
    pub fn byte_size(&self) -> usize {
        self.image.byte_size + self.ocr_image.as_ref().map_or(0, |i| i.byte_size)
    }

    /// The image to send for OCR: the optimised one when present.
    pub fn ocr_source(&self) -> &CaptureImage {
        self.ocr_image.as_ref().unwrap_or(&self.image)
    }
}

/// 128 random bits, base64url.
pub fn new_capture_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Occupancy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub count: usize,
    pub total_bytes: usize,
}

#[async_trait]
pub trait CaptureStore: Send + Sync {
    /// Store `capture` under `capture.id`.
    ///
    /// # Errors
    /// [`StoreError::Full`] when a capacity guard trips.
    async fn put(&self, capture: Capture) -> Result<(), StoreError>;

    /// Fetch a live capture. Expired or unknown ids yield `None`.
    async fn get(&self, id: &str) -> Result<Option<Capture>, StoreError>;

    /// Remove a capture. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

#[cfg(test)]
pub(crate) fn test_capture(byte_size: usize, created_at_ms: u64) -> Capture {
    Capture::new(
        CaptureImage {
            mime: "image/png".into(),
            base64: "iVBORw0KGgo=".into(),
            byte_size,
        },
        None,
        created_at_ms,
    )
}
