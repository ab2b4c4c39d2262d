use bytes::Bytes;
use image::{GenericImageView, ImageFormat};
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::ImageConfig;

pub const UNDECODABLE_IMAGE: &str = "無法處理此圖片";

/// Upload bytes as they will be sent to a provider.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub data: Bytes,
    pub mime_type: String,
}

/// Upload checks applied before any fingerprinting or provider call.
#[derive(Debug, Clone)]
pub struct ImagePolicy {
    allowed_extensions: Vec<String>,
    max_bytes: usize,
    max_dimension: u32,
}

impl ImagePolicy {
    pub fn new(cfg: &ImageConfig) -> Self {
        Self {
            allowed_extensions: cfg
                .allowed_extensions
                .iter()
                .map(|ext| normalize_extension(ext))
                .collect(),
            max_bytes: cfg.max_bytes,
            max_dimension: cfg.max_dimension.max(1),
        }
    }

    /// Returns the normalized extension (lowercase, no dot) when accepted.
    pub fn check(&self, file_name: &str, len: usize) -> Result<String, String> {
        let ext = extension_of(file_name).ok_or_else(|| "不支持的圖片格式".to_string())?;
        if !self.allowed_extensions.iter().any(|allowed| *allowed == ext) {
            return Err("不支持的圖片格式".to_string());
        }
        if len == 0 {
            return Err("圖片內容為空".to_string());
        }
        if len > self.max_bytes {
            return Err(format!(
                "圖片過大: {} bytes (上限 {} bytes)",
                len, self.max_bytes
            ));
        }
        Ok(ext)
    }

    /// Decodes the upload and thumbnails it to `max_dimension` on its longest
    /// side, re-encoded as PNG. Images already within bounds pass through
    /// byte for byte. CPU bound; run off the async workers.
    pub fn prepare(&self, data: &Bytes, ext: &str) -> Result<PreparedImage, String> {
        let decoded = image::load_from_memory(data).map_err(|e| {
            warn!("Image decode failed ({} bytes, .{}): {}", data.len(), ext, e);
            UNDECODABLE_IMAGE.to_string()
        })?;

        let (width, height) = decoded.dimensions();
        if width <= self.max_dimension && height <= self.max_dimension {
            return Ok(PreparedImage {
                data: data.clone(),
                mime_type: detect_mime(data, ext),
            });
        }

        let thumbnail = decoded.thumbnail(self.max_dimension, self.max_dimension);
        let mut encoded = Cursor::new(Vec::new());
        thumbnail
            .write_to(&mut encoded, ImageFormat::Png)
            .map_err(|e| {
                warn!("Image re-encode failed: {}", e);
                UNDECODABLE_IMAGE.to_string()
            })?;

        debug!(
            "Resized image {}x{} -> {}x{}",
            width,
            height,
            thumbnail.width(),
            thumbnail.height()
        );
        Ok(PreparedImage {
            data: Bytes::from(encoded.into_inner()),
            mime_type: "image/png".to_string(),
        })
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

pub fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(normalize_extension)
        .filter(|ext| !ext.is_empty())
}

/// MIME type from magic bytes, falling back to the extension.
pub fn detect_mime(data: &[u8], ext: &str) -> String {
    match infer::get(data) {
        Some(kind) if kind.mime_type().starts_with("image/") => kind.mime_type().to_string(),
        _ => mime_guess::from_ext(ext)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// Solid-colour PNG of the given size.
#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let pixels = image::RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(pixels)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}
