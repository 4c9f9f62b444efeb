//! Image encoding: page image file → base64 `ImageData` → data URI.
//!
//! The batch request body embeds each page as a `data:` URI inside an
//! `image_url` content part. The bytes are sent as-is; the MIME type comes
//! from the file extension.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// MIME type for a page image path. Unknown extensions are sent as JPEG.
pub fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Read a page image and wrap it as base64 `ImageData`.
pub fn encode_page_file(path: &Path) -> std::io::Result<ImageData> {
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("page image '{}' is empty", path.display()),
        ));
    }
    let b64 = STANDARD.encode(&bytes);
    debug!("Encoded {} → {} bytes base64", path.display(), b64.len());
    Ok(ImageData::new(b64, mime_for(path)))
}

/// `data:{mime};base64,{data}`
pub fn data_uri(image: &ImageData) -> String {
    format!("data:{};base64,{}", image.mime_type, image.data)
}
