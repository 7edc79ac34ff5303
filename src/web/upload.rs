//! Image ingestion
//!
//! Reads the page form out of a multipart body, filters the uploaded file
//! by extension and decodes it.

use axum::body::Bytes;
use axum::extract::Multipart;
use std::path::Path;
use tracing::{debug, warn};

use super::error::WebError;
use crate::app::{Mode, Upload};

/// File extensions the upload form accepts, matched case-insensitively
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];

/// A file part as received, not yet decoded
#[derive(Debug, Clone)]
pub struct RawFile {
    pub filename: String,
    pub bytes: Bytes,
}

/// Fields of the page form
#[derive(Debug, Clone, Default)]
pub struct UploadForm {
    pub mode: Mode,
    pub file: Option<RawFile>,
}

/// Check a file name against [`ALLOWED_EXTENSIONS`]
pub fn is_allowed(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ALLOWED_EXTENSIONS.iter().any(|allowed| ext.eq_ignore_ascii_case(allowed)))
        .unwrap_or(false)
}

/// Collect the `mode` and `file` fields; other fields are ignored
pub async fn read_form(mut multipart: Multipart) -> Result<UploadForm, WebError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("mode") => {
                let value = field.text().await?;
                form.mode = value.parse().map_err(|_| WebError::UnknownMode(value))?;
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                // Browsers send an empty, nameless part when no file was picked
                if !filename.is_empty() {
                    form.file = Some(RawFile { filename, bytes });
                }
            }
            _ => {}
        }
    }

    Ok(form)
}

/// Filter by extension and decode
pub fn decode_upload(file: RawFile) -> Result<Upload, WebError> {
    if !is_allowed(&file.filename) {
        warn!("Rejected upload {:?}: disallowed extension", file.filename);
        return Err(WebError::UnsupportedExtension(file.filename));
    }

    let image = image::load_from_memory(&file.bytes).map_err(WebError::Decode)?;
    debug!(
        "Decoded {:?}: {}x{} {:?}",
        file.filename,
        image.width(),
        image.height(),
        image.color()
    );

    Ok(Upload {
        filename: file.filename,
        image,
    })
}
