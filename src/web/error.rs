//! Page server error types
//!
//! Every failure is shown on the page itself; the variant decides the
//! HTTP status the page is served with.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use thiserror::Error;

/// Errors raised while handling a page request
#[derive(Debug, Error)]
pub enum WebError {
    /// Uploaded file name has a disallowed extension (400)
    #[error("Unsupported file type {0:?}. Allowed types: jpg, jpeg, png, gif")]
    UnsupportedExtension(String),

    /// Unknown app mode in a form or query (400)
    #[error("Unknown app mode {0:?}")]
    UnknownMode(String),

    /// Malformed or oversized multipart body
    #[error("Invalid upload: {0}")]
    Multipart(#[from] MultipartError),

    /// Upload bytes are not a readable image (422)
    #[error("Could not decode image: {0}")]
    Decode(#[source] image::ImageError),

    /// Recognition or drawing failed (500)
    #[error("{0:#}")]
    Recognition(anyhow::Error),

    /// Result image could not be encoded for display (500)
    #[error("Could not encode result image: {0}")]
    Encode(#[source] image::ImageError),

    /// Blocking worker panicked or was cancelled (500)
    #[error("Background task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl WebError {
    /// HTTP status the error page is served with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnsupportedExtension(_) | Self::UnknownMode(_) => StatusCode::BAD_REQUEST,
            Self::Multipart(e) => e.status(),
            Self::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Recognition(_) | Self::Encode(_) | Self::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            WebError::UnsupportedExtension("notes.txt".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(WebError::UnknownMode("ocr".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            WebError::Recognition(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let decode = image::load_from_memory(b"not an image").unwrap_err();
        assert_eq!(WebError::Decode(decode).status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_recognition_message_keeps_context_chain() {
        let err = anyhow::anyhow!("file missing").context("Failed to load text detection model");
        let message = WebError::Recognition(err).to_string();
        assert_eq!(message, "Failed to load text detection model: file missing");
    }

    #[test]
    fn test_unsupported_extension_message() {
        let message = WebError::UnsupportedExtension("notes.txt".into()).to_string();
        assert!(message.contains("\"notes.txt\""));
        assert!(message.contains("jpg, jpeg, png, gif"));
    }
}
