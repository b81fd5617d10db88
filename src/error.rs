//! Error taxonomy shared by the artifact store, the external tools and the HTTP layer.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed request field.
    #[error("{0}")]
    InvalidRequest(String),

    /// yt-dlp could not query or download the URL. The message is passed through untouched.
    #[error("{0}")]
    ExtractionFailed(String),

    #[error("FFmpeg no esta instalado en el servidor. La conversion a MP3 no esta disponible.")]
    EncoderUnavailable,

    /// ffmpeg exited with a non-zero status; carries its diagnostic output.
    #[error("La conversion con FFmpeg fallo: {0}")]
    EncodingFailed(String),

    #[error("La descarga termino sin producir ningun archivo.")]
    ArtifactMissing,

    #[error("La descarga produjo {0} archivos; se esperaba uno solo.")]
    UnexpectedArtifacts(usize),

    #[error("Archivo no encontrado")]
    NotFound,

    #[error("{0}")]
    Storage(String),

    #[error("{0}")]
    Config(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::ExtractionFailed(_) => StatusCode::BAD_GATEWAY,
            Error::EncoderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::EncodingFailed(_)
            | Error::ArtifactMissing
            | Error::UnexpectedArtifacts(_)
            | Error::Storage(_)
            | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::ExtractionFailed(_) => "extraction_failed",
            Error::EncoderUnavailable => "encoder_unavailable",
            Error::EncodingFailed(_) => "encoding_failed",
            Error::ArtifactMissing => "artifact_missing",
            Error::UnexpectedArtifacts(_) => "unexpected_artifacts",
            Error::NotFound => "not_found",
            Error::Storage(_) => "storage_error",
            Error::Config(_) => "config_error",
        }
    }

    pub(crate) fn storage(context: &str, error: impl std::fmt::Display) -> Self {
        Error::Storage(format!("{context}: {error}"))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorBody {
            error: self.to_string(),
            code: self.error_code(),
        });

        (status, body).into_response()
    }
}
