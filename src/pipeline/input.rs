//! Input validation: turn an upload into a [`Document`] or reject it.
//!
//! Rejection happens here, before any stage is called. A document must be
//! non-empty and must be an image, judged by the declared content type when
//! there is a meaningful one and by the leading magic bytes otherwise.

use crate::error::GatewayError;
use tracing::debug;

/// Content types that say nothing about the payload.
const GENERIC_CONTENT_TYPES: [&str; 2] = ["application/octet-stream", "binary/octet-stream"];

/// The uploaded image. Immutable once accepted.
#[derive(Debug, Clone)]
pub struct Document {
    bytes: Vec<u8>,
    mime_type: String,
    filename: Option<String>,
}

impl Document {
    /// Validate an upload.
    ///
    /// * empty payload → rejected
    /// * declared non-image content type (e.g. `application/pdf`) → rejected
    /// * bytes recognisably not an image → rejected
    /// * no usable declared type and unrecognisable bytes → rejected
    pub fn from_upload(
        bytes: Vec<u8>,
        content_type: Option<&str>,
        filename: Option<String>,
    ) -> Result<Self, GatewayError> {
        if bytes.is_empty() {
            return Err(GatewayError::InvalidUpload("uploaded file is empty".into()));
        }

        let declared = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
            .filter(|ct| !ct.is_empty() && !GENERIC_CONTENT_TYPES.contains(&ct.as_str()));

        if let Some(ref ct) = declared {
            if !ct.starts_with("image/") {
                return Err(GatewayError::InvalidUpload(format!(
                    "unsupported content type '{ct}', expected an image"
                )));
            }
        }

        let sniffed = infer::get(&bytes);
        if let Some(ref kind) = sniffed {
            if kind.matcher_type() != infer::MatcherType::Image {
                return Err(GatewayError::InvalidUpload(format!(
                    "file content is {}, expected an image",
                    kind.mime_type()
                )));
            }
        }

        let mime_type = match (sniffed, declared) {
            (Some(kind), _) => kind.mime_type().to_string(),
            (None, Some(ct)) => ct,
            (None, None) => {
                return Err(GatewayError::InvalidUpload(
                    "unrecognised file format, expected an image".into(),
                ))
            }
        };

        debug!(
            "Accepted upload {:?}: {} bytes, {}",
            filename.as_deref().unwrap_or("<unnamed>"),
            bytes.len(),
            mime_type
        );
        Ok(Self {
            bytes,
            mime_type,
            filename,
        })
    }

    /// Accept raw bytes with no declared content type (CLI input).
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, GatewayError> {
        Self::from_upload(bytes, None, None)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hand the payload to the detection stage.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
