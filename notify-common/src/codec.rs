use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Maximum length of an error description exposed outside the process.
/// Stored values are kept intact; only outbound copies are cut.
pub const MAX_ERROR_DESCRIPTION_LENGTH: usize = 1024;

/// Enumeration of failures when decoding an inbound queue payload.
/// All of these are unrecoverable: the payload itself is invalid and
/// redelivering it cannot change the outcome.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("payload is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("required field {0} is missing or empty")]
    MissingField(&'static str),
    #[error("{0} is not a known error code")]
    UnknownErrorCode(String),
}

/// Taxonomy of error codes the upstream pipeline reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AvFailed,
    SigVerifyFailed,
    MetafileInvalid,
    ServiceDisabled,
    ZipProcessingFailed,
    PaymentsDisabled,
}

impl FromStr for ErrorCode {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ERR_AV_FAILED" => Ok(ErrorCode::AvFailed),
            "ERR_SIG_VERIFY_FAILED" => Ok(ErrorCode::SigVerifyFailed),
            "ERR_METAFILE_INVALID" => Ok(ErrorCode::MetafileInvalid),
            "ERR_SERVICE_DISABLED" => Ok(ErrorCode::ServiceDisabled),
            "ERR_ZIP_PROCESSING_FAILED" => Ok(ErrorCode::ZipProcessingFailed),
            "ERR_PAYMENTS_DISABLED" => Ok(ErrorCode::PaymentsDisabled),
            invalid => Err(CodecError::UnknownErrorCode(invalid.to_owned())),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorCode::AvFailed => "ERR_AV_FAILED",
            ErrorCode::SigVerifyFailed => "ERR_SIG_VERIFY_FAILED",
            ErrorCode::MetafileInvalid => "ERR_METAFILE_INVALID",
            ErrorCode::ServiceDisabled => "ERR_SERVICE_DISABLED",
            ErrorCode::ZipProcessingFailed => "ERR_ZIP_PROCESSING_FAILED",
            ErrorCode::PaymentsDisabled => "ERR_PAYMENTS_DISABLED",
        };
        write!(f, "{}", s)
    }
}

/// A validated error-notification event as received from the upstream pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotification {
    pub zip_file_name: String,
    pub jurisdiction: Option<String>,
    pub po_box: Option<String>,
    pub container: Option<String>,
    pub document_control_number: Option<String>,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub service: String,
}

/// The raw wire shape. Everything is optional here so that field-level
/// validation can report which required field was absent, rather than
/// surfacing an opaque serde error.
#[derive(Deserialize)]
struct RawNotification {
    zip_file_name: Option<String>,
    jurisdiction: Option<String>,
    po_box: Option<String>,
    container: Option<String>,
    document_control_number: Option<String>,
    error_code: Option<String>,
    error_description: Option<String>,
    service: Option<String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, CodecError> {
    match value {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(CodecError::MissingField(field)),
    }
}

/// Decode a raw queue payload into an [`ErrorNotification`].
///
/// Fails when the payload is not valid JSON, a required field is missing or
/// empty, or the error code is not part of the known taxonomy. Optional
/// fields may be absent or empty without error.
pub fn decode(payload: &[u8]) -> Result<ErrorNotification, CodecError> {
    let raw: RawNotification = serde_json::from_slice(payload)?;

    let error_code = required(raw.error_code, "error_code")?.parse::<ErrorCode>()?;

    Ok(ErrorNotification {
        zip_file_name: required(raw.zip_file_name, "zip_file_name")?,
        jurisdiction: raw.jurisdiction,
        po_box: raw.po_box,
        container: raw.container,
        document_control_number: raw.document_control_number,
        error_code,
        error_description: required(raw.error_description, "error_description")?,
        service: required(raw.service, "service")?,
    })
}

/// Cut a description down to [`MAX_ERROR_DESCRIPTION_LENGTH`] characters for
/// external exposure. Operates on characters, not bytes, so multi-byte input
/// is never split mid-character.
pub fn truncate_description(description: &str) -> String {
    description
        .chars()
        .take(MAX_ERROR_DESCRIPTION_LENGTH)
        .collect()
}
