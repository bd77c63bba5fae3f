//! Fatal error types. Malformed flash is never an `Err` here; see
//! [`crate::diagnostics`] and the `SectorStatus::Na` / record-dropping paths
//! in [`crate::nvs`] and [`crate::zms`] for the non-fatal half of the
//! picture.

use thiserror::Error;

/// Errors the codec itself can raise. Both variants are fatal: the codec
/// never attempts the operation that triggered them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("settings partition geometry invalid: {0}")]
    InvalidGeometry(String),

    #[error("sector overflow: ate cursor {ate_offset:#x} would cross data cursor {data_offset:#x}")]
    SectorOverflow { ate_offset: usize, data_offset: usize },
}

/// Failures raised by the provisioning façade before any codec call is made.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("mfi auth token is {len} bytes, exceeds maximum of {max} bytes")]
    TokenTooLong { len: usize, max: usize },
}

/// Failures raised by the extraction façade.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no records found in the provided settings partition")]
    NoRecords,

    #[error("provisioned data does not contain a valid mfi uuid and token")]
    MissingMandatoryKey,
}

/// Failures converting between a sparse image and Intel-HEX text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IhexError {
    #[error("failed to render intel-hex: {0}")]
    Encode(String),

    #[error("failed to parse intel-hex: {0}")]
    Decode(String),
}
