//! The `FwError` hierarchy named in the error-handling design: one variant
//! per recognised failure kind, each carrying the structured detail a
//! caller needs to render a report's `error` field or a CLI exit message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FwError {
    #[error("not a URL or an on-disk file: {0}")]
    NotUrlOrFile(String),

    #[error("not a ZIP or a PAK file")]
    NotZipOrPak,

    #[error("http error: {0}")]
    HttpError(u16),

    #[error("no PAKs found in ZIP file")]
    NoPaksInZip,

    #[error("missing section: {0}")]
    MissingSection(&'static str),

    #[error("unrecognised image type")]
    UnrecognisedImageType,

    #[error("unknown file system inside UBI volume")]
    UnknownFsInUbi,

    #[error("bad magic for {0}")]
    BadMagic(&'static str),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("{0} decoder failed: {1}")]
    DecoderFailed(&'static str, String),

    #[error("no known compression found in kernel image")]
    NoKnownCompressionInKernel,

    #[error("\" -- System halted\" anchor not found in kernel image")]
    SystemHaltedNotFound,

    #[error("destination already exists: {0}")]
    Exists(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FwError>;
