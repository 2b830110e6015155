use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaecodError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("tile source error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("source not found or not a regular file: {0}")]
    SourceMissing(PathBuf),

    #[error("unparsable manifest line {line}")]
    SourceFormat { line: usize },

    #[error("duplicate key in source: {0}")]
    DuplicateKey(String),

    #[error("record exceeds an index field width: {0}")]
    RecordTooLarge(String),

    #[error("not enough disk space")]
    DiskSpace,

    #[error("memory mapping failed")]
    MapFailed,

    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("file too small to carry a part header: {0}")]
    TooSmall(PathBuf),

    #[error("refusing to overwrite existing file: {0}")]
    AlreadyExists(PathBuf),

    #[error("no valid signature: {0}")]
    BadMagic(PathBuf),

    #[error("integrity check failed, hash mismatch: {0}")]
    BadHash(PathBuf),

    #[error("uuid differs between part files")]
    UuidMismatch,

    #[error("record count differs between part files")]
    RecordCountMismatch,

    #[error("payload size inconsistent with header")]
    SizeMismatch,

    #[error("perfect hash construction failed")]
    MphfBuild,

    #[error("perfect hash load failed: {0}")]
    MphfLoad(String),

    #[error("could not bind listen socket")]
    BindFailed,

    #[error("accept failed")]
    AcceptFailed,

    #[error("connection read failed")]
    ReadError,

    #[error("connection write failed")]
    WriteError,
}

pub type Result<T> = std::result::Result<T, CaecodError>;
