use thiserror::Error;

/// Failures surfaced by filesystem operations.
///
/// Reads and writes additionally report short counts; see the inode and
/// file layers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("name longer than {} bytes", crate::param::NAME_MAX)]
    NameTooLong,
    #[error("name already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("file or directory is busy")]
    Busy,
    #[error("no free sectors left")]
    NoSpace,
    #[error("beyond the maximum file extent")]
    TooLarge,
    #[error("writes to this inode are denied")]
    DenyWrite,
}
