//! Error types

use std::{error::Error as StdError, fmt, io, path::PathBuf, result::Result as StdResult};

/// Type alias to use this library's `Error` type in a Result
pub type Result<T> = StdResult<T, Error>;

/// Error kinds
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error
    ///
    /// May be used in cases where a platform specific error is mapped to this type, or for opaque
    /// internal errors.
    Generic(String),

    /// I/O errors
    Io(io::Error),

    /// A path does not exist
    PathNotFound,

    /// Attempted to remove a watch that does not exist
    WatchNotFound,

    /// An invalid value was passed as runtime configuration
    InvalidConfig,

    /// OS-level limit on the number of watched resources was reached
    MaxFilesWatch,
}

/// Error type carrying the failure kind and the paths it concerns
#[derive(Debug)]
pub struct Error {
    /// Kind of the error
    pub kind: ErrorKind,
    /// Relevant paths, if any
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Create an error of the given kind with no paths attached.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Attach a path to the error.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Replace the attached paths.
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    /// Creates a new Error with `ErrorKind::Generic`.
    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new Error with `ErrorKind::Io`.
    pub fn io(err: io::Error) -> Self {
        Self::new(ErrorKind::Io(err))
    }

    /// Creates a new Error with `ErrorKind::PathNotFound`.
    pub fn path_not_found() -> Self {
        Self::new(ErrorKind::PathNotFound)
    }

    /// Creates a new Error with `ErrorKind::WatchNotFound`.
    pub fn watch_not_found() -> Self {
        Self::new(ErrorKind::WatchNotFound)
    }

    /// Creates a new Error with `ErrorKind::InvalidConfig`.
    pub fn invalid_config() -> Self {
        Self::new(ErrorKind::InvalidConfig)
    }

    // io::Error is not Clone, so fanning one Error out to several handlers
    // needs a structural copy instead.
    pub(crate) fn duplicate(&self) -> Self {
        let kind = match &self.kind {
            ErrorKind::Generic(msg) => ErrorKind::Generic(msg.clone()),
            ErrorKind::Io(err) => ErrorKind::Io(match err.raw_os_error() {
                Some(code) => io::Error::from_raw_os_error(code),
                None => io::Error::new(err.kind(), err.to_string()),
            }),
            ErrorKind::PathNotFound => ErrorKind::PathNotFound,
            ErrorKind::WatchNotFound => ErrorKind::WatchNotFound,
            ErrorKind::InvalidConfig => ErrorKind::InvalidConfig,
            ErrorKind::MaxFilesWatch => ErrorKind::MaxFilesWatch,
        };
        Self {
            kind,
            paths: self.paths.clone(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = match &self.kind {
            ErrorKind::PathNotFound => "No path was found.".into(),
            ErrorKind::WatchNotFound => "No watch was found.".into(),
            ErrorKind::InvalidConfig => "Invalid configuration.".into(),
            ErrorKind::MaxFilesWatch => "OS file watch limit reached.".into(),
            ErrorKind::Io(err) => err.to_string(),
            ErrorKind::Generic(err) => err.clone(),
        };

        if self.paths.is_empty() {
            write!(f, "{error}")
        } else {
            write!(f, "{error} about {:?}", self.paths)
        }
    }
}

impl StdError for Error {
    fn cause(&self) -> Option<&dyn StdError> {
        match self.kind {
            ErrorKind::Io(ref cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::path_not_found()
        } else {
            Self::io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_paths() {
        let err = Error::path_not_found().add_path(PathBuf::from("/missing"));
        let rendered = err.to_string();
        assert!(rendered.contains("No path was found"));
        assert!(rendered.contains("/missing"));
    }

    #[test]
    fn io_not_found_maps_to_path_not_found() {
        let err: Error = io::Error::from(io::ErrorKind::NotFound).into();
        assert!(matches!(err.kind, ErrorKind::PathNotFound));
    }

    #[test]
    fn duplicate_preserves_os_error_code() {
        let err = Error::io(io::Error::from_raw_os_error(2)).add_path(PathBuf::from("/a"));
        let copy = err.duplicate();
        match copy.kind {
            ErrorKind::Io(inner) => assert_eq!(inner.raw_os_error(), Some(2)),
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(copy.paths, err.paths);
    }
}
