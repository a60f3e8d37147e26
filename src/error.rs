use std::{error, fmt};

pub type Result<T> = std::result::Result<T, Error>;

type Source = Box<dyn error::Error + Send + Sync + 'static>;

pub struct Error {
    kind: ErrorKind,
    source: Option<Source>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The transport could not be acquired while starting.
    Start,
    /// The operation is not allowed in the current lifecycle state.
    InvalidState,
    Config,
    Unreachable,
    BrokenPipe,
    Timeout,
    Codec,
    UnexpectedMessage,
    Discovery,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn new(kind: ErrorKind, source: Option<Source>) -> Self {
        Self { kind, source }
    }

    pub(crate) fn new_start(source: Option<Source>) -> Self {
        Self::new(ErrorKind::Start, source)
    }

    pub(crate) fn new_invalid_state(source: Option<Source>) -> Self {
        Self::new(ErrorKind::InvalidState, source)
    }

    pub(crate) fn new_config(source: Option<Source>) -> Self {
        Self::new(ErrorKind::Config, source)
    }

    pub(crate) fn new_unreachable(source: Option<Source>) -> Self {
        Self::new(ErrorKind::Unreachable, source)
    }

    pub(crate) fn new_broken_pipe(source: Option<Source>) -> Self {
        Self::new(ErrorKind::BrokenPipe, source)
    }

    pub(crate) fn new_timeout() -> Self {
        Self::new(ErrorKind::Timeout, None)
    }

    pub(crate) fn new_codec(source: Option<Source>) -> Self {
        Self::new(ErrorKind::Codec, source)
    }

    pub(crate) fn new_unexpected_message(source: Option<Source>) -> Self {
        Self::new(ErrorKind::UnexpectedMessage, source)
    }

    pub(crate) fn new_discovery(source: Option<Source>) -> Self {
        Self::new(ErrorKind::Discovery, source)
    }
}

impl From<ErrorKind> for Error {
    fn from(t: ErrorKind) -> Self {
        Error::new(t, None)
    }
}

impl From<(ErrorKind, Source)> for Error {
    fn from(t: (ErrorKind, Source)) -> Self {
        Error::new(t.0, Some(t.1))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::new_codec(Some(e))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut f = f.debug_tuple("Error");
        f.field(&self.kind);
        if let Some(source) = &self.source {
            f.field(source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{}: {}", self.kind, source)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| &**s as &(dyn error::Error + 'static))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_source() {
        let err = Error::new_invalid_state(Some("service is stopping".into()));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.to_string(), "InvalidState: service is stopping");

        let err: Error = ErrorKind::Timeout.into();
        assert_eq!(err.to_string(), "Timeout");
    }
}
