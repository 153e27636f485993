use std::path::PathBuf;

#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum ProxyCacheError {
    Io(std::io::Error),
    Hyper(hyper::Error),
    PathEscape(PathBuf),
}

impl std::fmt::Display for ProxyCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Hyper(e) => e.fmt(f),
            Self::PathEscape(path) => {
                write!(
                    f,
                    "invalid path `{}`: outside storage directory",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for ProxyCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Hyper(e) => Some(e),
            Self::PathEscape(_) => None,
        }
    }
}

impl From<std::io::Error> for ProxyCacheError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<hyper::Error> for ProxyCacheError {
    fn from(value: hyper::Error) -> Self {
        Self::Hyper(value)
    }
}
