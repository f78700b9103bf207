use std::fmt;

/// Kind of the failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Source declaration can not be turned into a working source
    Config,
    /// Pattern is malformed for the active predicate
    Pattern,
    /// Background producer failed
    Producer,
    /// Input/output failure
    Io,
    /// (De)serialization failure
    Serde,
}

impl ErrorKind {
    pub fn message(&self) -> &str {
        use ErrorKind::*;
        match self {
            Config => "Configuration error",
            Pattern => "Invalid pattern",
            Producer => "Producer failed",
            Io => "IO error",
            Serde => "Serde error",
        }
    }
}

/// Error produced by the matching pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    data: String,
}

impl Error {
    pub fn new(kind: ErrorKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn config(data: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, data)
    }

    pub fn pattern(data: impl Into<String>) -> Self {
        Self::new(ErrorKind::Pattern, data)
    }

    pub fn producer(data: impl Into<String>) -> Self {
        Self::new(ErrorKind::Producer, data)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn data(&self) -> &str {
        &self.data
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.data.is_empty() {
            write!(f, "{}", self.kind.message())
        } else {
            write!(f, "{}: {}", self.kind.message(), self.data)
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            data: String::new(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serde, error.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Self::new(ErrorKind::Pattern, error.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::new(ErrorKind::Producer, error.to_string())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::from(ErrorKind::Config).to_string(), "Configuration error");
        assert_eq!(
            Error::pattern("unclosed group").to_string(),
            "Invalid pattern: unclosed group"
        );
        let error: Error = regex::Regex::new("(").unwrap_err().into();
        assert_eq!(error.kind(), &ErrorKind::Pattern);
    }
}
