use std::fmt;

#[derive(Debug)]
pub enum DrainError {
    Io(std::io::Error),
    Config(String),
    IllegalState(String),
    Naming(String),
    Integrity(String),
    ItemExists(String),
    Remote(String),
    Serialization(String),
    Other(String),
}

impl fmt::Display for DrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainError::Io(e) => write!(f, "IO error: {}", e),
            DrainError::Config(e) => write!(f, "Config error: {}", e),
            DrainError::IllegalState(e) => write!(f, "Illegal state: {}", e),
            DrainError::Naming(e) => write!(f, "Naming error: {}", e),
            DrainError::Integrity(e) => write!(f, "Integrity error: {}", e),
            DrainError::ItemExists(e) => write!(f, "Item exists: {}", e),
            DrainError::Remote(e) => write!(f, "Remote error: {}", e),
            DrainError::Serialization(e) => write!(f, "Serialization error: {}", e),
            DrainError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for DrainError {}

impl DrainError {
    /// True for `Io` errors of kind `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DrainError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<std::io::Error> for DrainError {
    fn from(err: std::io::Error) -> Self {
        DrainError::Io(err)
    }
}

impl From<serde_yaml::Error> for DrainError {
    fn from(err: serde_yaml::Error) -> Self {
        DrainError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for DrainError {
    fn from(err: serde_json::Error) -> Self {
        DrainError::Serialization(err.to_string())
    }
}

impl From<regex::Error> for DrainError {
    fn from(err: regex::Error) -> Self {
        DrainError::Naming(err.to_string())
    }
}

impl From<String> for DrainError {
    fn from(err: String) -> Self {
        DrainError::Other(err)
    }
}

impl From<&str> for DrainError {
    fn from(err: &str) -> Self {
        DrainError::Other(err.to_string())
    }
}
