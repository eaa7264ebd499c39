use std::path::PathBuf;

/// Raw command string could not be split into an argument vector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unterminated {quote} quote starting at byte {offset}")]
    UnterminatedQuote { quote: char, offset: usize },
    #[error("trailing backslash at byte {offset}")]
    TrailingEscape { offset: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid command: {0}")]
    Parse(#[from] ParseError),
    #[error("action name must be non-empty")]
    EmptyName,
    #[error("command must contain at least one token")]
    EmptyCommand,
    #[error("program not found: {0}")]
    ProgramNotFound(String),
    #[error("persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RegistryError {
    /// Stable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Parse(_) => "parse_error",
            RegistryError::EmptyName | RegistryError::EmptyCommand => "invalid_param",
            RegistryError::ProgramNotFound(_) => "program_not_found",
            RegistryError::Persist { .. } | RegistryError::Serialize(_) => "persist_failed",
        }
    }
}

/// Generic sampling failure. The underlying OS error is logged, not surfaced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to retrieve status")]
pub struct StatusError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("connect {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect {target}: timed out after {timeout_ms} ms")]
    ConnectTimeout { target: String, timeout_ms: u128 },
}
