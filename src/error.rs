use thiserror::Error;

/// Failure of one read against the execution API or log stream.
///
/// None of these are fatal to the drawer: `Network`, `Decode` and
/// `Cancelled` are absorbed where they occur, `Auth` is handed to the
/// session layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
