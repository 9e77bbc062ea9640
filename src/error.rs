/// Errors surfaced by the recommendation core
///
/// Degenerate comparisons (too few shared ratings, zero denominators) are
/// not errors: they resolve to a similarity of 0 inside the engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RecommendError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Load cancelled before completion")]
    Cancelled,
}

pub type RecommendResult<T> = Result<T, RecommendError>;
