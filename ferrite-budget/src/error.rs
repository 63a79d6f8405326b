use thiserror::Error;

/// Errors surfaced from the budget engine. Peer-facing rejections carry the
/// human-readable reason the original message was refused for.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BudgetError {
    #[error("Invalid collateral: {0}")]
    InvalidCollateral(String),

    #[error("Malformed item: {0}")]
    MalformedItem(String),

    #[error("Stale item: {0}")]
    StaleItem(String),

    #[error("Unknown target {}", hex::encode(.0))]
    UnknownTarget([u8; 32]),

    #[error("Bad signature: {0}")]
    BadSignature(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Already seen {}", hex::encode(.0))]
    DuplicateSeen([u8; 32]),

    #[error("Unknown masternode {0}")]
    UnknownMasternode(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Failure modes of the budget dump file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("File error: {0}")]
    File(String),

    #[error("Failed to read checksum: {0}")]
    HashRead(String),

    #[error("Checksum mismatch, data corrupted")]
    IncorrectHash,

    #[error("Invalid budget cache magic message")]
    IncorrectMagicMessage,

    #[error("Invalid network magic number")]
    IncorrectMagicNumber,

    #[error("Invalid format: {0}")]
    IncorrectFormat(String),
}
