//! Top-level error taxonomy.
//!
//! Module-local error enums stay where the failures happen; this type exists
//! for the binary's startup path, where any of them is fatal.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::db::DbError;
use crate::llm::LlmError;
use crate::secrets::SecretsError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Token encryption: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database: {0}")]
    Db(#[from] DbError),

    #[error("Language model: {0}")]
    Llm(#[from] LlmError),
}
