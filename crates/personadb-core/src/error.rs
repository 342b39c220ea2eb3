//! Error types for the persona database

use thiserror::Error;

use crate::identifier::IdentifierType;
use crate::storage::Diagnosis;

/// Main error type for persona database operations
#[derive(Error, Debug)]
pub enum PersonaError {
    /// `create` was called for a key that is already stored
    #[error("Duplicate key in {store}: {key}")]
    DuplicateKey { store: &'static str, key: String },

    /// `update` was called for a record that does not exist
    #[error("Update of non-existent record: {0}")]
    UpdateNonExistent(String),

    /// Guarded delete refused because the persona holds a private key
    #[error("Cannot delete a persona with a private key: {0}")]
    PrivateKeyProtected(String),

    /// A persona had to be created but no public key was supplied
    #[error("Cannot create persona {0} without a public key")]
    MissingPublicKey(String),

    /// Throw-mode consistency check found violations
    #[error("Persona database is inconsistent ({} violation(s)); first: {}", .violations.len(), first_violation(.violations))]
    Inconsistent { violations: Vec<Diagnosis> },

    /// Identifier text could not be decoded at all
    #[error("Malformed identifier {raw:?}: {reason}")]
    MalformedIdentifier { raw: String, reason: String },

    /// Identifier text decoded to a different kind than the caller expected
    #[error("Invalid identifier, expected {expected}, actual {actual} ({raw:?})")]
    IdentifierKindMismatch {
        expected: IdentifierType,
        actual: IdentifierType,
        raw: String,
    },

    /// A stored profile links to something that is not a persona identifier
    #[error("Unknown type of linked persona: {raw:?}")]
    UnexpectedLinkedType { raw: String },

    /// Transaction was used against a table outside its scope
    #[error("Table {table} is not in the scope of this transaction ({scope})")]
    TableNotInScope { table: &'static str, scope: String },

    /// Transaction was already committed or aborted
    #[error("Transaction already finished")]
    TransactionFinished,

    /// Stored schema is newer than this build understands
    #[error("Schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u64, supported: u64 },

    /// Service command loop is gone
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn first_violation(violations: &[Diagnosis]) -> String {
    violations
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

impl From<serde_json::Error> for PersonaError {
    fn from(err: serde_json::Error) -> Self {
        PersonaError::Serialization(err.to_string())
    }
}

/// Result type alias using PersonaError
pub type PersonaResult<T> = Result<T, PersonaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PersonaError::UpdateNonExistent("person:twitter/alice".to_string());
        assert_eq!(
            format!("{}", err),
            "Update of non-existent record: person:twitter/alice"
        );
    }

    #[test]
    fn test_kind_mismatch_names_both_kinds() {
        let err = PersonaError::IdentifierKindMismatch {
            expected: IdentifierType::Profile,
            actual: IdentifierType::EcKey,
            raw: "ec_key:secp256k1/abc".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("ProfileIdentifier"));
        assert!(text.contains("ECKeyIdentifier"));
        assert!(text.contains("ec_key:secp256k1/abc"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PersonaError = io_err.into();
        assert!(matches!(err, PersonaError::Io(_)));
    }

    #[test]
    fn test_inconsistent_without_violations() {
        let err = PersonaError::Inconsistent { violations: vec![] };
        assert!(err.to_string().contains("first: none"));
    }
}
