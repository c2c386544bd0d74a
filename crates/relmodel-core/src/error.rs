//! Error types for relmodel operations.
//!
//! Two disjoint classes exist. Validation problems are *recoverable*: they are
//! collected in a [`ValidationError`] on the owning entity and reported through
//! a `false` save result. Everything else in [`Error`] is *fatal*: the cascade
//! rolls back its transaction and propagates the error to the caller.

use std::fmt;

/// The primary error type for all relmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Relation declaration errors (missing `target`, malformed `link`, ...)
    Config(ConfigError),
    /// Storage-level failures reported by a connection
    Storage(StorageError),
    /// Transaction begin/commit/rollback failures
    Transaction(TransactionError),
    /// Relation cascade failures (unlinkable state, failed save, unknown relation)
    Relation(RelationError),
    /// Type conversion errors
    Type(TypeError),
    /// A rejected save, for callers that want it as an error (see `Owner::try_save`)
    Validation(ValidationError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConfigError {
    /// The relation the declaration belongs to, if known.
    pub relation: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    /// Entity type (table) involved, if any.
    pub entity: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Row or entity type not found
    NotFound,
    /// Constraint violation (duplicate key, dangling reference)
    Constraint,
    /// Storage backend unavailable or failed mid-operation
    Unavailable,
    /// Other storage failure
    Other,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Failed to start a transaction
    Begin,
    /// Failed to commit
    Commit,
    /// Failed to roll back
    Rollback,
    /// Transactions were finished out of order
    OutOfOrder,
}

#[derive(Debug)]
pub struct RelationError {
    pub kind: RelationErrorKind,
    /// The relation name (or namespaced item path such as `items.2`).
    pub relation: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationErrorKind {
    /// No relation with this name is declared
    Unknown,
    /// A related entity could not be saved for a non-validation reason
    SaveFailed,
    /// A key needed to link the entities is absent
    MissingKey,
    /// The assigned raw value cannot be turned into related entities
    InvalidValue,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub attribute: Option<String>,
}

/// Validation errors for an entity, keyed by field.
///
/// Relation cascades copy a related entity's errors onto its owner under
/// namespaced keys: `relation.field` for to-one relations and
/// `relation.index.field` for to-many relations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationError {
    /// The errors in the order they were recorded
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValidationError {
    /// The field name that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// String is shorter than minimum length
    MinLength,
    /// String is longer than maximum length
    MaxLength,
    /// Value doesn't match regex pattern
    Pattern,
    /// Required field is missing/null
    Required,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Remove all recorded errors.
    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a min length error.
    pub fn add_min_length(&mut self, field: impl Into<String>, min: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MinLength,
            format!("must be at least {min} characters, got {actual}"),
        );
    }

    /// Add a max length error.
    pub fn add_max_length(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MaxLength,
            format!("must be at most {max} characters, got {actual}"),
        );
    }

    /// Add a pattern match error.
    pub fn add_pattern(&mut self, field: impl Into<String>, pattern: &str) {
        self.add(
            field,
            ValidationErrorKind::Pattern,
            format!("must match pattern '{pattern}'"),
        );
    }

    /// Add a required field error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(
            field,
            ValidationErrorKind::Required,
            "is required".to_string(),
        );
    }

    /// Add a custom validation error.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }

    /// Copy every error from `other`, prefixing each field with `prefix.`.
    pub fn merge_prefixed(&mut self, prefix: &str, other: &ValidationError) {
        for err in &other.errors {
            self.add(format!("{prefix}.{}", err.field), err.kind, err.message.clone());
        }
    }

    /// Whether any error is recorded for exactly this field.
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

impl Error {
    /// Build a configuration error for a relation.
    pub fn config(relation: Option<&str>, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            relation: relation.map(str::to_string),
            message: message.into(),
        })
    }

    /// Build a relation error.
    pub fn relation(
        kind: RelationErrorKind,
        relation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Relation(RelationError {
            kind,
            relation: relation.into(),
            message: message.into(),
        })
    }

    /// Build a storage error.
    pub fn storage(
        kind: StorageErrorKind,
        entity: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Storage(StorageError {
            kind,
            entity: entity.map(str::to_string),
            message: message.into(),
            source: None,
        })
    }

    /// Build a transaction error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Is this a declaration-time configuration error?
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Is this an error that aborts a save cycle (everything but validation)?
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Validation(_))
    }

    /// The relation error kind, if this is a relation error.
    pub fn relation_kind(&self) -> Option<RelationErrorKind> {
        match self {
            Error::Relation(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The storage error kind, if this is a storage error.
    pub fn storage_kind(&self) -> Option<StorageErrorKind> {
        match self {
            Error::Storage(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Storage(e) => write!(f, "Storage error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e),
            Error::Relation(e) => write!(f, "Relation error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(relation) => write!(f, "{} (relation `{}`)", self.message, relation),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{} (entity `{}`)", self.message, entity),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for RelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`: {}", self.relation, self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(attr) = &self.attribute {
            write!(
                f,
                "attribute '{}': expected {}, found {}",
                attr, self.expected, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no validation errors");
        }
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", err.field, err.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<RelationError> for Error {
    fn from(err: RelationError) -> Self {
        Error::Relation(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmodel operations.
pub type Result<T> = std::result::Result<T, Error>;
