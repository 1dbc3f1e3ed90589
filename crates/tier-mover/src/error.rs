//! Error types for the tiering pipeline.

use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum TierError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tier1 or Tier2 query error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Change harvest failed for a window
    #[error("Harvest failed for window {window}: {message}")]
    Harvest { window: String, message: String },

    /// Message bus publish/consume error
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Restart marker could not be read or written
    #[error("Restart marker error: {0}")]
    Marker(String),

    /// A message named a table with no registered handler
    #[error("No handler registered for table {0}")]
    UnknownTable(String),

    /// A message could not be decoded or applied
    #[error("Malformed message (id {message_id:?}): {reason}")]
    MalformedMessage {
        message_id: Option<i64>,
        reason: String,
    },

    /// Tier2 rejected the rows of one write
    #[error("Write failed for table {table}: {message}")]
    Write { table: String, message: String },

    /// A Tier2 table is missing or does not match what the handler writes
    #[error("Tier2 schema error for table {table}: {message}")]
    Schema { table: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Shutdown was requested while waiting
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<deadpool_postgres::PoolError> for TierError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        TierError::pool(e, "acquiring connection")
    }
}

impl TierError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        TierError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Bus error
    pub fn bus(message: impl Into<String>) -> Self {
        TierError::Bus(message.into())
    }

    /// Create a MalformedMessage error
    pub fn malformed(message_id: Option<i64>, reason: impl Into<String>) -> Self {
        TierError::MalformedMessage {
            message_id,
            reason: reason.into(),
        }
    }

    /// Create a Write error
    pub fn write(table: impl Into<String>, message: impl Into<String>) -> Self {
        TierError::Write {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Schema error
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        TierError::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether the destination refused this particular payload.
    ///
    /// True for decode failures, rejected rows and SQLSTATE classes 22 (data
    /// exception) and 23 (integrity violation). Schema and privilege errors
    /// (class 42) affect every message for the table and are not included.
    pub fn is_rejected_data(&self) -> bool {
        match self {
            TierError::MalformedMessage { .. } | TierError::Write { .. } => true,
            TierError::Database(e) => e
                .code()
                .is_some_and(|state| matches!(&state.code()[..2], "22" | "23")),
            _ => false,
        }
    }

    /// Whether retrying the same operation later can succeed.
    ///
    /// Connection-level failures are transient. Database errors carrying a
    /// SQLSTATE are transient only for the connection, rollback, resource and
    /// operator-intervention classes; data and integrity errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TierError::Pool { .. } | TierError::Bus(_) | TierError::Io(_) => true,
            TierError::Database(e) => match e.code() {
                None => true,
                Some(state) => {
                    let class = &state.code()[..2];
                    matches!(class, "08" | "40" | "53" | "57")
                }
            },
            _ => false,
        }
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> u8 {
        match self {
            TierError::Config(_) | TierError::Yaml(_) => 2,
            TierError::UnknownTable(_) => 3,
            TierError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, TierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TierError::bus("connection reset").is_transient());
        assert!(TierError::pool("timeout", "tier2").is_transient());
        assert!(!TierError::UnknownTable("Foo".into()).is_transient());
        assert!(!TierError::malformed(Some(3), "bad json").is_transient());
        assert!(!TierError::Config("x".into()).is_transient());
    }

    #[test]
    fn test_rejected_data_classification() {
        assert!(TierError::write("Job", "value too long").is_rejected_data());
        assert!(TierError::malformed(Some(3), "bad json").is_rejected_data());
        assert!(!TierError::schema("Job", "table does not exist in tier2").is_rejected_data());
        assert!(!TierError::schema("Job", "table does not exist in tier2").is_transient());
        assert!(!TierError::pool("timeout", "tier2").is_rejected_data());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TierError::Config("x".into()).exit_code(), 2);
        assert_eq!(TierError::UnknownTable("Foo".into()).exit_code(), 3);
        assert_eq!(TierError::Cancelled.exit_code(), 130);
        assert_eq!(TierError::bus("x").exit_code(), 1);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "marker.tmp missing");
        let err = TierError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
        assert!(detailed.contains("marker.tmp missing"));
    }
}
