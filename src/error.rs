#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("YAML syntax error in {file} at line {line}, column {column}: {message}")]
    YamlSyntax {
        file: String,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Duplicate pipeline name '{name}' declared in {first} and {second}")]
    DuplicatePipelineName {
        name: String,
        first: String,
        second: String,
    },

    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("Invalid override: {0}")]
    InvalidOverride(String),

    #[error("Pipeline '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Pipeline run cancelled")]
    Cancelled,
}

impl AppError {
    /// Process exit code for this error: 2 for bad invocations, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::InvalidInvocation(_)
            | AppError::InvalidOverride(_)
            | AppError::FileNotFound(_) => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::IoError(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));
        AppError::YamlSyntax {
            file: "<input>".to_string(),
            line,
            column,
            message: err.to_string(),
        }
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        AppError::DatabaseError(err.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for AppError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        AppError::DatabaseError(format!("BSON serialization error: {}", err))
    }
}

impl From<mongodb::bson::de::Error> for AppError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        AppError::DatabaseError(format!("BSON deserialization error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::InvalidInvocation("x".into()).exit_code(), 2);
        assert_eq!(AppError::FileNotFound("a.yml".into()).exit_code(), 2);
        assert_eq!(AppError::ConfigError("bad".into()).exit_code(), 1);
        assert_eq!(AppError::AlreadyRunning("p".into()).exit_code(), 1);
        assert_eq!(AppError::Cancelled.exit_code(), 1);
    }
}
