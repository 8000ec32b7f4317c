use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A controller failure, categorized for retry policy and metrics labels.
///
/// Validation and Conversion errors are terminal for the input that produced
/// them; requeueing would only reproduce the same failure. API, Timeout, and
/// Reconciliation errors are transient and drive a backed-off requeue.
/// Configuration and Internal errors are fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed during {operation} of {resource}: {message}")]
    Validation {
        operation: &'static str,
        resource: String,
        message: String,
    },

    #[error("api request failed during {operation} of {resource}: {source}")]
    Api {
        operation: &'static str,
        resource: String,
        #[source]
        source: Cause,
    },

    #[error("reconciliation of {resource} failed during {operation}: {message}")]
    Reconciliation {
        operation: &'static str,
        resource: String,
        message: String,
    },

    #[error("could not decode {resource} during {operation}: {message}")]
    Conversion {
        operation: &'static str,
        resource: String,
        message: String,
    },

    #[error("{operation} of {resource} exceeded its {:?} deadline", .deadline)]
    Timeout {
        operation: &'static str,
        resource: String,
        deadline: Duration,
    },

    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    #[error("internal invariant violated: {message}")]
    Internal { message: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Api,
    Reconciliation,
    Conversion,
    Timeout,
    Configuration,
    Internal,
}

impl Error {
    pub fn validation(
        operation: &'static str,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            operation,
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn api(
        operation: &'static str,
        resource: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Api {
            operation,
            resource: resource.into(),
            source: Box::new(source),
        }
    }

    pub fn reconciliation(
        operation: &'static str,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Reconciliation {
            operation,
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn conversion(
        operation: &'static str,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conversion {
            operation,
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: &'static str, resource: impl Into<String>, deadline: Duration) -> Self {
        Self::Timeout {
            operation,
            resource: resource.into(),
            deadline,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Api { .. } => ErrorKind::Api,
            Self::Reconciliation { .. } => ErrorKind::Reconciliation,
            Self::Conversion { .. } => ErrorKind::Conversion,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether requeueing the key that produced this error can make progress.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::Conversion | ErrorKind::Configuration
        )
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Api => "api",
            Self::Reconciliation => "reconciliation",
            Self::Conversion => "conversion",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }
}

/// The failures collected while fanning a single key out over its paired
/// resources. Every error is retained for metrics; display leads with the
/// first.
#[derive(Debug)]
pub struct Errors(Vec<Error>);

impl Errors {
    pub fn ok_if_empty(errors: Vec<Error>) -> Result<(), Errors> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self(errors))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }

    /// A key is requeued unless every collected error is terminal.
    pub fn is_retryable(&self) -> bool {
        self.0.iter().any(|e| e.is_retryable())
    }
}

impl From<Error> for Errors {
    fn from(error: Error) -> Self {
        Self(vec![error])
    }
}

impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0[0])?;
        for e in &self.0[1..] {
            write!(f, "; and {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_kind() {
        assert!(!Error::validation("project", "cm", "bad key").is_retryable());
        assert!(!Error::conversion("decode", "pcmc", "bad action").is_retryable());
        assert!(!Error::configuration("renew deadline must be less than the lease duration")
            .is_retryable());
        assert!(Error::timeout("reconcile", "pod", Duration::from_secs(30)).is_retryable());
        assert!(Error::reconciliation("sync", "pod", "pair failed").is_retryable());
    }

    #[test]
    fn aggregate_retries_when_any_error_does() {
        let errs = Errors::ok_if_empty(vec![
            Error::validation("project", "cm", "bad key"),
            Error::reconciliation("sync", "pod", "api flake"),
        ])
        .unwrap_err();
        assert!(errs.is_retryable());

        let errs = Errors::ok_if_empty(vec![Error::validation("project", "cm", "bad key")])
            .unwrap_err();
        assert!(!errs.is_retryable());
    }

    #[test]
    fn aggregate_display_chains() {
        let errs = Errors::ok_if_empty(vec![
            Error::validation("project", "cm-a", "x"),
            Error::validation("project", "cm-b", "y"),
        ])
        .unwrap_err();
        let msg = errs.to_string();
        assert!(msg.contains("cm-a"));
        assert!(msg.contains("; and "));
    }
}
