//! Error types for federated directory operations

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Boxed underlying cause carried by backend failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("{entity_type} '{name}' already exists")]
    AlreadyExists { entity_type: String, name: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Group belongs to provider '{actual}', expected '{expected}'")]
    WrongProvider { expected: String, actual: String },

    #[error("Unsupported: {message}")]
    Unsupported { message: String },

    #[error("Provider '{provider_id}' could not resolve {entity_provider} entity '{sid}': {reason}")]
    ResolutionFailed {
        provider_id: String,
        entity_provider: String,
        sid: String,
        reason: String,
    },

    #[error("Backend error in provider '{provider_id}': {message}")]
    Backend {
        provider_id: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Provider '{provider_id}': {message}")]
    Provider {
        provider_id: String,
        message: String,
        #[source]
        source: Box<DirectoryError>,
    },

    #[error("{message} ({})", AggregateCauses(.errors))]
    Aggregate {
        message: String,
        errors: Vec<DirectoryError>,
    },
}

struct AggregateCauses<'a>(&'a [DirectoryError]);

impl fmt::Display for AggregateCauses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", error)?;
            let mut cause = error.source();
            while let Some(inner) = cause {
                write!(f, ": {}", inner)?;
                cause = inner.source();
            }
        }
        Ok(())
    }
}

impl DirectoryError {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn already_exists(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity_type: entity_type.into(),
            name: name.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn wrong_provider(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::WrongProvider {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    pub fn resolution_failed(
        provider_id: impl Into<String>,
        entity_provider: impl Into<String>,
        sid: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ResolutionFailed {
            provider_id: provider_id.into(),
            entity_provider: entity_provider.into(),
            sid: sid.into(),
            reason: reason.into(),
        }
    }

    /// Backend failure without an underlying error value.
    pub fn backend(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            provider_id: provider_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Backend failure wrapping the I/O or protocol error that caused it.
    pub fn backend_with_source<E>(
        provider_id: impl Into<String>,
        message: impl Into<String>,
        source: E,
    ) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Backend {
            provider_id: provider_id.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Attributes `inner` to a provider and describes the operation that failed.
    pub fn provider(
        provider_id: impl Into<String>,
        message: impl Into<String>,
        inner: DirectoryError,
    ) -> Self {
        Self::Provider {
            provider_id: provider_id.into(),
            message: message.into(),
            source: Box::new(inner),
        }
    }

    /// Collapses per-provider failures: a single error is returned as-is,
    /// several become an `Aggregate` that keeps every cause.
    pub fn aggregate(message: impl Into<String>, mut errors: Vec<DirectoryError>) -> Self {
        if errors.len() == 1 {
            return errors.remove(0);
        }
        Self::Aggregate {
            message: message.into(),
            errors,
        }
    }

    /// Strips `Provider` wrappers down to the error the backend reported.
    pub fn root(&self) -> &DirectoryError {
        match self {
            Self::Provider { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Self::AlreadyExists { .. })
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self.root(), Self::Unsupported { .. })
    }

    pub fn is_wrong_provider(&self) -> bool {
        matches!(self.root(), Self::WrongProvider { .. })
    }

    pub fn is_resolution_failure(&self) -> bool {
        matches!(self.root(), Self::ResolutionFailed { .. })
    }

    /// Errors carried by an `Aggregate`, or an empty slice.
    pub fn causes(&self) -> &[DirectoryError] {
        match self {
            Self::Aggregate { errors, .. } => errors,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, DirectoryError>;
