use crate::AgentError;
use async_trait::async_trait;

/// Resolves the software version reported to the proxy
#[async_trait]
pub trait VersionResolver: Send + Sync {
    async fn resolve(&self) -> Result<String, AgentError>;
}

/// A fixed version string
#[derive(Debug, Clone)]
pub struct StaticVersion(String);

impl StaticVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// The version of this crate
    pub fn current() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl VersionResolver for StaticVersion {
    async fn resolve(&self) -> Result<String, AgentError> {
        if self.0.is_empty() {
            return Err(AgentError::Version("empty version string".to_string()));
        }
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_version() {
        let version = StaticVersion::new("12.1.0");
        assert_eq!(version.resolve().await.unwrap(), "12.1.0");

        let current = StaticVersion::current().resolve().await.unwrap();
        assert_eq!(current, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_empty_version_fails() {
        let err = StaticVersion::new("").resolve().await.unwrap_err();
        assert!(matches!(err, AgentError::Version(_)));
    }
}
