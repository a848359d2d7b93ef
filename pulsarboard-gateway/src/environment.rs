use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Reference to the admin API credential. Only the reference is kept; the
/// token itself is read on every call and never stored.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    TokenEnv(String),
    TokenFile(PathBuf),
}

impl Credential {
    /// Resolve the bearer token, if any. A token file is read without
    /// blocking the runtime.
    pub async fn resolve(&self) -> Result<Option<String>, String> {
        match self {
            Credential::None => Ok(None),
            Credential::TokenEnv(var) => std::env::var(var)
                .map(|token| Some(token.trim().to_string()))
                .map_err(|_| format!("environment variable {} is not set", var)),
            Credential::TokenFile(path) => tokio::fs::read_to_string(path)
                .await
                .map(|token| Some(token.trim().to_string()))
                .map_err(|e| format!("unable to read token file {}: {}", path.display(), e)),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Credential::None => "none",
            Credential::TokenEnv(_) | Credential::TokenFile(_) => "token",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::TokenEnv(_) => f.write_str("TokenEnv(<redacted>)"),
            Credential::TokenFile(_) => f.write_str("TokenFile(<redacted>)"),
        }
    }
}

/// The active cluster connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub admin_url: String,
    pub credential: Credential,
    pub request_timeout: Duration,
}

impl Environment {
    pub fn view(&self) -> EnvironmentView {
        EnvironmentView {
            name: self.name.clone(),
            admin_url: self.admin_url.clone(),
            auth_mode: self.credential.mode(),
            request_timeout_ms: self.request_timeout.as_millis() as u64,
        }
    }
}

/// What the HTTP API shows of an environment: no credential reference.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentView {
    pub name: String,
    pub admin_url: String,
    pub auth_mode: &'static str,
    pub request_timeout_ms: u64,
}

/// Shared, swappable handle on the single active [`Environment`].
///
/// Readers take a cheap `Arc` snapshot per call, so an update never tears a
/// request in half.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    tx: Arc<watch::Sender<Arc<Environment>>>,
}

impl EnvironmentHandle {
    pub fn new(environment: Environment) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(environment));
        EnvironmentHandle { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<Environment> {
        self.tx.borrow().clone()
    }

    /// Swap the descriptor, returning the previous one.
    pub fn replace(&self, environment: Environment) -> Arc<Environment> {
        self.tx.send_replace(Arc::new(environment))
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Environment>> {
        self.tx.subscribe()
    }
}
