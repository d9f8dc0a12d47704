use std::env;

pub const CREDENTIAL_SERVICE: &str = "cascader";

/// Narrow seam for secret lookup. The run engine only ever asks for a named
/// secret; where it lives is the caller's concern.
pub trait CredentialProvider: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// OS credential vault first, `CASCADER_SECRET_<NAME>` environment variable
/// as the fallback when no vault backend is usable.
#[derive(Debug, Clone, Default)]
pub struct SystemCredentials;

fn env_name(name: &str) -> String {
    format!("CASCADER_SECRET_{}", name.to_ascii_uppercase())
}

impl CredentialProvider for SystemCredentials {
    fn get(&self, name: &str) -> Option<String> {
        if let Ok(entry) = keyring::Entry::new(CREDENTIAL_SERVICE, name) {
            if let Ok(value) = entry.get_password() {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        env::var(env_name(name)).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed map of secrets for tests and embedding callers.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: std::collections::BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.entries.insert(name.to_string(), value.to_string());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn get(&self, name: &str) -> Option<String> {
        self.entries.get(name).cloned()
    }
}
