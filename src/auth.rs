/* chatrelay/src/auth.rs

Credential translation: client bearer -> upstream bearer.

- Clients present `Authorization: Bearer <client-key>`.
- The key is looked up in a `CredentialStore` (read-only after startup).
- The outbound header set carries only the mapped upstream bearer; the
  client key is never forwarded.

Credential sources (see `StaticCredentialStore`):
- File (JSON or YAML, by extension), either a list
      [{ client_key, upstream_key, label? }, ...]
  or a plain map { "<client_key>": "<upstream_key>" }.
- Inline spec: "client=upstream;client2=env:OPENAI_API_KEY"
  (CHATRELAY_CREDENTIALS).

An upstream value of the form `env:NAME` is read from the environment at load
time. Logs refer to clients by `fingerprint(key)`, never the raw key.

*/

#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::GatewayError;

// ==============================
// Public model
// ==============================

/// Upstream bearer plus an optional identity label for logs.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamCredential {
    pub api_key: String,
    pub label: Option<String>,
}

impl fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredential")
            .field("api_key", &"<redacted>")
            .field("label", &self.label)
            .finish()
    }
}

/// One entry of a credentials file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub client_key: String,
    pub upstream_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CredentialFile {
    List(Vec<CredentialEntry>),
    Wrapped { credentials: Vec<CredentialEntry> },
    Map(HashMap<String, String>),
}

// ==============================
// Storage trait
// ==============================

/// Read-only credential mapping shared by all request tasks.
pub trait CredentialStore: Send + Sync {
    fn lookup_credential(&self, client_key: &str) -> Option<UpstreamCredential>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable in-memory mapping, built once at startup. Lookups need no lock.
#[derive(Default)]
pub struct StaticCredentialStore {
    entries: HashMap<String, UpstreamCredential>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = CredentialEntry>,
    {
        let mut store = Self::new();
        for entry in entries {
            store.insert(entry)?;
        }
        Ok(store)
    }

    /// Add or replace a mapping. Only valid while the store is being built.
    pub fn insert(&mut self, entry: CredentialEntry) -> Result<()> {
        let client_key = entry.client_key.trim().to_string();
        if client_key.is_empty() {
            bail!("credential entry has an empty client_key");
        }
        let api_key = resolve_secret(entry.upstream_key.trim())
            .with_context(|| format!("credential for client {}", fingerprint(&client_key)))?;
        if api_key.is_empty() {
            bail!(
                "credential for client {} has an empty upstream_key",
                fingerprint(&client_key)
            );
        }
        if self.entries.contains_key(&client_key) {
            warn!(client = %fingerprint(&client_key), "duplicate client key; later entry wins");
        }
        self.entries.insert(
            client_key,
            UpstreamCredential {
                api_key,
                label: entry.label,
            },
        );
        Ok(())
    }

    /// Fold another store into this one; entries from `other` win.
    pub fn merge(&mut self, other: StaticCredentialStore) {
        for (client_key, credential) in other.entries {
            if self.entries.insert(client_key.clone(), credential).is_some() {
                warn!(client = %fingerprint(&client_key), "duplicate client key; later entry wins");
            }
        }
    }

    /// Load from a JSON or YAML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading credentials file {}", path.display()))?;
        let parsed: CredentialFile = if crate::config::is_yaml(path) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        let entries = match parsed {
            CredentialFile::List(list) | CredentialFile::Wrapped { credentials: list } => list,
            CredentialFile::Map(map) => map
                .into_iter()
                .map(|(client_key, upstream_key)| CredentialEntry {
                    client_key,
                    upstream_key,
                    label: None,
                })
                .collect(),
        };
        let store = Self::from_entries(entries)?;
        info!(path = %path.display(), count = store.len(), "Loaded credentials");
        Ok(store)
    }

    /// Parse `client=upstream;client2=env:VAR` (commas also separate pairs).
    pub fn from_spec(spec: &str) -> Result<Self> {
        let mut store = Self::new();
        for pair in spec.split([';', ',']) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (client, upstream) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("credential pair without '=': expected client=upstream"))?;
            store.insert(CredentialEntry {
                client_key: client.to_string(),
                upstream_key: upstream.to_string(),
                label: None,
            })?;
        }
        Ok(store)
    }
}

impl CredentialStore for StaticCredentialStore {
    fn lookup_credential(&self, client_key: &str) -> Option<UpstreamCredential> {
        self.entries.get(client_key).cloned()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn resolve_secret(raw: &str) -> Result<String> {
    match raw.strip_prefix("env:") {
        Some(var) => {
            let var = var.trim();
            std::env::var(var)
                .map(|v| v.trim().to_string())
                .map_err(|_| anyhow!("environment variable {var} is not set"))
        }
        None => Ok(raw.to_string()),
    }
}

// ==============================
// Translation
// ==============================

/// Short, stable identifier for a secret, safe to log.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..6])
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_from_header(auth_header: Option<&str>) -> Option<&str> {
    let s = auth_header?.trim();
    let scheme_ok = s.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("bearer"));
    if scheme_ok && s.as_bytes().get(6) == Some(&b' ') {
        let token = s[7..].trim();
        (!token.is_empty()).then_some(token)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct CredentialTranslator {
    store: Arc<dyn CredentialStore>,
}

impl CredentialTranslator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Map the client's bearer to the upstream header set.
    pub fn translate(&self, client_credential: Option<&str>) -> Result<HeaderMap, GatewayError> {
        let key = client_credential
            .ok_or_else(|| GatewayError::Auth("Missing Authorization bearer".into()))?;

        let upstream = self.store.lookup_credential(key).ok_or_else(|| {
            debug!(client = %fingerprint(key), "unknown client credential");
            GatewayError::Auth("Invalid API key".into())
        })?;
        debug!(
            client = %fingerprint(key),
            label = upstream.label.as_deref().unwrap_or("-"),
            "client credential accepted"
        );

        let mut value = HeaderValue::from_str(&format!("Bearer {}", upstream.api_key))
            .map_err(|_| GatewayError::Internal("upstream credential is not a valid header value".into()))?;
        value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    /// Convenience for the raw `Authorization` header value.
    pub fn translate_header(&self, auth_header: Option<&str>) -> Result<HeaderMap, GatewayError> {
        self.translate(bearer_from_header(auth_header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn translator(spec: &str) -> CredentialTranslator {
        CredentialTranslator::new(Arc::new(StaticCredentialStore::from_spec(spec).unwrap()))
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_from_header(Some("Bearer sk-1")), Some("sk-1"));
        assert_eq!(bearer_from_header(Some("  bearer   sk-2 ")), Some("sk-2"));
        assert_eq!(bearer_from_header(Some("Basic abc")), None);
        assert_eq!(bearer_from_header(Some("Bearer ")), None);
        assert_eq!(bearer_from_header(Some("Bearersk")), None);
        assert_eq!(bearer_from_header(None), None);
    }

    #[test]
    fn translate_replaces_client_credential() {
        let t = translator("sk-my-secret-key-1=sk-upstream-abc");
        let headers = t.translate_header(Some("Bearer sk-my-secret-key-1")).unwrap();
        assert_eq!(headers.len(), 1);
        let auth = headers.get(AUTHORIZATION).unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer sk-upstream-abc");
        assert!(auth.is_sensitive());
        assert!(!format!("{headers:?}").contains("sk-my-secret-key-1"));
    }

    #[test]
    fn unknown_or_missing_credential_is_auth_error() {
        let t = translator("a=b");
        assert!(matches!(
            t.translate_header(Some("Bearer nope")),
            Err(GatewayError::Auth(m)) if m == "Invalid API key"
        ));
        assert!(matches!(
            t.translate_header(None),
            Err(GatewayError::Auth(m)) if m == "Missing Authorization bearer"
        ));
    }

    #[test]
    fn spec_resolves_env_values() {
        std::env::set_var("CHATRELAY_TEST_UPSTREAM_KEY", "sk-from-env");
        let store = StaticCredentialStore::from_spec(
            "c1=env:CHATRELAY_TEST_UPSTREAM_KEY; c2=sk-inline",
        )
        .unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup_credential("c1").unwrap().api_key, "sk-from-env");
        assert_eq!(store.lookup_credential("c2").unwrap().api_key, "sk-inline");

        assert!(StaticCredentialStore::from_spec("c3=env:CHATRELAY_TEST_SURELY_UNSET").is_err());
        assert!(StaticCredentialStore::from_spec("novalue").is_err());
        assert!(StaticCredentialStore::from_spec("=x").is_err());
    }

    #[test]
    fn loads_list_and_map_files() {
        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            json,
            r#"[{{"client_key": "sk-client", "upstream_key": "sk-up", "label": "team-a"}}]"#
        )
        .unwrap();
        let store = StaticCredentialStore::load_from_file(json.path()).unwrap();
        let cred = store.lookup_credential("sk-client").unwrap();
        assert_eq!(cred.api_key, "sk-up");
        assert_eq!(cred.label.as_deref(), Some("team-a"));

        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(yaml, "sk-one: sk-up-one\nsk-two: sk-up-two").unwrap();
        let store = StaticCredentialStore::load_from_file(yaml.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup_credential("sk-two").unwrap().api_key, "sk-up-two");

        let mut wrapped = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            wrapped,
            "credentials:\n  - client_key: k\n    upstream_key: u\n"
        )
        .unwrap();
        let store = StaticCredentialStore::load_from_file(wrapped.path()).unwrap();
        assert!(store.lookup_credential("k").is_some());
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let a = fingerprint("sk-my-secret-key-1");
        assert_eq!(a.len(), 12);
        assert_eq!(a, fingerprint("sk-my-secret-key-1"));
        assert_ne!(a, fingerprint("sk-my-secret-key-2"));
    }

    #[test]
    fn debug_redacts_upstream_key() {
        let cred = UpstreamCredential {
            api_key: "sk-secret".into(),
            label: None,
        };
        assert!(!format!("{cred:?}").contains("sk-secret"));
    }
}
