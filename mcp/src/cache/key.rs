//! Cache keys and the configuration hash.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::{
    error::{McpError, McpResult},
    identity::{SessionId, UserId},
};

/// `(user, session, stable_hash(config))`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    user: UserId,
    session: SessionId,
    config_hash: String,
}

impl CacheKey {
    pub fn new(user: UserId, session: SessionId, config_hash: impl Into<String>) -> Self {
        Self {
            user,
            session,
            config_hash: config_hash.into(),
        }
    }

    /// Fails with [`McpError::Config`] if `config` cannot be represented as JSON.
    pub fn for_config<C>(user: UserId, session: SessionId, config: &C) -> McpResult<Self>
    where
        C: Serialize + ?Sized,
    {
        Ok(Self::new(user, session, stable_hash(config)?))
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.config_hash.get(..12).unwrap_or(&self.config_hash);
        write!(f, "{}/{}/{}", self.user, self.session, short)
    }
}

/// Hex blake3 digest of `config` in canonical JSON form.
///
/// Object keys are sorted at every level, so field and map ordering never
/// changes the hash. Array order is significant.
pub fn stable_hash<C>(config: &C) -> McpResult<String>
where
    C: Serialize + ?Sized,
{
    let value = serde_json::to_value(config)
        .map_err(|e| McpError::Config(format!("configuration is not hashable: {}", e)))?;
    let mut hasher = blake3::Hasher::new();
    write_canonical(&value, &mut hasher);
    Ok(hasher.finalize().to_hex().to_string())
}

fn write_canonical(value: &Value, hasher: &mut blake3::Hasher) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));
            hasher.update(b"{");
            for (i, (key, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                write_canonical(field, hasher);
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                write_canonical(item, hasher);
            }
            hasher.update(b"]");
        }
        scalar => {
            hasher.update(scalar.to_string().as_bytes());
        }
    }
}
