use crate::config::config::AppConfig;
use crate::plugins::roles::{AuthenticatedUser, AuthPlugin};
use anyhow::{anyhow, Context, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

const TOKEN_LIFETIME_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserEntry {
    password_hash: String,
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_models: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: String,
    exp: i64,
}

/// File-backed auth provider: users and argon2 password hashes from a YAML
/// file, HS256 JWTs for session tokens.
///
/// The signing secret comes from `JWT_SECRET_KEY`, then a `JWT_SECRET_FILE`
/// path. Ephemeral mode skips both: it provisions a single in-memory admin
/// user and a fresh secret for this run only.
pub struct YamlFileAuth {
    users: HashMap<String, UserEntry>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl YamlFileAuth {
    pub fn new(config: &AppConfig) -> Result<Self> {
        if config.ephemeral {
            return Self::ephemeral();
        }

        let secret = Self::resolve_secret(config)?;
        let users_path = config.users_path();
        let users = match std::fs::read_to_string(&users_path) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid users file {}", users_path.display()))?,
            Err(e) => {
                warn!(
                    "users file {} not readable ({e}); starting with no users",
                    users_path.display()
                );
                HashMap::new()
            }
        };
        info!("loaded {} user(s) from {}", users.len(), users_path.display());

        Ok(Self {
            users,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    /// Single in-memory admin user and a throwaway secret.
    fn ephemeral() -> Result<Self> {
        let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let password = Uuid::new_v4().simple().to_string();
        let entry = UserEntry {
            password_hash: Self::hash_password(&password)?,
            role: "admin".to_string(),
            allowed_models: None,
        };
        let mut users = HashMap::new();
        users.insert("admin".to_string(), entry);
        warn!("ephemeral mode: in-memory admin user provisioned, password: {password}");

        Ok(Self {
            users,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    fn resolve_secret(config: &AppConfig) -> Result<String> {
        if let Some(secret) = &config.jwt_secret_key {
            if !secret.is_empty() {
                info!("JWT secret loaded from JWT_SECRET_KEY");
                return Ok(secret.clone());
            }
        }
        if let Some(path) = &config.jwt_secret_file {
            let secret = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read JWT secret file {}", path.display()))?;
            let secret = secret.trim().to_string();
            if !secret.is_empty() {
                info!("JWT secret loaded from {}", path.display());
                return Ok(secret);
            }
        }
        Err(anyhow!(
            "no JWT secret configured; set JWT_SECRET_KEY, JWT_SECRET_FILE, or run in ephemeral mode"
        ))
    }

    pub fn hash_password(password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow!("password hashing failed: {e}"))?;
        Ok(hash.to_string())
    }

    fn verify_password(password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

#[async_trait]
impl AuthPlugin for YamlFileAuth {
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Option<AuthenticatedUser> {
        let entry = self.users.get(username)?;
        if !Self::verify_password(password, &entry.password_hash) {
            return None;
        }
        Some(AuthenticatedUser {
            username: username.to_string(),
            role: entry.role.clone(),
        })
    }

    fn create_token(&self, user: &AuthenticatedUser) -> Result<String> {
        let claims = Claims {
            sub: user.username.clone(),
            role: user.role.clone(),
            exp: (Utc::now() + Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow!("token creation failed: {e}"))
    }

    fn verify_token(&self, token: &str) -> Option<String> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .ok()
            .map(|data| data.claims.sub)
    }

    fn request_allowed(&self, username: &str, model: &str) -> bool {
        match self.users.get(username).and_then(|u| u.allowed_models.as_ref()) {
            Some(allowed) if !allowed.is_empty() => allowed.iter().any(|m| m == model),
            _ => true,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
