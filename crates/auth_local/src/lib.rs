use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argon2::Argon2;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use core_types::{AuthError, AuthProvider, AuthUser, FederatedProvider};
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA_VERSION: u32 = 1;
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    schema_version: u32,
    #[serde(default)]
    accounts: BTreeMap<String, AccountRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountRecord {
    uid: String,
    email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    salt_b64: String,
    hash_b64: String,
}

impl AccountRecord {
    fn user(&self) -> AuthUser {
        AuthUser {
            uid: self.uid.clone(),
            email: Some(self.email.clone()),
            display_name: self.display_name.clone(),
        }
    }
}

/// E-mail/password accounts kept in a JSON file, passwords hashed with argon2.
#[derive(Debug)]
pub struct LocalAuth {
    root: PathBuf,
    current: Mutex<Option<AuthUser>>,
}

impl LocalAuth {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: Mutex::new(None),
        }
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.root.join("accounts.json")
    }

    fn load(&self) -> Result<AccountsFile> {
        let path = self.accounts_path();
        if !path.exists() {
            return Ok(AccountsFile {
                schema_version: SCHEMA_VERSION,
                ..AccountsFile::default()
            });
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file: AccountsFile = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if file.schema_version != SCHEMA_VERSION {
            warn!(
                from = file.schema_version,
                to = SCHEMA_VERSION,
                "accounts file schema version differs"
            );
        }
        Ok(file)
    }

    fn save(&self, file: &AccountsFile) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let text = serde_json::to_string_pretty(file)?;
        fs::write(self.accounts_path(), text)?;
        Ok(())
    }

    fn set_current(&self, user: AuthUser) -> AuthUser {
        *self.current.lock() = Some(user.clone());
        user
    }
}

#[async_trait]
impl AuthProvider for LocalAuth {
    fn current_user(&self) -> Option<AuthUser> {
        self.current.lock().clone()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, AuthError> {
        let key = normalize_email(email);
        let file = self.load().map_err(backend)?;
        let Some(record) = file.accounts.get(&key) else {
            return Err(AuthError::InvalidCredentials);
        };

        let salt = BASE64.decode(&record.salt_b64).map_err(|e| backend(e.into()))?;
        let expected = BASE64.decode(&record.hash_b64).map_err(|e| backend(e.into()))?;
        let actual = hash_password(password, &salt).map_err(backend)?;
        if actual.as_slice() != expected.as_slice() {
            return Err(AuthError::InvalidCredentials);
        }

        info!(uid = %record.uid, "user signed in");
        Ok(self.set_current(record.user()))
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, AuthError> {
        let email = email.trim();
        if !is_valid_email(email) {
            return Err(AuthError::InvalidEmail(email.to_string()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword {
                min: MIN_PASSWORD_LEN,
            });
        }

        let key = normalize_email(email);
        let mut file = self.load().map_err(backend)?;
        if file.accounts.contains_key(&key) {
            return Err(AuthError::AccountExists(email.to_string()));
        }

        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let hash = hash_password(password, &salt).map_err(backend)?;
        let record = AccountRecord {
            uid: Uuid::new_v4().to_string(),
            email: email.to_string(),
            display_name: None,
            salt_b64: BASE64.encode(salt),
            hash_b64: BASE64.encode(hash),
        };
        let user = record.user();
        file.schema_version = SCHEMA_VERSION;
        file.accounts.insert(key, record);
        self.save(&file).map_err(backend)?;

        info!(uid = %user.uid, "account created");
        Ok(self.set_current(user))
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if let Some(user) = self.current.lock().take() {
            info!(uid = %user.uid, "user signed out");
        }
        Ok(())
    }

    async fn sign_in_federated(&self, provider: FederatedProvider) -> Result<AuthUser, AuthError> {
        Err(AuthError::Unsupported(provider))
    }
}

fn hash_password(password: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut hash = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut hash)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain
            .split_once('.')
            .is_some_and(|(host, _)| !host.is_empty())
        && !domain.ends_with('.')
}

fn backend(err: anyhow::Error) -> AuthError {
    AuthError::Backend(format!("{err:#}"))
}

pub fn default_auth_dir_from(base_dir: &Path) -> PathBuf {
    base_dir.join("auth")
}
