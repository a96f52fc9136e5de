//! Admin credentials and signed session tokens.
//!
//! Passwords are stored as Argon2id PHC strings. Tokens are compact HS256
//! JWTs carrying `sub`, `iat` and `exp`.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::resolve_string_field;
use crate::db::admin;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const MIN_PASSWORD_LEN: usize = 8;
const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
const TOKEN_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

fn default_secret_env() -> Option<String> {
    Some("JWT_SECRET".into())
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_admin_username() -> String {
    "admin".into()
}

fn default_initial_password_env() -> Option<String> {
    Some("ADMIN_PASSWORD".into())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub secret: Option<String>,
    #[serde(default = "default_secret_env")]
    pub secret_env: Option<String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    #[serde(default = "default_initial_password_env")]
    pub initial_password_env: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            secret_env: default_secret_env(),
            token_ttl_secs: default_token_ttl_secs(),
            admin_username: default_admin_username(),
            initial_password_env: default_initial_password_env(),
        }
    }
}

impl AuthConfig {
    /// The token signing key. Required; there is no fallback key.
    pub fn signing_secret(&self) -> Result<Vec<u8>> {
        resolve_string_field(self.secret.as_deref(), self.secret_env.as_deref())
            .map(String::into_bytes)
            .ok_or_else(|| {
                Error::validation(format!(
                    "no token secret configured; set auth.secret or {}",
                    self.secret_env.as_deref().unwrap_or("auth.secret_env")
                ))
            })
    }

    pub fn initial_password(&self) -> Option<String> {
        self.initial_password_env
            .as_deref()
            .and_then(|k| std::env::var(k).ok())
            .filter(|s| !s.is_empty())
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::msg(format!("argon2 hash: {e}")))
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "stored password hash is not a PHC string");
            false
        }
    }
}

fn check_new_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Create the first admin account. Does nothing when any admin exists, so an
/// existing password is never reset on boot. Returns whether a row was added.
pub fn ensure_admin(
    conn: &Connection,
    username: &str,
    initial_password: Option<&str>,
) -> Result<bool> {
    if admin::count(conn)? > 0 {
        return Ok(false);
    }
    let Some(password) = initial_password else {
        tracing::warn!(username, "no admin account and no initial password provided");
        return Ok(false);
    };
    check_new_password(password)?;
    admin::insert(conn, username, &hash_password(password)?)?;
    tracing::info!(username, "created initial admin account");
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

fn sign(secret: &[u8], input: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::msg(format!("invalid signing key: {e}")))?;
    mac.update(input.as_bytes());
    Ok(mac)
}

pub fn issue_token(secret: &[u8], claims: &Claims) -> Result<String> {
    let payload = serde_json::to_vec(claims)?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(TOKEN_HEADER),
        URL_SAFE_NO_PAD.encode(payload)
    );
    let sig = sign(secret, &signing_input)?.finalize().into_bytes();
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

/// Check credentials and issue a token valid for `ttl_secs`.
pub fn login(
    conn: &Connection,
    secret: &[u8],
    username: &str,
    password: &str,
    ttl_secs: u64,
) -> Result<String> {
    let hash = admin::password_hash(conn, username)?;
    if !hash.is_some_and(|h| verify_password(&h, password)) {
        tracing::warn!(username, "rejected login");
        return Err(Error::validation("invalid username or password"));
    }
    let iat = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: username.to_string(),
        iat,
        exp: iat.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX)),
    };
    tracing::info!(username, "admin logged in");
    issue_token(secret, &claims)
}

pub fn verify_token(secret: &[u8], token: &str) -> Result<Claims> {
    verify_token_at(secret, token, chrono::Utc::now().timestamp())
}

pub fn verify_token_at(secret: &[u8], token: &str, now: i64) -> Result<Claims> {
    let invalid = || Error::validation("invalid token");
    let (signing_input, sig_part) = token.rsplit_once('.').ok_or_else(invalid)?;
    let (header_part, payload_part) = signing_input.split_once('.').ok_or_else(invalid)?;

    let header = URL_SAFE_NO_PAD.decode(header_part).map_err(|_| invalid())?;
    let header: serde_json::Value = serde_json::from_slice(&header).map_err(|_| invalid())?;
    if header.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
        return Err(Error::validation("unsupported token algorithm"));
    }

    let sig = URL_SAFE_NO_PAD.decode(sig_part).map_err(|_| invalid())?;
    sign(secret, signing_input)?
        .verify_slice(&sig)
        .map_err(|_| Error::validation("token signature mismatch"))?;

    let payload = URL_SAFE_NO_PAD.decode(payload_part).map_err(|_| invalid())?;
    let claims: Claims = serde_json::from_slice(&payload).map_err(|_| invalid())?;
    if claims.exp <= now {
        return Err(Error::validation("token expired"));
    }
    Ok(claims)
}

pub fn change_password(
    conn: &Connection,
    username: &str,
    current: &str,
    new_password: &str,
) -> Result<()> {
    let hash = admin::password_hash(conn, username)?
        .ok_or_else(|| Error::not_found(format!("admin {username} not found")))?;
    if !verify_password(&hash, current) {
        return Err(Error::validation("current password is incorrect"));
    }
    check_new_password(new_password)?;
    admin::set_password_hash(conn, username, &hash_password(new_password)?)?;
    tracing::info!(username, "admin password changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::error::ErrorKind;

    const SECRET: &[u8] = b"test-secret";

    fn with_admin() -> Connection {
        let conn = db::open_in_memory().expect("db");
        assert!(ensure_admin(&conn, "admin", Some("correct horse")).expect("seed"));
        conn
    }

    #[test]
    fn ensure_admin_never_resets() {
        let conn = with_admin();
        assert!(!ensure_admin(&conn, "admin", Some("another one")).expect("again"));
        assert!(login(&conn, SECRET, "admin", "correct horse", 60).is_ok());
        assert!(login(&conn, SECRET, "admin", "another one", 60).is_err());
    }

    #[test]
    fn no_initial_password_means_no_admin() {
        let conn = db::open_in_memory().expect("db");
        assert!(!ensure_admin(&conn, "admin", None).expect("skip"));
        assert_eq!(admin::count(&conn).expect("count"), 0);
    }

    #[test]
    fn login_issues_verifiable_token() {
        let conn = with_admin();
        let token = login(&conn, SECRET, "admin", "correct horse", 3600).expect("login");
        assert_eq!(token.matches('.').count(), 2);
        let claims = verify_token(SECRET, &token).expect("verify");
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn wrong_password_and_unknown_user_look_the_same() {
        let conn = with_admin();
        let a = login(&conn, SECRET, "admin", "nope", 60).unwrap_err();
        let b = login(&conn, SECRET, "ghost", "nope", 60).unwrap_err();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.kind(), ErrorKind::Validation);
    }

    #[test]
    fn expired_and_tampered_tokens_fail() {
        let claims = Claims {
            sub: "admin".into(),
            iat: 1_000,
            exp: 2_000,
        };
        let token = issue_token(SECRET, &claims).expect("issue");
        assert_eq!(verify_token_at(SECRET, &token, 1_500).expect("valid"), claims);
        let err = verify_token_at(SECRET, &token, 2_000).unwrap_err();
        assert!(err.to_string().contains("token expired"), "{err}");
        assert!(verify_token_at(b"other", &token, 1_500).is_err());

        let forged = Claims {
            sub: "root".into(),
            ..claims
        };
        let (head, _) = token.split_once('.').expect("parts");
        let sig = token.rsplit_once('.').expect("sig").1;
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).expect("json"));
        assert!(verify_token_at(SECRET, &format!("{head}.{body}.{sig}"), 1_500).is_err());
        assert!(verify_token_at(SECRET, "garbage", 1_500).is_err());
    }

    #[test]
    fn change_password_checks_current_and_length() {
        let conn = with_admin();
        let err = change_password(&conn, "admin", "wrong", "long enough pw").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = change_password(&conn, "admin", "correct horse", "short").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        change_password(&conn, "admin", "correct horse", "battery staple").expect("change");
        assert!(login(&conn, SECRET, "admin", "battery staple", 60).is_ok());
        assert!(login(&conn, SECRET, "admin", "correct horse", 60).is_err());
    }

    #[test]
    fn missing_secret_refuses_to_sign() {
        let cfg = AuthConfig {
            secret_env: Some("DOCVAULT_TEST_AUTH_NO_SECRET".into()),
            ..AuthConfig::default()
        };
        let err = cfg.signing_secret().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let cfg = AuthConfig {
            secret: Some("from-config".into()),
            ..cfg
        };
        assert_eq!(cfg.signing_secret().expect("secret"), b"from-config");
    }
}
