use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::principal::Role;

pub const TOKEN_VALIDITY_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
    pub principal_id: String,
    pub role: Role,
}

#[derive(Debug, PartialEq)]
pub enum TokenError {
    Malformed,
    BadSignature,
    Expired,
    UnknownRole,
}

pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{}${}", salt, digest_hex(&salt, password))
}

pub fn check_password(password: &str, stored: &str) -> bool {
    let Some((salt, expected)) = stored.split_once('$') else {
        return false;
    };
    digest_hex(salt, password) == expected
}

fn digest_hex(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex_encode(&hasher.finalize())
}

// Token format: hex(payload-json) "." hex(sha256(secret "." payload-hex)).
// The payload carries {sub, role, exp}; state is always re-fetched from
// storage by the gate, so the payload is only an addressing hint.
pub fn issue_token(secret: &str, principal_id: &str, role: Role) -> String {
    let exp = Utc::now().timestamp() + TOKEN_VALIDITY_DAYS * 24 * 60 * 60;
    let payload = serde_json::json!({
        "sub": principal_id,
        "role": role.as_str(),
        "exp": exp,
    });
    let payload_hex = hex_encode(payload.to_string().as_bytes());
    let sig = sign(secret, &payload_hex);
    format!("{}.{}", payload_hex, sig)
}

pub fn verify_token(secret: &str, token: &str) -> Result<TokenClaims, TokenError> {
    let Some((payload_hex, sig)) = token.split_once('.') else {
        return Err(TokenError::Malformed);
    };
    if sign(secret, payload_hex) != sig {
        return Err(TokenError::BadSignature);
    }
    let payload_bytes = hex_decode(payload_hex).ok_or(TokenError::Malformed)?;
    let payload: serde_json::Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Malformed)?;

    let sub = payload
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or(TokenError::Malformed)?;
    let role_raw = payload
        .get("role")
        .and_then(|v| v.as_str())
        .ok_or(TokenError::Malformed)?;
    let exp = payload
        .get("exp")
        .and_then(|v| v.as_i64())
        .ok_or(TokenError::Malformed)?;

    if exp < Utc::now().timestamp() {
        return Err(TokenError::Expired);
    }
    let role = Role::parse(role_raw).ok_or(TokenError::UnknownRole)?;

    Ok(TokenClaims {
        principal_id: sub.to_string(),
        role,
    })
}

fn sign(secret: &str, payload_hex: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b".");
    hasher.update(payload_hex.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrip_and_mismatch() {
        let stored = hash_password("secret123");
        assert!(check_password("secret123", &stored));
        assert!(!check_password("secret124", &stored));
        assert!(!check_password("secret123", "garbage-without-separator"));
    }

    #[test]
    fn distinct_salts_for_equal_passwords() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn token_roundtrip() {
        let token = issue_token("s3cret", "p-1", Role::Teacher);
        let claims = verify_token("s3cret", &token).expect("valid token");
        assert_eq!(claims.principal_id, "p-1");
        assert_eq!(claims.role, Role::Teacher);
    }

    #[test]
    fn token_rejects_wrong_secret_and_tampering() {
        let token = issue_token("s3cret", "p-1", Role::Student);
        assert_eq!(
            verify_token("other", &token),
            Err(TokenError::BadSignature)
        );

        let mut tampered = token.clone();
        // Flip a nibble in the payload half.
        let flip = if tampered.starts_with('0') { "1" } else { "0" };
        tampered.replace_range(0..1, flip);
        assert!(verify_token("s3cret", &tampered).is_err());

        assert_eq!(
            verify_token("s3cret", "no-dot-here"),
            Err(TokenError::Malformed)
        );
    }
}
