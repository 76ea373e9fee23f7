use rusqlite::Connection;

use crate::db;
use crate::ipc::error::HandlerErr;
use crate::principal::{self, Principal, Role};
use crate::session::{self, TokenError};

// Resolve params.token to a live principal. The token payload is only an
// addressing hint; the current record is always re-fetched so deactivation
// takes effect immediately even for still-valid tokens.
pub fn authenticate(conn: &Connection, params: &serde_json::Value) -> Result<Principal, HandlerErr> {
    let Some(token) = params.get("token").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::new("missing_token", "missing params.token"));
    };
    if token.trim().is_empty() {
        return Err(HandlerErr::new("missing_token", "missing params.token"));
    }

    let secret = db::token_secret(conn).map_err(HandlerErr::db_query)?;
    let claims = session::verify_token(&secret, token).map_err(|e| match e {
        TokenError::UnknownRole => HandlerErr::new("unknown_role", "token role is not recognized"),
        TokenError::Expired => HandlerErr::new("invalid_token", "token expired"),
        TokenError::Malformed | TokenError::BadSignature => {
            HandlerErr::new("invalid_token", "invalid token")
        }
    })?;

    let principal = principal::find_by_id(conn, claims.role, &claims.principal_id)
        .map_err(HandlerErr::db_query)?
        .ok_or_else(|| HandlerErr::new("principal_not_found", "principal not found"))?;

    if !principal.active {
        return Err(HandlerErr::new(
            "account_deactivated",
            "account is deactivated",
        ));
    }

    Ok(principal)
}

pub fn require_role(principal: &Principal, allowed: &[Role]) -> Result<(), HandlerErr> {
    if allowed.contains(&principal.role) {
        Ok(())
    } else {
        Err(HandlerErr::forbidden(
            "access denied: insufficient permissions",
        ))
    }
}
