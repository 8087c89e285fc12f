// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bearer-token signing and verification.
//!
//! Every RPC carries an HS256 JSON-Web-Token in the request envelope.
//! The `authKey` claim must match the key configured on the agent; the
//! signature is keyed by the shared sign key.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Token validation errors.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token is not a three-part JWT.
    #[error("malformed token")]
    Malformed,

    /// The header does not declare HS256.
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The signature does not match the sign key.
    #[error("invalid token signature")]
    InvalidSignature,

    /// The claims object could not be decoded.
    #[error("invalid token claims")]
    InvalidClaims,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims carried by an agent token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Caller authentication key; must equal the agent's configured auth key.
    #[serde(rename = "authKey")]
    pub auth_key: String,
    /// Issued-at, seconds since the Unix epoch.
    pub iat: i64,
}

/// Sign a token carrying `auth_key`, keyed by `sign_key`.
pub fn sign(sign_key: &str, auth_key: &str) -> String {
    let header = Header {
        alg: "HS256".to_string(),
        typ: "JWT".to_string(),
    };
    let claims = Claims {
        auth_key: auth_key.to_string(),
        iat: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
    };

    // serde_json cannot fail on these shapes
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
    let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
    let signing_input = format!("{header_b64}.{claims_b64}");

    let mut mac = HmacSha256::new_from_slice(sign_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{signing_input}.{signature}")
}

/// Verify a token's structure and signature and return its claims.
///
/// The caller compares [`Claims::auth_key`] against the configured auth key.
pub fn verify(token: &str, sign_key: &str) -> Result<Claims, TokenError> {
    let mut parts = token.split('.');
    let (header_b64, claims_b64, signature_b64) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(c), Some(s), None) => (h, c, s),
            _ => return Err(TokenError::Malformed),
        };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| TokenError::Malformed)?;
    let header: Header =
        serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;
    if header.alg != "HS256" {
        return Err(TokenError::UnsupportedAlgorithm(header.alg));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(sign_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| TokenError::InvalidClaims)?;
    serde_json::from_slice(&claims_bytes).map_err(|_| TokenError::InvalidClaims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let token = sign("sign-key", "auth-key");
        let claims = verify(&token, "sign-key").unwrap();
        assert_eq!(claims.auth_key, "auth-key");
        assert!(claims.iat > 0);
    }

    #[test]
    fn wrong_sign_key_rejected() {
        let token = sign("sign-key", "auth-key");
        assert!(matches!(
            verify(&token, "other-key"),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_claims_rejected() {
        let token = sign("sign-key", "auth-key");
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"authKey":"admin","iat":0}"#);
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert!(verify(&forged_token, "sign-key").is_err());
    }

    #[test]
    fn malformed_token_rejected() {
        assert!(matches!(verify("", "k"), Err(TokenError::Malformed)));
        assert!(matches!(verify("a.b", "k"), Err(TokenError::Malformed)));
        assert!(matches!(
            verify("a.b.c.d", "k"),
            Err(TokenError::Malformed)
        ));
        assert!(verify("!!.??.**", "k").is_err());
    }

    #[test]
    fn non_hs256_header_rejected() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(br#"{"authKey":"auth-key","iat":0}"#);
        let token = format!("{header}.{claims}.");
        assert!(matches!(
            verify(&token, "sign-key"),
            Err(TokenError::UnsupportedAlgorithm(_))
        ));
    }
}
