//! Signed bearer credentials.
//!
//! A credential is `base64url(claims JSON) "." base64url(HMAC-SHA256)`, keyed
//! by `auth.token_secret`. Two scopes exist: general session credentials and
//! short-lived stream credentials bound to a single video. Stream credentials
//! are meant for query strings, where they may end up in logs or history.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use vg_core::{Error, Result, Role, UserId, VideoId};

type HmacSha256 = Hmac<Sha256>;

/// What a credential may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TokenScope {
    Session,
    Stream { video: VideoId },
}

/// Claims carried inside a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    /// Expiry as unix seconds.
    pub exp: i64,
    pub scope: TokenScope,
}

/// The authenticated caller, as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
    pub org: Option<String>,
    pub scope: TokenScope,
}

impl Caller {
    pub fn is_elevated(&self) -> bool {
        self.role.has_elevated_privilege()
    }
}

impl From<Claims> for Caller {
    fn from(c: Claims) -> Self {
        Self {
            user_id: c.sub,
            role: c.role,
            org: c.org,
            scope: c.scope,
        }
    }
}

/// Issues and verifies credentials.
#[derive(Clone)]
pub struct TokenSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        if self.key.is_empty() {
            return Err(Error::Internal("credential signing key is not configured".into()));
        }
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("invalid signing key: {e}")))
    }

    /// Sign `claims` into a credential string.
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        let payload = serde_json::to_vec(claims).map_err(|e| Error::Internal(e.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(payload);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{payload}.{sig}"))
    }

    /// Issue a session credential valid for `ttl_secs`.
    pub fn issue_session(
        &self,
        user: UserId,
        role: Role,
        org: Option<String>,
        ttl_secs: i64,
    ) -> Result<String> {
        self.sign(&Claims {
            sub: user,
            role,
            org,
            exp: Utc::now().timestamp() + ttl_secs,
            scope: TokenScope::Session,
        })
    }

    /// Issue a stream credential for `video` on behalf of `caller`.
    pub fn issue_stream(&self, caller: &Caller, video: VideoId, ttl_secs: i64) -> Result<String> {
        self.sign(&Claims {
            sub: caller.user_id,
            role: caller.role,
            org: caller.org.clone(),
            exp: Utc::now().timestamp() + ttl_secs,
            scope: TokenScope::Stream { video },
        })
    }

    /// Verify signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verify against an explicit clock (unix seconds).
    pub fn verify_at(&self, token: &str, now: i64) -> Result<Claims> {
        let (payload, sig) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| Error::Unauthorized("malformed credential".into()))?;

        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| Error::Unauthorized("malformed credential signature".into()))?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| Error::Unauthorized("credential signature mismatch".into()))?;

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::Unauthorized("malformed credential payload".into()))?;
        let claims: Claims = serde_json::from_slice(&raw)
            .map_err(|_| Error::Unauthorized("malformed credential claims".into()))?;

        if claims.exp <= now {
            return Err(Error::Unauthorized("credential expired".into()));
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret-test-secret-test-secret!")
    }

    #[test]
    fn session_round_trip() {
        let s = signer();
        let user = UserId::new();
        let token = s
            .issue_session(user, Role::Editor, Some("acme".into()), 60)
            .unwrap();
        let claims = s.verify(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.role, Role::Editor);
        assert_eq!(claims.org.as_deref(), Some("acme"));
        assert_eq!(claims.scope, TokenScope::Session);
    }

    #[test]
    fn stream_token_is_bound_to_video() {
        let s = signer();
        let caller = Caller {
            user_id: UserId::new(),
            role: Role::Viewer,
            org: None,
            scope: TokenScope::Session,
        };
        let video = VideoId::new();
        let token = s.issue_stream(&caller, video, 300).unwrap();
        let claims = s.verify(&token).unwrap();
        assert_eq!(claims.scope, TokenScope::Stream { video });
    }

    #[test]
    fn expired_is_unauthorized() {
        let s = signer();
        let token = s
            .sign(&Claims {
                sub: UserId::new(),
                role: Role::Admin,
                org: None,
                exp: 1_000,
                scope: TokenScope::Session,
            })
            .unwrap();
        assert!(s.verify_at(&token, 999).is_ok());
        assert_matches!(s.verify_at(&token, 1_000), Err(Error::Unauthorized(_)));
    }

    #[test]
    fn tampered_payload_rejected() {
        let s = signer();
        let token = s.issue_session(UserId::new(), Role::Viewer, None, 60).unwrap();
        let (_, sig) = token.split_once('.').unwrap();

        let forged = Claims {
            sub: UserId::new(),
            role: Role::Admin,
            org: None,
            exp: i64::MAX,
            scope: TokenScope::Session,
        };
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let forged_token = format!("{forged_payload}.{sig}");
        assert_matches!(s.verify(&forged_token), Err(Error::Unauthorized(_)));
    }

    #[test]
    fn other_secret_rejected() {
        let token = signer()
            .issue_session(UserId::new(), Role::Viewer, None, 60)
            .unwrap();
        let other = TokenSigner::new("a-completely-different-secret-value");
        assert_matches!(other.verify(&token), Err(Error::Unauthorized(_)));
    }

    #[test]
    fn garbage_rejected() {
        let s = signer();
        for bad in ["", "nodot", "a.b", "!!!.???"] {
            assert_matches!(s.verify(bad), Err(Error::Unauthorized(_)), "{bad}");
        }
    }

    #[test]
    fn empty_key_signs_and_accepts_nothing() {
        let unkeyed = TokenSigner::new("");
        assert!(unkeyed
            .issue_session(UserId::new(), Role::Admin, None, 60)
            .is_err());

        let token = signer()
            .issue_session(UserId::new(), Role::Admin, None, 60)
            .unwrap();
        assert!(unkeyed.verify(&token).is_err());
    }
}

