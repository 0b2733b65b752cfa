//! Platform access tokens
//!
//! Relay sessions and room-control calls authenticate with short-lived HS256
//! JWTs signed with the platform API secret. The `video` grant scopes each
//! token to one room and a fixed set of capabilities.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{ParticipantIdentity, ParticipantRole, RoomId};

/// Capabilities granted by a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default)]
    pub room_join: bool,
    #[serde(default)]
    pub room_admin: bool,
    #[serde(default)]
    pub room_list: bool,
    #[serde(default)]
    pub can_publish: bool,
    #[serde(default)]
    pub can_subscribe: bool,
    #[serde(default)]
    pub can_publish_data: bool,
}

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// API key
    pub iss: String,
    /// Participant identity (empty for server-side tokens)
    pub sub: String,
    pub nbf: i64,
    pub exp: i64,
    pub video: VideoGrant,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

/// Mints access tokens for relay sessions and room administration
#[derive(Clone)]
pub struct AccessTokenIssuer {
    api_key: String,
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    ttl: Duration,
}

impl std::fmt::Debug for AccessTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenIssuer")
            .field("api_key", &self.api_key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl AccessTokenIssuer {
    /// Create an issuer from the platform API key pair
    pub fn new(api_key: impl Into<String>, api_secret: &str, ttl_secs: u64) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(Error::Credential("API key and secret must be set".to_string()));
        }

        Ok(Self {
            api_key,
            encoding_key: Arc::new(EncodingKey::from_secret(api_secret.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(api_secret.as_bytes())),
            ttl: Duration::seconds(i64::from(u32::try_from(ttl_secs).unwrap_or(u32::MAX)).max(1)),
        })
    }

    /// Token for a relay joining `room`: join, publish and subscribe, no data channel
    pub fn relay_token(&self, room: &RoomId, identity: &ParticipantIdentity) -> Result<String> {
        let grant = VideoGrant {
            room: Some(room.as_str().to_string()),
            room_join: true,
            can_publish: true,
            can_subscribe: true,
            can_publish_data: false,
            ..Default::default()
        };
        self.sign(identity.as_str(), grant, ParticipantRole::Relay.to_metadata())
    }

    /// Server-side token for room administration calls
    pub fn admin_token(&self, room: Option<&RoomId>) -> Result<String> {
        let grant = VideoGrant {
            room: room.map(|r| r.as_str().to_string()),
            room_admin: true,
            room_list: true,
            ..Default::default()
        };
        self.sign("", grant, String::new())
    }

    /// Verify a token minted with the same secret and return its claims
    pub fn verify(&self, token: &str) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        validation.leeway = 10;
        validation.set_issuer(&[&self.api_key]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss"]);

        decode::<AccessClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Credential(format!("Token verification failed: {e}")))
    }

    fn sign(&self, identity: &str, video: VideoGrant, metadata: String) -> Result<String> {
        let now = Utc::now();
        let claims = AccessClaims {
            iss: self.api_key.clone(),
            sub: identity.to_string(),
            nbf: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            video,
            metadata,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Credential(format!("Failed to sign token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> AccessTokenIssuer {
        AccessTokenIssuer::new("APIkey", "a-reasonably-long-test-secret", 600)
            .expect("issuer should build")
    }

    #[test]
    fn test_relay_token_grants() {
        let issuer = issuer();
        let token = issuer
            .relay_token(&RoomId::from("stage"), &ParticipantIdentity::from("relay-alice"))
            .expect("token should sign");

        let claims = issuer.verify(&token).expect("token should verify");
        assert_eq!(claims.iss, "APIkey");
        assert_eq!(claims.sub, "relay-alice");
        assert_eq!(claims.video.room.as_deref(), Some("stage"));
        assert!(claims.video.room_join);
        assert!(claims.video.can_publish);
        assert!(claims.video.can_subscribe);
        assert!(!claims.video.can_publish_data);
        assert!(!claims.video.room_admin);
        assert_eq!(ParticipantRole::from_metadata(&claims.metadata), Some(ParticipantRole::Relay));
        assert_eq!(claims.exp - claims.nbf, 600);
    }

    #[test]
    fn test_admin_token_grants() {
        let issuer = issuer();
        let token = issuer.admin_token(Some(&RoomId::from("stage"))).expect("token should sign");

        let claims = issuer.verify(&token).expect("token should verify");
        assert!(claims.video.room_admin);
        assert!(!claims.video.room_join);
        assert!(claims.sub.is_empty());
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let token = issuer().admin_token(None).expect("token should sign");
        let other = AccessTokenIssuer::new("APIkey", "a-different-test-secret", 600)
            .expect("issuer should build");
        assert!(matches!(other.verify(&token), Err(Error::Credential(_))));
    }

    #[test]
    fn test_missing_secret_rejected() {
        assert!(AccessTokenIssuer::new("APIkey", "", 600).is_err());
        assert!(AccessTokenIssuer::new("", "secret", 600).is_err());
    }
}
