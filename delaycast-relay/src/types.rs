//! Identifiers and participant classification shared across the relay

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Name of a room on the media platform
    RoomId
);

string_id!(
    /// Identity of a participant inside a room
    ParticipantIdentity
);

string_id!(
    /// Platform-issued handle for one published track instance
    TrackId
);

/// Role of a participant, carried as a tag in participant metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// A human-operated participant; may be relayed and is part of every audience
    Source,
    /// A synthetic participant republishing delayed media
    Relay,
    /// Infrastructure (recording, egress, bots)
    Service,
    /// Administrative observers
    Admin,
}

impl ParticipantRole {
    /// Participants that receive media like any other viewer
    #[must_use]
    pub const fn is_real(&self) -> bool {
        matches!(self, Self::Source)
    }

    /// Extract the role tag from a participant's metadata JSON (`{"role":"relay"}`)
    #[must_use]
    pub fn from_metadata(metadata: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct Tagged {
            role: Option<ParticipantRole>,
        }

        if metadata.trim().is_empty() {
            return None;
        }
        serde_json::from_str::<Tagged>(metadata).ok()?.role
    }

    /// Metadata JSON announcing this role
    #[must_use]
    pub fn to_metadata(&self) -> String {
        serde_json::json!({ "role": self }).to_string()
    }
}

/// Identity naming convention for synthetic and infrastructure participants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityScheme {
    /// Prefix prepended to a source identity to form its relay identity
    pub relay_prefix: String,
    /// Identity prefixes of infrastructure participants
    pub service_prefixes: Vec<String>,
    /// Identity prefixes of administrative participants
    pub admin_prefixes: Vec<String>,
}

impl Default for IdentityScheme {
    fn default() -> Self {
        Self {
            relay_prefix: "relay-".to_string(),
            service_prefixes: vec!["egress-".to_string(), "service-".to_string()],
            admin_prefixes: vec!["admin-".to_string()],
        }
    }
}

impl IdentityScheme {
    /// Relay identity for a source; deterministic so it always maps back
    #[must_use]
    pub fn relay_identity(&self, source: &ParticipantIdentity) -> ParticipantIdentity {
        ParticipantIdentity::new(format!("{}{}", self.relay_prefix, source))
    }

    /// Source identity a relay identity was derived from
    #[must_use]
    pub fn source_of(&self, relay: &ParticipantIdentity) -> Option<ParticipantIdentity> {
        relay
            .as_str()
            .strip_prefix(&self.relay_prefix)
            .filter(|rest| !rest.is_empty())
            .map(ParticipantIdentity::from)
    }

    /// Classify a participant. An explicit metadata tag wins over the prefix convention.
    #[must_use]
    pub fn classify(&self, identity: &ParticipantIdentity, metadata: &str) -> ParticipantRole {
        if let Some(role) = ParticipantRole::from_metadata(metadata) {
            return role;
        }

        let id = identity.as_str();
        if !self.relay_prefix.is_empty() && id.starts_with(&self.relay_prefix) {
            ParticipantRole::Relay
        } else if self.service_prefixes.iter().any(|p| id.starts_with(p.as_str())) {
            ParticipantRole::Service
        } else if self.admin_prefixes.iter().any(|p| id.starts_with(p.as_str())) {
            ParticipantRole::Admin
        } else {
            ParticipantRole::Source
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_identity_round_trip() {
        let scheme = IdentityScheme::default();
        let source = ParticipantIdentity::from("alice");

        let relay = scheme.relay_identity(&source);
        assert_eq!(relay.as_str(), "relay-alice");
        assert_eq!(scheme.source_of(&relay), Some(source));
        assert_eq!(scheme.source_of(&ParticipantIdentity::from("bob")), None);
        assert_eq!(scheme.source_of(&ParticipantIdentity::from("relay-")), None);
    }

    #[test]
    fn test_classify_by_prefix() {
        let scheme = IdentityScheme::default();

        assert_eq!(scheme.classify(&"relay-alice".into(), ""), ParticipantRole::Relay);
        assert_eq!(scheme.classify(&"egress-42".into(), ""), ParticipantRole::Service);
        assert_eq!(scheme.classify(&"admin-ops".into(), ""), ParticipantRole::Admin);
        assert_eq!(scheme.classify(&"alice".into(), ""), ParticipantRole::Source);
    }

    #[test]
    fn test_metadata_tag_wins() {
        let scheme = IdentityScheme::default();

        // A recorder that joined with a plain identity but a service tag
        let role = scheme.classify(&"recorder".into(), r#"{"role":"service"}"#);
        assert_eq!(role, ParticipantRole::Service);

        // Unparseable metadata falls back to the prefix convention
        let role = scheme.classify(&"relay-bob".into(), "not json");
        assert_eq!(role, ParticipantRole::Relay);
    }

    #[test]
    fn test_role_metadata_round_trip() {
        let metadata = ParticipantRole::Relay.to_metadata();
        assert_eq!(metadata, r#"{"role":"relay"}"#);
        assert_eq!(ParticipantRole::from_metadata(&metadata), Some(ParticipantRole::Relay));
        assert!(ParticipantRole::Source.is_real());
        assert!(!ParticipantRole::Admin.is_real());
    }
}
