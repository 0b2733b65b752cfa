//! Room service HTTP client
//!
//! Implements [`RoomControl`] against the platform's JSON-over-HTTP room
//! service (Twirp endpoints under `/twirp/livekit.RoomService/`). Every
//! request carries a freshly minted admin token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credentials::AccessTokenIssuer;
use crate::error::{Error, Result};
use crate::media::MediaKind;
use crate::platform::{ParticipantInfo, RoomControl, TrackInfo};
use crate::types::{IdentityScheme, ParticipantIdentity, RoomId, TrackId};

const SERVICE_PATH: &str = "twirp/livekit.RoomService";

#[derive(Debug, Serialize)]
struct ListParticipantsRequest<'a> {
    room: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ListParticipantsResponse {
    #[serde(default)]
    participants: Vec<WireParticipant>,
}

#[derive(Debug, Deserialize)]
struct WireParticipant {
    identity: String,
    #[serde(default)]
    metadata: String,
    #[serde(default)]
    tracks: Vec<WireTrack>,
}

#[derive(Debug, Deserialize)]
struct WireTrack {
    sid: String,
    /// Omitted for the zero value (audio)
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl WireTrack {
    fn into_track_info(self) -> Option<TrackInfo> {
        let kind = match self.kind.as_deref().map(str::to_ascii_uppercase).as_deref() {
            None | Some("AUDIO") => MediaKind::Audio,
            Some("VIDEO") => MediaKind::Video,
            // Data tracks carry no media
            Some(_) => return None,
        };
        Some(TrackInfo {
            sid: TrackId::from(self.sid),
            kind,
        })
    }
}

#[derive(Debug, Serialize)]
struct UpdateSubscriptionsRequest<'a> {
    room: &'a str,
    identity: &'a str,
    track_sids: Vec<&'a str>,
    subscribe: bool,
}

/// HTTP client for the platform room service
pub struct RoomServiceClient {
    base_url: String,
    issuer: Arc<AccessTokenIssuer>,
    identity: IdentityScheme,
    client: Client,
}

impl RoomServiceClient {
    /// Create a client for the service rooted at `base_url` (e.g. `https://sfu.example.com`)
    pub fn new(
        base_url: impl Into<String>,
        issuer: Arc<AccessTokenIssuer>,
        identity: IdentityScheme,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Platform(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            issuer,
            identity,
            client,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{SERVICE_PATH}/{method}", self.base_url)
    }

    fn build_headers(&self, room: &RoomId) -> Result<HeaderMap> {
        let token = self.issuer.admin_token(Some(room))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Credential(e.to_string()))?,
        );
        Ok(headers)
    }

    async fn call<B: Serialize + Sync>(&self, room: &RoomId, method: &str, body: &B) -> Result<reqwest::Response> {
        let url = self.endpoint(method);
        let response = self
            .client
            .post(&url)
            .headers(self.build_headers(room)?)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Error::Http { status, url });
        }
        Ok(response)
    }
}

#[async_trait]
impl RoomControl for RoomServiceClient {
    async fn list_participants(&self, room: &RoomId) -> Result<Vec<ParticipantInfo>> {
        let response = self
            .call(room, "ListParticipants", &ListParticipantsRequest { room: room.as_str() })
            .await?;
        let body: ListParticipantsResponse = response
            .json()
            .await
            .map_err(|e| Error::Platform(format!("Invalid ListParticipants response: {e}")))?;

        let participants = body
            .participants
            .into_iter()
            .map(|p| {
                let identity = ParticipantIdentity::from(p.identity);
                let role = self.identity.classify(&identity, &p.metadata);
                ParticipantInfo {
                    identity,
                    role,
                    tracks: p.tracks.into_iter().filter_map(WireTrack::into_track_info).collect(),
                }
            })
            .collect::<Vec<_>>();

        debug!(room = %room, count = participants.len(), "Listed participants");
        Ok(participants)
    }

    async fn update_subscriptions(
        &self,
        room: &RoomId,
        viewer: &ParticipantIdentity,
        track_ids: &[TrackId],
        subscribe: bool,
    ) -> Result<()> {
        let request = UpdateSubscriptionsRequest {
            room: room.as_str(),
            identity: viewer.as_str(),
            track_sids: track_ids.iter().map(TrackId::as_str).collect(),
            subscribe,
        };
        self.call(room, "UpdateSubscriptions", &request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParticipantRole;
    use serde_json::json;
    use wiremock::matchers::{body_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RoomServiceClient {
        let issuer = Arc::new(
            AccessTokenIssuer::new("APIkey", "room-service-test-secret", 60).expect("issuer should build"),
        );
        RoomServiceClient::new(server.uri(), issuer, IdentityScheme::default(), Duration::from_secs(5))
            .expect("client should build")
    }

    #[tokio::test]
    async fn test_list_participants_maps_roles_and_tracks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/twirp/livekit.RoomService/ListParticipants"))
            .and(header_exists("authorization"))
            .and(body_json(json!({ "room": "stage" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "participants": [
                    {
                        "identity": "alice",
                        "tracks": [
                            { "sid": "TR_audio" },
                            { "sid": "TR_video", "type": "VIDEO" },
                            { "sid": "TR_data", "type": "DATA" }
                        ]
                    },
                    { "identity": "relay-alice", "metadata": "{\"role\":\"relay\"}" },
                    { "identity": "recorder", "metadata": "{\"role\":\"service\"}" }
                ]
            })))
            .mount(&server)
            .await;

        let participants = client(&server)
            .list_participants(&RoomId::from("stage"))
            .await
            .expect("listing should succeed");

        assert_eq!(participants.len(), 3);
        assert_eq!(participants[0].role, ParticipantRole::Source);
        assert_eq!(
            participants[0].tracks,
            vec![
                TrackInfo { sid: "TR_audio".into(), kind: MediaKind::Audio },
                TrackInfo { sid: "TR_video".into(), kind: MediaKind::Video },
            ]
        );
        assert_eq!(participants[1].role, ParticipantRole::Relay);
        assert_eq!(participants[2].role, ParticipantRole::Service);
    }

    #[tokio::test]
    async fn test_update_subscriptions_request_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/twirp/livekit.RoomService/UpdateSubscriptions"))
            .and(body_json(json!({
                "room": "stage",
                "identity": "bob",
                "track_sids": ["TR_audio", "TR_video"],
                "subscribe": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .update_subscriptions(
                &RoomId::from("stage"),
                &ParticipantIdentity::from("bob"),
                &[TrackId::from("TR_audio"), TrackId::from("TR_video")],
                false,
            )
            .await
            .expect("toggle should succeed");
    }

    #[tokio::test]
    async fn test_http_error_status_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .update_subscriptions(&RoomId::from("stage"), &ParticipantIdentity::from("gone"), &[], true)
            .await
            .expect_err("404 should fail");
        assert!(matches!(err, Error::Http { status, .. } if status == reqwest::StatusCode::NOT_FOUND));
    }
}
