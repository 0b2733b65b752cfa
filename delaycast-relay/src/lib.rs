//! Delaycast relay
//!
//! Per-participant delayed republishing for real-time media rooms. For every
//! participant that needs a delay, a synthetic participant joins the room,
//! subscribes to the source's media and republishes it after a configurable
//! delay, while the other participants are steered from the raw source to the
//! delayed copy.
//!
//! ## Architecture
//!
//! - **`RelayRegistry`**: Control surface; at most one relay per (room, participant)
//! - **`DelayRelay`**: One synthetic participant, its session and published output
//! - **`FrameDelayPipeline`**: Delay-and-forward for one source track
//! - **`SubscriptionController`**: Redirects viewers between source and relay
//! - **`IdleKeepAlive`**: Filler frames while the source has no flowing media
//!
//! ## Features
//!
//! - Generation-tagged scheduling: stale frames are dropped, never reordered
//! - Lazy relay track publish with the shape fixed at first emission
//! - Best-effort subscription steering with late-joiner admission
//! - Sticky per-kind failure handling
//! - HS256 access tokens and an HTTP room-service client
//!
//! ## Usage
//!
//! ```rust,ignore
//! use delaycast_relay::{AccessTokenIssuer, RelayConfig, RelayContext, RelayRegistry, RoomServiceClient};
//!
//! let config = Arc::new(RelayConfig::default());
//! let issuer = Arc::new(AccessTokenIssuer::new(api_key, &api_secret, config.credential_ttl_secs)?);
//! let control = Arc::new(RoomServiceClient::new(url, issuer.clone(), config.identity.clone(), timeout)?);
//!
//! let registry = RelayRegistry::new(RelayContext { config, issuer, connector, control });
//! registry.set_delay("stage".into(), "alice".into(), 500, false).await?;
//! ```

mod config;
mod credentials;
mod error;
mod idle;
mod media;
mod pipeline;
mod platform;
mod registry;
mod relay;
mod room_service;
mod subscription;
mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod test_helpers;


pub use config::RelayConfig;
pub use credentials::{AccessClaims, AccessTokenIssuer, VideoGrant};
pub use error::{Error, Result};
pub use media::{AudioFrame, AudioShape, MediaFrame, MediaKind, PixelFormat, TrackShape, VideoFrame, VideoShape};
pub use platform::{
    LocalTrack, ParticipantInfo, RelaySession, RoomControl, SessionConnector, SessionEvent, SessionHandle, TrackInfo,
};
pub use registry::{RelayRegistry, SetDelayOutcome};
pub use relay::{CaptureFailures, DelayRelay, RelayContext, RelaySnapshot};
pub use room_service::RoomServiceClient;
pub use subscription::SubscriptionController;
pub use types::{IdentityScheme, ParticipantIdentity, ParticipantRole, RoomId, TrackId};
