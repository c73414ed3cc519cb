//! External collaborator interfaces for media assets
//!
//! Asset-provider integration is out of scope; these traits are the seams
//! the rest of the system programs against. `MediaResolver` is consumed at
//! schedule create/edit time to populate item durations; `TokenIssuer` is
//! consumed by the playback controller shortly before a signed item's
//! boundary is reached.

use crate::model::AccessPolicy;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of resolving an opaque media id with the asset provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedMedia {
    /// Playable reference understood by the viewer's player
    pub playback_ref: String,
    pub access_policy: AccessPolicy,
    pub duration_secs: f64,
}

/// Short-lived tokens for a signed-access media reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackTokens {
    pub playback: String,
    pub thumbnail: Option<String>,
    pub storyboard: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Resolves an opaque media id to a playable reference and duration
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, media_id: &str) -> Result<ResolvedMedia>;
}

/// Issues short-lived playback/thumbnail/storyboard tokens
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, playback_ref: &str) -> Result<PlaybackTokens>;
}
