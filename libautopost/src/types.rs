//! Core types for Autopost
//!
//! All timestamps are Unix milliseconds (UTC).

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed length of a quota cycle
pub const CYCLE_LENGTH_MS: i64 = 30 * 24 * 3600 * 1000;

/// Current time in Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Platforms and plans
// ============================================================================

/// The five platforms a post can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    X,
    LinkedIn,
    Facebook,
    Instagram,
    TikTok,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::X,
        Platform::LinkedIn,
        Platform::Facebook,
        Platform::Instagram,
        Platform::TikTok,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::X => "x",
            Platform::LinkedIn => "linkedin",
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x" | "twitter" => Ok(Platform::X),
            "linkedin" => Ok(Platform::LinkedIn),
            "facebook" => Ok(Platform::Facebook),
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::TikTok),
            _ => Err(format!(
                "Unknown platform: '{}'. Valid options: x, linkedin, facebook, instagram, tiktok",
                s
            )),
        }
    }
}

/// Subscription plan tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Starter,
    Growth,
    Professional,
}

impl PlanTier {
    /// Posts per cycle granted by this plan
    pub fn quota(&self) -> i64 {
        match self {
            PlanTier::Starter => 30,
            PlanTier::Growth => 60,
            PlanTier::Professional => 120,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Growth => "growth",
            PlanTier::Professional => "professional",
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starter" => Ok(PlanTier::Starter),
            "growth" => Ok(PlanTier::Growth),
            "professional" => Ok(PlanTier::Professional),
            _ => Err(format!(
                "Unknown plan tier: '{}'. Valid options: starter, growth, professional",
                s
            )),
        }
    }
}

// ============================================================================
// Subscribers and quota
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub plan: PlanTier,
    /// Monotonic cycle number, starts at 1
    pub cycle_id: i64,
    pub cycle_start: i64,
}

impl Subscriber {
    pub fn cycle_end(&self) -> i64 {
        self.cycle_start + CYCLE_LENGTH_MS
    }

    /// A cycle is active from its start until its end; it never extends itself
    pub fn is_cycle_active(&self, now: i64) -> bool {
        now >= self.cycle_start && now < self.cycle_end()
    }
}

/// Snapshot of a subscriber's ledger for the current cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub subscriber_id: String,
    pub cycle_id: i64,
    pub cycle_start: i64,
    pub cycle_end: i64,
    pub allocated: i64,
    pub reserved: i64,
    pub committed: i64,
    pub released: i64,
    pub remaining: i64,
}

/// Billing event that starts a subscriber's next cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRenewed {
    pub subscriber_id: String,
    pub new_allocation: i64,
    pub new_cycle_start: i64,
}

/// Single-use handle on one unit of reserved quota
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken(pub String);

impl ReservationToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Held,
    Committed,
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Held => "held",
            ReservationState::Committed => "committed",
            ReservationState::Released => "released",
        }
    }
}

impl std::str::FromStr for ReservationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(ReservationState::Held),
            "committed" => Ok(ReservationState::Committed),
            "released" => Ok(ReservationState::Released),
            _ => Err(format!("Unknown reservation state: '{}'", s)),
        }
    }
}

// ============================================================================
// Posts
// ============================================================================

/// Lifecycle state of a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostState {
    Draft,
    Approved,
    Queued,
    Publishing,
    Published,
    Failed,
    Cancelled,
}

impl PostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostState::Draft => "draft",
            PostState::Approved => "approved",
            PostState::Queued => "queued",
            PostState::Publishing => "publishing",
            PostState::Published => "published",
            PostState::Failed => "failed",
            PostState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostState::Published | PostState::Failed | PostState::Cancelled
        )
    }

    /// Whether a reservation is held on behalf of a post in this state
    pub fn holds_reservation(&self) -> bool {
        matches!(
            self,
            PostState::Approved | PostState::Queued | PostState::Publishing
        )
    }

    /// Transition table of the post state machine
    ///
    /// `Publishing -> Queued` is the retry edge: a transient failure puts the
    /// post back in the queue with a backoff delay, as does lease recovery.
    pub fn can_transition_to(&self, next: PostState) -> bool {
        use PostState::*;
        matches!(
            (self, next),
            (Draft, Approved)
                | (Approved, Queued)
                | (Approved, Cancelled)
                | (Queued, Publishing)
                | (Queued, Cancelled)
                | (Publishing, Published)
                | (Publishing, Queued)
                | (Publishing, Failed)
        )
    }
}

impl std::fmt::Display for PostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PostState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(PostState::Draft),
            "approved" => Ok(PostState::Approved),
            "queued" => Ok(PostState::Queued),
            "publishing" => Ok(PostState::Publishing),
            "published" => Ok(PostState::Published),
            "failed" => Ok(PostState::Failed),
            "cancelled" => Ok(PostState::Cancelled),
            _ => Err(format!("Unknown post state: '{}'", s)),
        }
    }
}

/// Content produced upstream: caption text plus references to hosted media
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub text: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media_urls: Vec::new(),
        }
    }

    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media_urls.push(url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub subscriber_id: String,
    pub platform: Platform,
    pub content: Content,
    pub target_at: i64,
    pub state: PostState,
    pub platform_post_id: Option<String>,
    pub failure_class: Option<crate::error::ErrorClass>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub reservation_token: Option<ReservationToken>,
    /// Cycle the reservation was taken in
    pub cycle_id: Option<i64>,
    pub queued_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating a draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub subscriber_id: String,
    pub platform: Platform,
    pub content: Content,
    pub target_at: i64,
}

impl NewPost {
    pub fn new(
        subscriber_id: impl Into<String>,
        platform: Platform,
        content: Content,
        target_at: i64,
    ) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            platform,
            content,
            target_at,
        }
    }
}

// ============================================================================
// Platform connections
// ============================================================================

/// Identifies one subscriber's authorization on one platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub subscriber_id: String,
    pub platform: Platform,
}

impl ConnectionKey {
    pub fn new(subscriber_id: impl Into<String>, platform: Platform) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            platform,
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.subscriber_id, self.platform)
    }
}

/// Access credential with its optional refresh credential
///
/// Secrets are redacted from `Debug` output and zeroed on drop.
#[derive(Debug)]
pub struct Credential {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// `None` means the platform did not report an expiry
    pub expires_at: Option<i64>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<i64>,
    ) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            refresh_token: refresh_token.map(SecretString::from),
            expires_at,
        }
    }

    /// True when the credential expires before `now + window_ms`
    pub fn expires_within(&self, now: i64, window_ms: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + window_ms,
            None => false,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_within(now, 0)
    }

    /// Whether two credentials carry the same access token
    pub fn same_access_token(&self, other: &Credential) -> bool {
        self.access_token.expose_secret() == other.access_token.expose_secret()
    }
}

#[derive(Debug)]
pub struct PlatformConnection {
    pub key: ConnectionKey,
    pub credential: Credential,
    /// Cleared when the connection needs the user to re-authorize
    pub valid: bool,
    pub updated_at: i64,
}
