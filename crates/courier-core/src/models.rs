//! Core domain models and strongly-typed identifiers.
//!
//! Defines subscriptions, delivery records, attempt audit rows and dead
//! letter entries, together with newtype ID wrappers and the database
//! encoding for each. Subscriptions are read-only to the engine; delivery
//! records change only through guarded [`DeliveryTransition`]s.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use courier_signing::{SignatureAlgorithm, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed subscription identifier.
///
/// A subscription is one external endpoint plus its delivery policy. Every
/// piece of shared state (circuit, tokens, batch buffer) is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Creates a new random subscription ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for SubscriptionId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SubscriptionId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for SubscriptionId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery identifier.
///
/// Sent to subscribers as `X-Event-Id`, so it stays stable across every
/// attempt of the same delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed dead letter entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadLetterId(pub Uuid);

impl DeadLetterId {
    /// Creates a new random dead letter ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeadLetterId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeadLetterId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeadLetterId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeadLetterId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Signing algorithm and secret material for a subscription.
///
/// The secret is an HMAC secret string, a base64 Ed25519 seed or an RSA
/// PKCS#8 PEM depending on `algorithm`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Algorithm used to sign outbound payloads.
    pub algorithm: SignatureAlgorithm,
    /// Private or shared key material.
    pub secret: String,
}

impl SigningConfig {
    /// HMAC-SHA256 with the given shared secret.
    pub fn hmac_sha256(secret: impl Into<String>) -> Self {
        Self { algorithm: SignatureAlgorithm::HmacSha256, secret: secret.into() }
    }

    /// Decodes the secret into a signing key.
    ///
    /// # Errors
    ///
    /// Returns a signing error if the material is invalid for the algorithm.
    pub fn signing_key(&self) -> courier_signing::Result<SigningKey> {
        SigningKey::from_secret(self.algorithm, &self.secret)
    }
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("algorithm", &self.algorithm)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Payload filter attached to a subscription.
///
/// Flat maps are dot-path → expected value. A list of maps must all match.
/// String expressions are accepted for compatibility but not evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterSpec {
    /// Every map in the list must match.
    All(Vec<Map<String, Value>>),
    /// Single dot-path → value map.
    Single(Map<String, Value>),
    /// Advanced expression syntax.
    Expression(String),
}

/// Token bucket parameters for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub rate_per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
}

/// Batching parameters for low-priority events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Number of queued events that triggers a flush.
    pub size: usize,
    /// Oldest-item age after which the sweeper forces a flush.
    pub max_wait_ms: u64,
}

impl BatchConfig {
    /// Oldest-item age after which the sweeper forces a flush.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// External endpoint plus its delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,

    /// Target URL receiving POST requests.
    pub url: String,

    /// Signing algorithm and secret.
    pub signing: SigningConfig,

    /// Inactive subscriptions never receive deliveries.
    pub is_active: bool,

    /// Event type patterns: exact names, `prefix.*` globs or `*`.
    pub event_patterns: Vec<String>,

    /// Optional payload predicate.
    pub filter: Option<FilterSpec>,

    /// Optional Handlebars template reshaping the payload.
    pub template: Option<String>,

    /// Dot-paths removed from the payload before templating.
    pub excluded_fields: Vec<String>,

    /// Optional token bucket limits.
    pub rate_limit: Option<RateLimitConfig>,

    /// Total attempts allowed before a delivery is dead-lettered.
    pub max_retries: u32,

    /// Optional batching policy.
    pub batch: Option<BatchConfig>,

    /// When created.
    pub created_at: DateTime<Utc>,

    /// When last edited.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Attempt budget for new subscriptions.
    pub const DEFAULT_MAX_RETRIES: u32 = 5;

    /// Active subscription to every event type with default policy.
    pub fn new(url: impl Into<String>, signing: SigningConfig) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::new(),
            url: url.into(),
            signing,
            is_active: true,
            event_patterns: vec!["*".to_string()],
            filter: None,
            template: None,
            excluded_fields: Vec::new(),
            rate_limit: None,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            batch: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Subscription {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::{types::Json, Row};

        let signing: Json<SigningConfig> = row.try_get("signing")?;
        let event_patterns: Json<Vec<String>> = row.try_get("event_patterns")?;
        let filter: Option<Json<FilterSpec>> = row.try_get("filter")?;
        let excluded_fields: Json<Vec<String>> = row.try_get("excluded_fields")?;
        let rate_limit: Option<Json<RateLimitConfig>> = row.try_get("rate_limit")?;
        let batch: Option<Json<BatchConfig>> = row.try_get("batch")?;

        Ok(Self {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            signing: signing.0,
            is_active: row.try_get("is_active")?,
            event_patterns: event_patterns.0,
            filter: filter.map(|f| f.0),
            template: row.try_get("template")?,
            excluded_fields: excluded_fields.0,
            rate_limit: rate_limit.map(|r| r.0),
            max_retries: decode_u32(row, "max_retries")?,
            batch: batch.map(|b| b.0),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Delivery lifecycle status.
///
/// ```text
/// Pending -> Success
///         -> Failed (dead-lettered)
/// ```
///
/// Each record takes exactly one terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for its next attempt; `next_retry_at` is set.
    Pending,
    /// Delivered with a 2xx response.
    Success,
    /// Exhausted or permanently rejected.
    Failed,
}

impl DeliveryStatus {
    /// Database and wire representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Whether no further attempts will be made.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid delivery status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Versioned snapshot of the transformed payload a delivery sends.
///
/// Serialized as `{"schema":"v1","data":...}` so older rows stay readable
/// when the snapshot layout changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum PayloadSnapshot {
    /// Plain JSON document.
    V1 {
        /// Payload body as sent.
        data: Value,
    },
}

impl PayloadSnapshot {
    /// Wraps a payload in the current schema version.
    pub fn new(data: Value) -> Self {
        Self::V1 { data }
    }

    /// Payload body.
    pub fn data(&self) -> &Value {
        match self {
            Self::V1 { data } => data,
        }
    }

    /// Consumes the snapshot, returning the payload body.
    pub fn into_data(self) -> Value {
        match self {
            Self::V1 { data } => data,
        }
    }

    /// Request body bytes.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    pub fn to_body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self.data())
    }
}

impl sqlx::Type<PgDb> for PayloadSnapshot {
    fn type_info() -> PgTypeInfo {
        <sqlx::types::Json<Value> as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for PayloadSnapshot {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let json = <sqlx::types::Json<Self> as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(json.0)
    }
}

impl sqlx::Encode<'_, PgDb> for PayloadSnapshot {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <sqlx::types::Json<&Self> as sqlx::Encode<PgDb>>::encode_by_ref(
            &sqlx::types::Json(self),
            buf,
        )
    }
}

/// Durable state of one event being delivered to one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Unique identifier, also sent as `X-Event-Id`.
    pub id: DeliveryId,

    /// Target subscription.
    pub subscription_id: SubscriptionId,

    /// Event type, sent as `X-Event-Type`.
    pub event_type: String,

    /// Transformed payload.
    pub payload: PayloadSnapshot,

    /// Lifecycle status.
    pub status: DeliveryStatus,

    /// Attempts made so far. Never decreases.
    pub attempt_count: u32,

    /// When the next attempt is due. Set iff pending.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Caller-supplied key, forwarded as `Idempotency-Key`.
    pub idempotency_key: Option<String>,

    /// Most recent failure description.
    pub last_error: Option<String>,

    /// When created.
    pub created_at: DateTime<Utc>,

    /// When last transitioned.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Creates a pending record due immediately.
    pub fn pending(
        subscription_id: SubscriptionId,
        event_type: impl Into<String>,
        payload: PayloadSnapshot,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscription_id,
            event_type: event_type.into(),
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            next_retry_at: Some(now),
            idempotency_key,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number the next attempt will carry.
    pub fn next_attempt_number(&self) -> u32 {
        self.attempt_count.saturating_add(1)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            id: row.try_get("id")?,
            subscription_id: row.try_get("subscription_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempt_count: decode_u32(row, "attempt_count")?,
            next_retry_at: row.try_get("next_retry_at")?,
            idempotency_key: row.try_get("idempotency_key")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Status change applied to a delivery after an attempt.
///
/// Applied only if the record is still pending with the attempt count the
/// caller observed, which rejects double processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTransition {
    /// Attempt succeeded; terminal.
    Succeeded,
    /// Attempt failed; try again at `next_retry_at`.
    Retry {
        /// When the next attempt becomes due.
        next_retry_at: DateTime<Utc>,
        /// Failure description.
        error: String,
    },
    /// Attempt failed permanently or retries are exhausted; terminal.
    Failed {
        /// Failure description.
        error: String,
    },
}

impl DeliveryTransition {
    /// Status the record ends up in.
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Self::Succeeded => DeliveryStatus::Success,
            Self::Retry { .. } => DeliveryStatus::Pending,
            Self::Failed { .. } => DeliveryStatus::Failed,
        }
    }

    /// `next_retry_at` after the transition; `None` for terminal states.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Retry { next_retry_at, .. } => Some(*next_retry_at),
            Self::Succeeded | Self::Failed { .. } => None,
        }
    }

    /// Error recorded on the delivery, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Retry { error, .. } | Self::Failed { error } => Some(error),
        }
    }
}

/// Outcome of a single HTTP attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// 2xx response.
    Success,
    /// Non-2xx response.
    HttpError,
    /// No response within the timeout tier.
    Timeout,
    /// DNS, TCP or TLS failure.
    ConnectionError,
}

impl AttemptOutcome {
    /// Database representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HttpError => "http_error",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
        }
    }

    /// Whether the attempt delivered the payload.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for AttemptOutcome {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptOutcome {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "success" => Ok(Self::Success),
            "http_error" => Ok(Self::HttpError),
            "timeout" => Ok(Self::Timeout),
            "connection_error" => Ok(Self::ConnectionError),
            _ => Err(format!("invalid attempt outcome: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for AttemptOutcome {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Audit row for one network call. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttemptRecord {
    /// Unique identifier.
    pub id: Uuid,

    /// Delivery this attempt belongs to.
    pub delivery_id: DeliveryId,

    /// 1-based attempt number, equal to the `X-Attempt-Number` sent.
    pub attempt_number: u32,

    /// Classified outcome.
    pub outcome: AttemptOutcome,

    /// HTTP status, if a response arrived.
    pub http_status: Option<u16>,

    /// Wall time spent on the request.
    pub duration_ms: u64,

    /// Failure description.
    pub error: Option<String>,

    /// When the attempt started.
    pub attempted_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryAttemptRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let http_status: Option<i32> = row.try_get("http_status")?;
        let duration_ms: i64 = row.try_get("duration_ms")?;

        Ok(Self {
            id: row.try_get("id")?,
            delivery_id: row.try_get("delivery_id")?,
            attempt_number: decode_u32(row, "attempt_number")?,
            outcome: row.try_get("outcome")?,
            http_status: http_status.and_then(|s| u16::try_from(s).ok()),
            duration_ms: u64::try_from(duration_ms).unwrap_or(0),
            error: row.try_get("error")?,
            attempted_at: row.try_get("attempted_at")?,
        })
    }
}

/// Quarantined delivery that exhausted its retries.
///
/// Exactly one entry exists per failed delivery. Only replay and discard
/// mutate it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique identifier.
    pub id: DeadLetterId,

    /// Failed delivery. Unique.
    pub delivery_id: DeliveryId,

    /// Target subscription.
    pub subscription_id: SubscriptionId,

    /// Event type of the failed delivery.
    pub event_type: String,

    /// Payload exactly as it was sent.
    pub payload: PayloadSnapshot,

    /// Final failure description.
    pub error: String,

    /// Attempts made before giving up.
    pub retry_count: u32,

    /// When quarantined.
    pub stored_at: DateTime<Utc>,

    /// When last replayed.
    pub replayed_at: Option<DateTime<Utc>>,

    /// Soft-deleted by an operator.
    pub archived: bool,
}

impl DeadLetterEntry {
    /// Builds the entry for a terminally failed delivery.
    pub fn from_delivery(record: &DeliveryRecord, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: DeadLetterId::new(),
            delivery_id: record.id,
            subscription_id: record.subscription_id,
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
            error: error.into(),
            retry_count: record.attempt_count,
            stored_at: now,
            replayed_at: None,
            archived: false,
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeadLetterEntry {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            id: row.try_get("id")?,
            delivery_id: row.try_get("delivery_id")?,
            subscription_id: row.try_get("subscription_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            retry_count: decode_u32(row, "retry_count")?,
            stored_at: row.try_get("stored_at")?,
            replayed_at: row.try_get("replayed_at")?,
            archived: row.try_get("archived")?,
        })
    }
}

/// Paging and filtering for dead letter listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterQuery {
    /// Restrict to one subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Include discarded entries.
    pub include_archived: bool,
    /// Maximum entries returned.
    pub limit: u32,
    /// Entries skipped.
    pub offset: u32,
}

impl Default for DeadLetterQuery {
    fn default() -> Self {
        Self { subscription_id: None, include_archived: false, limit: 50, offset: 0 }
    }
}

impl DeadLetterQuery {
    /// Entries for one subscription.
    pub fn for_subscription(subscription_id: SubscriptionId) -> Self {
        Self { subscription_id: Some(subscription_id), ..Self::default() }
    }
}

/// Delivery health of a subscription over a recent window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    /// Subscription measured.
    pub subscription_id: SubscriptionId,
    /// Attempts in the window.
    pub total_attempts: u64,
    /// Successful attempts in the window.
    pub successful_attempts: u64,
    /// `successful / total`, 0.0 when there were no attempts.
    pub success_rate: f64,
    /// Mean attempt duration.
    pub average_latency_ms: f64,
    /// Window length in seconds.
    pub window_secs: u64,
}

fn decode_u32(row: &PgRow, column: &str) -> Result<u32, sqlx::Error> {
    use sqlx::Row;

    let value: i32 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|_| sqlx::Error::Decode(format!("{column} cannot be negative").into()))
}
