//! Redis-backed [`TimerStore`].
//!
//! ```text
//! <prefix>:timer:{<p>}:index        ZSET  member = entry id, score = release time (epoch seconds)
//! <prefix>:timer:{<p>}:value:<id>   HASH  payload (JSON), release_time (RFC 3339), kind
//! <prefix>:timer:{<p>}:lease        STRING holder id, PX = lease ttl
//! ```
//!
//! Unpartitioned keys drop the `{<p>}` segment (`<prefix>:timer:index`, ...). The braces
//! are a Redis Cluster hash tag, so a partition's index, values and lease share a slot.
//!
//! Value hashes expire at `release_time + value_ttl_grace`, bounding storage even when a
//! removal is missed. Scores carry millisecond precision (fractional seconds); the exact
//! release time in the hash decides whether an entry is due.

use super::TimerStore;
use crate::entry::{EntryId, Partition, Payload, TimerEntry};
use crate::error::StoreError;

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, ErrorKind, RedisError, RedisResult, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

const FIELD_PAYLOAD: &str = "payload";
const FIELD_RELEASE_TIME: &str = "release_time";
const FIELD_KIND: &str = "kind";

const DEFAULT_KEY_PREFIX: &str = "delaykeeper";
const DEFAULT_VALUE_TTL_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

// Take the lease if free, refresh it if we already hold it.
const ACQUIRE_LEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
elseif current == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Configuration for [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RedisStoreConfig {
  /// Leading key segment shared by every key this store writes.
  pub key_prefix: String,
  /// How long a value entry outlives its release time before Redis evicts it.
  pub value_ttl_grace: Duration,
}

impl Default for RedisStoreConfig {
  fn default() -> Self {
    Self {
      key_prefix: DEFAULT_KEY_PREFIX.to_string(),
      value_ttl_grace: DEFAULT_VALUE_TTL_GRACE,
    }
  }
}

impl RedisStoreConfig {
  pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.key_prefix = prefix.into();
    self
  }

  pub fn with_value_ttl_grace(mut self, grace: Duration) -> Self {
    self.value_ttl_grace = grace;
    self
  }

  fn base(&self, partition: Option<Partition>) -> String {
    match partition {
      Some(p) => format!("{}:timer:{{{}}}", self.key_prefix, p),
      None => format!("{}:timer", self.key_prefix),
    }
  }

  /// Sorted-set key indexing a partition's entries by release time.
  pub fn index_key(&self, partition: Option<Partition>) -> String {
    format!("{}:index", self.base(partition))
  }

  /// Hash key holding one entry's record.
  pub fn value_key(&self, partition: Option<Partition>, id: EntryId) -> String {
    format!("{}:value:{}", self.base(partition), id)
  }

  /// String key holding a partition's scan lease.
  pub fn lease_key(&self, partition: Option<Partition>) -> String {
    format!("{}:lease", self.base(partition))
  }
}

/// Index score for a release time: epoch seconds with millisecond fraction.
fn score(time: DateTime<Utc>) -> f64 {
  time.timestamp_millis() as f64 / 1000.0
}

/// Why a persisted record could not be turned back into an entry.
#[derive(Debug)]
enum DecodeError {
  MissingField(&'static str),
  KindMismatch { stored: String, expected: &'static str },
  ReleaseTime(String),
  Payload(serde_json::Error),
  Unreadable(String),
}

impl fmt::Display for DecodeError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DecodeError::MissingField(field) => write!(f, "missing field `{}`", field),
      DecodeError::KindMismatch { stored, expected } => {
        write!(f, "stored kind {:?} does not match expected {:?}", stored, expected)
      }
      DecodeError::ReleaseTime(raw) => write!(f, "unparseable release time {:?}", raw),
      DecodeError::Payload(err) => write!(f, "payload does not deserialize: {}", err),
      DecodeError::Unreadable(reason) => write!(f, "value key is not a record: {}", reason),
    }
  }
}

/// What `find_due` does with one indexed id.
enum RecordAction<P> {
  Deliver(TimerEntry<P>),
  /// Indexed at the cutoff's score but the exact release time is later.
  Wait,
  /// The value hash is gone (expired or raced with a remove).
  DropDangling,
  Purge(DecodeError),
}

/// Errors meaning the value key holds something that is not a record.
/// Anything else (I/O, connection, server state) is a backend failure.
fn is_unreadable_record(err: &RedisError) -> bool {
  err.kind() == ErrorKind::TypeError || err.code() == Some("WRONGTYPE")
}

fn classify_record<P: Payload + DeserializeOwned>(
  id: EntryId,
  fetched: RedisResult<HashMap<String, Vec<u8>>>,
  cutoff: DateTime<Utc>,
) -> Result<RecordAction<P>, RedisError> {
  let fields = match fetched {
    Ok(fields) => fields,
    Err(err) if is_unreadable_record(&err) => {
      return Ok(RecordAction::Purge(DecodeError::Unreadable(err.to_string())))
    }
    Err(err) => return Err(err),
  };
  if fields.is_empty() {
    return Ok(RecordAction::DropDangling);
  }
  Ok(match decode_record::<P>(id, &fields) {
    Ok(entry) if entry.is_due(cutoff) => RecordAction::Deliver(entry),
    Ok(_) => RecordAction::Wait,
    Err(err) => RecordAction::Purge(err),
  })
}

fn decode_record<P: Payload + DeserializeOwned>(
  id: EntryId,
  fields: &HashMap<String, Vec<u8>>,
) -> Result<TimerEntry<P>, DecodeError> {
  let field = |name: &'static str| fields.get(name).ok_or(DecodeError::MissingField(name));

  let kind = String::from_utf8_lossy(field(FIELD_KIND)?);
  if kind != P::KIND {
    return Err(DecodeError::KindMismatch {
      stored: kind.into_owned(),
      expected: P::KIND,
    });
  }

  let raw_time = String::from_utf8_lossy(field(FIELD_RELEASE_TIME)?);
  let release_time = DateTime::parse_from_rfc3339(&raw_time)
    .map_err(|_| DecodeError::ReleaseTime(raw_time.to_string()))?
    .with_timezone(&Utc);

  let payload = serde_json::from_slice::<P>(field(FIELD_PAYLOAD)?).map_err(DecodeError::Payload)?;
  Ok(TimerEntry::with_id(id, payload, release_time))
}

/// [`TimerStore`] over a Redis sorted-set index and per-entry value hashes.
///
/// Cloning is cheap; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore<P> {
  connection: ConnectionManager,
  config: RedisStoreConfig,
  acquire_lease: Script,
  release_lease: Script,
  _payload: PhantomData<fn() -> P>,
}

impl<P> fmt::Debug for RedisStore<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RedisStore")
      .field("config", &self.config)
      .field("connection", &format_args!("<ConnectionManager>"))
      .finish()
  }
}

impl<P> RedisStore<P> {
  /// Wraps an existing connection manager.
  pub fn new(connection: ConnectionManager, config: RedisStoreConfig) -> Self {
    Self {
      connection,
      config,
      acquire_lease: Script::new(ACQUIRE_LEASE_SCRIPT),
      release_lease: Script::new(RELEASE_LEASE_SCRIPT),
      _payload: PhantomData,
    }
  }

  /// Opens a reconnecting connection to `url` (e.g. `redis://127.0.0.1:6379`).
  ///
  /// # Errors
  ///
  /// [`StoreError::Backend`] if the URL is invalid or the first connection fails.
  pub async fn connect(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
    let client = Client::open(url)?;
    let connection = ConnectionManager::new(client).await?;
    info!(prefix = %config.key_prefix, "Connected Redis timer store.");
    Ok(Self::new(connection, config))
  }

  pub fn config(&self) -> &RedisStoreConfig {
    &self.config
  }

  /// Drops a dangling or corrupt record: index member first, then the value hash.
  async fn purge(&self, id: EntryId, partition: Option<Partition>) -> Result<(), StoreError> {
    let mut con = self.connection.clone();
    let _: () = ::redis::pipe()
      .cmd("ZREM")
      .arg(self.config.index_key(partition))
      .arg(id.to_string())
      .ignore()
      .cmd("DEL")
      .arg(self.config.value_key(partition, id))
      .ignore()
      .query_async(&mut con)
      .await?;
    Ok(())
  }
}

#[async_trait]
impl<P> TimerStore<P> for RedisStore<P>
where
  P: Payload + Serialize + DeserializeOwned,
{
  async fn save(&self, entry: &TimerEntry<P>, partition: Option<Partition>) -> Result<(), StoreError> {
    let payload = serde_json::to_vec(entry.payload()).map_err(|err| StoreError::Serialization {
      entry_id: entry.id(),
      reason: err.to_string(),
    })?;
    let value_key = self.config.value_key(partition, entry.id());
    let expire_at = entry
      .release_time()
      .timestamp()
      .saturating_add(self.config.value_ttl_grace.as_secs() as i64);

    let mut con = self.connection.clone();
    let _: () = ::redis::pipe()
      .atomic()
      .cmd("DEL")
      .arg(&value_key)
      .ignore()
      .cmd("HSET")
      .arg(&value_key)
      .arg(FIELD_PAYLOAD)
      .arg(payload)
      .arg(FIELD_RELEASE_TIME)
      .arg(entry.release_time().to_rfc3339())
      .arg(FIELD_KIND)
      .arg(P::KIND)
      .ignore()
      .cmd("EXPIREAT")
      .arg(&value_key)
      .arg(expire_at)
      .ignore()
      .cmd("ZADD")
      .arg(self.config.index_key(partition))
      .arg(score(entry.release_time()))
      .arg(entry.id().to_string())
      .ignore()
      .query_async(&mut con)
      .await?;
    debug!(entry_id = %entry.id(), ?partition, release_time = %entry.release_time(), "Saved entry to Redis.");
    Ok(())
  }

  async fn remove(&self, id: EntryId, partition: Option<Partition>) -> Result<(), StoreError> {
    let mut con = self.connection.clone();
    let _: () = ::redis::cmd("ZREM")
      .arg(self.config.index_key(partition))
      .arg(id.to_string())
      .query_async(&mut con)
      .await?;

    // The index is the record of truth; an orphaned value expires on its own.
    let deleted: Result<(), _> = ::redis::cmd("DEL")
      .arg(self.config.value_key(partition, id))
      .query_async(&mut con)
      .await;
    if let Err(err) = deleted {
      warn!(entry_id = %id, ?partition, error = %err, "Failed to delete value entry; it will expire via TTL.");
    }
    Ok(())
  }

  async fn count(&self, cutoff: DateTime<Utc>, partition: Option<Partition>) -> Result<u64, StoreError> {
    let mut con = self.connection.clone();
    let count: u64 = ::redis::cmd("ZCOUNT")
      .arg(self.config.index_key(partition))
      .arg("-inf")
      .arg(score(cutoff))
      .query_async(&mut con)
      .await?;
    Ok(count)
  }

  async fn find_due(
    &self,
    cutoff: DateTime<Utc>,
    limit: usize,
    partition: Option<Partition>,
  ) -> Result<Vec<TimerEntry<P>>, StoreError> {
    if limit == 0 {
      return Ok(Vec::new());
    }
    let mut con = self.connection.clone();
    let ids: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
      .arg(self.config.index_key(partition))
      .arg("-inf")
      .arg(score(cutoff))
      .arg("LIMIT")
      .arg(0)
      .arg(limit)
      .query_async(&mut con)
      .await?;

    let mut due = Vec::with_capacity(ids.len());
    for raw_id in ids {
      let Ok(id) = Uuid::parse_str(&raw_id) else {
        warn!(member = %raw_id, ?partition, "Index member is not an entry id; removing it.");
        let _: () = ::redis::cmd("ZREM")
          .arg(self.config.index_key(partition))
          .arg(&raw_id)
          .query_async(&mut con)
          .await?;
        continue;
      };

      let fetched: RedisResult<HashMap<String, Vec<u8>>> = ::redis::cmd("HGETALL")
        .arg(self.config.value_key(partition, id))
        .query_async(&mut con)
        .await;

      match classify_record::<P>(id, fetched, cutoff)? {
        RecordAction::Deliver(entry) => due.push(entry),
        RecordAction::Wait => {}
        RecordAction::DropDangling => {
          debug!(entry_id = %id, ?partition, "Value entry missing (expired or raced); dropping index entry.");
          self.purge(id, partition).await?;
        }
        RecordAction::Purge(err) => {
          warn!(entry_id = %id, ?partition, error = %err, "Purging undecodable timer entry.");
          self.purge(id, partition).await?;
        }
      }
    }
    crate::entry::sort_by_release_time(&mut due);
    Ok(due)
  }

  async fn try_lease(&self, partition: Option<Partition>, holder: Uuid, ttl: Duration) -> Result<bool, StoreError> {
    let mut con = self.connection.clone();
    let acquired: i64 = self
      .acquire_lease
      .key(self.config.lease_key(partition))
      .arg(holder.to_string())
      .arg(ttl.as_millis().max(1) as u64)
      .invoke_async(&mut con)
      .await?;
    Ok(acquired == 1)
  }

  async fn release_lease(&self, partition: Option<Partition>, holder: Uuid) -> Result<(), StoreError> {
    let mut con = self.connection.clone();
    let _: i64 = self
      .release_lease
      .key(self.config.lease_key(partition))
      .arg(holder.to_string())
      .invoke_async(&mut con)
      .await?;
    Ok(())
  }
}
