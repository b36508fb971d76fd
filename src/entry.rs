use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

// --- Public Type Aliases ---

/// Unique identifier of a stored timer entry. Uses UUID v4.
pub type EntryId = Uuid;

/// Shard number used to distribute entries and parallelize scanning.
/// Always in `[0, N)` where `N` is the partition count in use.
pub type Partition = u32;

/// A message that can be delayed by the scheduler.
///
/// The scheduler treats payloads as opaque. Implementors only describe two things:
/// a stable type discriminator persisted next to serialized payloads, and
/// (optionally) the release time the payload itself declares.
pub trait Payload: Clone + Send + Sync + 'static {
  /// Type discriminator stored alongside the serialized payload by stores that
  /// serialize. A persisted record carrying a different kind is treated as corrupt
  /// when read back as this type.
  const KIND: &'static str;

  /// The release time declared by the payload, if any.
  /// `None` means "release as soon as possible" (the registration instant).
  fn release_time(&self) -> Option<DateTime<Utc>> {
    None
  }
}

impl Payload for Vec<u8> {
  const KIND: &'static str = "bytes";
}

impl Payload for String {
  const KIND: &'static str = "text";
}

/// The durable record pairing a payload with its release time.
///
/// `release_time` is fixed at construction. An entry lives in its store until it
/// is removed explicitly (release or cancel) or purged as corrupt.
#[derive(Clone, PartialEq, Eq)]
pub struct TimerEntry<P> {
  id: EntryId,
  payload: P,
  release_time: DateTime<Utc>,
}

impl<P> TimerEntry<P> {
  /// Creates a new entry with a freshly generated id.
  pub fn new(payload: P, release_time: DateTime<Utc>) -> Self {
    Self::with_id(Uuid::new_v4(), payload, release_time)
  }

  /// Rebuilds an entry with a known id (used by stores when reading back).
  pub fn with_id(id: EntryId, payload: P, release_time: DateTime<Utc>) -> Self {
    Self {
      id,
      payload,
      release_time,
    }
  }

  pub fn id(&self) -> EntryId {
    self.id
  }

  pub fn payload(&self) -> &P {
    &self.payload
  }

  pub fn release_time(&self) -> DateTime<Utc> {
    self.release_time
  }

  /// Whether the entry is due at `cutoff` (`release_time <= cutoff`).
  pub fn is_due(&self, cutoff: DateTime<Utc>) -> bool {
    self.release_time <= cutoff
  }

  /// Consumes the entry, returning its payload.
  pub fn into_payload(self) -> P {
    self.payload
  }
}

// Payloads are opaque and may be large; keep Debug output to the envelope.
impl<P> fmt::Debug for TimerEntry<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TimerEntry")
      .field("id", &self.id)
      .field("release_time", &self.release_time)
      .field("payload", &format_args!("<{}>", std::any::type_name::<P>()))
      .finish()
  }
}

/// Sorts a fetched batch ascending by release time, the only ordering the
/// schedulers guarantee.
pub(crate) fn sort_by_release_time<P>(batch: &mut [TimerEntry<P>]) {
  batch.sort_by_key(|entry| entry.release_time);
}
