//! Registration tokens: the opaque handle returned by `register` and consumed by `cancel`.
//!
//! A token round-trips to `(entry id, partition)`. The canonical form is a small
//! versioned binary struct, base64url encoded without padding:
//!
//! ```text
//! byte  0      version (0x01)
//! bytes 1..17  entry id (UUID, big-endian bytes)
//! byte  17     partition flag (0 = unpartitioned, 1 = partitioned)
//! bytes 18..22 partition (u32, big-endian; zero when unpartitioned)
//! ```
//!
//! For interop, decoding also accepts the string forms older deployments handed out:
//! `"<id>:{<partition>}"` and a bare `"<id>"` (unpartitioned).

use crate::entry::{EntryId, Partition};
use crate::error::TokenError;

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use uuid::Uuid;

const TOKEN_VERSION: u8 = 1;
const ENCODED_LEN: usize = 22;
/// Length of the base64url (no padding) rendering of [`ENCODED_LEN`] bytes.
const RENDERED_LEN: usize = 30;

/// Opaque handle identifying a registered entry and the partition it lives in.
///
/// Treat the string form as opaque; use [`RegistrationToken::entry_id`] and
/// [`RegistrationToken::partition`] if the components are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken {
  entry_id: EntryId,
  partition: Option<Partition>,
}

impl RegistrationToken {
  pub fn new(entry_id: EntryId, partition: Option<Partition>) -> Self {
    Self {
      entry_id,
      partition,
    }
  }

  pub fn entry_id(&self) -> EntryId {
    self.entry_id
  }

  pub fn partition(&self) -> Option<Partition> {
    self.partition
  }

  /// Encodes the token into its canonical string form.
  pub fn encode(&self) -> String {
    let mut buf = [0u8; ENCODED_LEN];
    buf[0] = TOKEN_VERSION;
    buf[1..17].copy_from_slice(self.entry_id.as_bytes());
    if let Some(partition) = self.partition {
      buf[17] = 1;
      buf[18..22].copy_from_slice(&partition.to_be_bytes());
    }
    URL_SAFE_NO_PAD.encode(buf)
  }

  /// Renders the `"<id>:{<partition>}"` form (or a bare id when unpartitioned).
  pub fn legacy_string(&self) -> String {
    match self.partition {
      Some(partition) => format!("{}:{{{}}}", self.entry_id, partition),
      None => self.entry_id.to_string(),
    }
  }

  /// Decodes any accepted token form.
  ///
  /// # Errors
  ///
  /// - [`TokenError::Invalid`] if the input matches none of the accepted forms.
  /// - [`TokenError::UnsupportedVersion`] for a well-formed binary token of an unknown version.
  pub fn decode(token: &str) -> Result<Self, TokenError> {
    let invalid = || TokenError::Invalid(token.to_string());

    if token.contains(':') {
      return Self::decode_legacy(token).ok_or_else(invalid);
    }

    if token.len() == RENDERED_LEN {
      let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
      return Self::decode_binary(token, &bytes);
    }

    Uuid::parse_str(token)
      .map(|entry_id| Self::new(entry_id, None))
      .map_err(|_| invalid())
  }

  fn decode_binary(token: &str, bytes: &[u8]) -> Result<Self, TokenError> {
    let invalid = || TokenError::Invalid(token.to_string());
    if bytes.len() != ENCODED_LEN {
      return Err(invalid());
    }
    if bytes[0] != TOKEN_VERSION {
      return Err(TokenError::UnsupportedVersion {
        version: bytes[0],
        token: token.to_string(),
      });
    }
    let entry_id = Uuid::from_slice(&bytes[1..17]).map_err(|_| invalid())?;
    let mut partition_bytes = [0u8; 4];
    partition_bytes.copy_from_slice(&bytes[18..22]);
    let partition = match bytes[17] {
      0 => None,
      1 => Some(u32::from_be_bytes(partition_bytes)),
      _ => return Err(invalid()),
    };
    Ok(Self::new(entry_id, partition))
  }

  // "<uuid>:{<partition>}"
  fn decode_legacy(token: &str) -> Option<Self> {
    let (id, rest) = token.split_once(':')?;
    let digits = rest.strip_prefix('{')?.strip_suffix('}')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
      return None;
    }
    let partition = digits.parse::<Partition>().ok()?;
    let entry_id = Uuid::parse_str(id).ok()?;
    Some(Self::new(entry_id, Some(partition)))
  }
}

impl fmt::Display for RegistrationToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.encode())
  }
}

impl FromStr for RegistrationToken {
  type Err = TokenError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::decode(s)
  }
}

#[cfg(feature = "serde")]
impl serde::Serialize for RegistrationToken {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.encode())
  }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for RegistrationToken {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Self::decode(&raw).map_err(serde::de::Error::custom)
  }
}
