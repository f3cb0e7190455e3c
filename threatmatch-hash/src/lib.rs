//! Hash prefixes and sorted prefix lists for threat list matching
//!
//! Threat lists are shipped as sets of SHA256 hash prefixes of canonical
//! lookup expressions. A prefix is between 4 and 32 bytes long; a full hash
//! is exactly 32 bytes. Lists are kept sorted by raw bytes because both the
//! server checksum and removal indices are defined over that order.

use base64::engine::general_purpose::STANDARD as B64_STD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;
use thiserror::Error;

pub mod rice;

/// Error type for hash operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    /// Invalid hash prefix length
    #[error("Invalid hash prefix length: {0}, must be between 4 and 32")]
    InvalidLength(usize),

    /// Invalid hash format
    #[error("Invalid hash format: {0}")]
    InvalidFormat(String),
}

/// Result type for hash operations
pub type Result<T> = std::result::Result<T, HashError>;

/// The minimum allowed hash prefix length (4 bytes)
pub const MIN_HASH_PREFIX_LENGTH: usize = 4;
/// The maximum allowed hash prefix length (32 bytes)
pub const MAX_HASH_PREFIX_LENGTH: usize = 32;
/// Length of a complete SHA256 hash
pub const FULL_HASH_LENGTH: usize = 32;

/// Encode bytes as standard padded base64, the form used on the wire.
pub fn to_base64(bytes: &[u8]) -> String {
    B64_STD.encode(bytes)
}

/// Decode standard padded base64.
pub fn from_base64(encoded: &str) -> Result<Vec<u8>> {
    B64_STD
        .decode(encoded)
        .map_err(|e| HashError::InvalidFormat(format!("Invalid base64: {e}")))
}

/// SHA256 of a lookup expression
pub fn sha256(pattern: &str) -> [u8; 32] {
    Sha256::digest(pattern.as_bytes()).into()
}

/// Length of the match between a stored prefix and a query hash.
///
/// Returns 0 when `stored` is shorter than the protocol minimum, longer
/// than `query`, or not a byte prefix of it. Otherwise the stored length.
pub fn match_length(stored: &[u8], query: &[u8]) -> usize {
    if stored.len() < MIN_HASH_PREFIX_LENGTH || stored.len() > query.len() {
        return 0;
    }
    if query[..stored.len()] == *stored {
        stored.len()
    } else {
        0
    }
}

/// A hash prefix between 4 and 32 bytes
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct HashPrefix {
    bytes: Bytes,
}

impl HashPrefix {
    /// Create a new HashPrefix from bytes
    ///
    /// Hash prefixes must be between 4 and 32 bytes in length.
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < MIN_HASH_PREFIX_LENGTH || bytes.len() > MAX_HASH_PREFIX_LENGTH {
            return Err(HashError::InvalidLength(bytes.len()));
        }
        Ok(Self { bytes })
    }

    /// Full 32 byte SHA256 of a lookup expression such as `example.com/a/`
    pub fn full_hash(pattern: &str) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(&sha256(pattern)),
        }
    }

    /// Decode a base64 encoded prefix
    pub fn from_base64(encoded: &str) -> Result<Self> {
        Self::new(from_base64(encoded)?)
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the length of the hash prefix in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the hash prefix contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check if this is a full hash (32 bytes)
    pub fn is_full_hash(&self) -> bool {
        self.bytes.len() == FULL_HASH_LENGTH
    }

    /// Check if this hash is a prefix of another hash
    pub fn is_prefix_of(&self, other: &[u8]) -> bool {
        match_length(&self.bytes, other) > 0
    }

    /// Truncate this hash to a given length
    pub fn truncate(&self, len: usize) -> Result<Self> {
        if len < MIN_HASH_PREFIX_LENGTH || len > self.bytes.len() {
            return Err(HashError::InvalidLength(len));
        }
        Ok(Self {
            bytes: self.bytes.slice(0..len),
        })
    }

    /// Every prefix of this hash from 4 bytes up to its own length
    pub fn prefixes(&self) -> impl Iterator<Item = HashPrefix> + '_ {
        (MIN_HASH_PREFIX_LENGTH..=self.bytes.len()).map(move |len| Self {
            bytes: self.bytes.slice(0..len),
        })
    }

    /// Standard base64 of the raw bytes
    pub fn to_base64(&self) -> String {
        to_base64(&self.bytes)
    }

    /// Convert the hash to a hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Create a HashPrefix from a hexadecimal string
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded)
            .map_err(|e| HashError::InvalidFormat(format!("Invalid hex {encoded:?}: {e}")))?;
        Self::new(bytes)
    }
}

impl Deref for HashPrefix {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl AsRef<[u8]> for HashPrefix {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for HashPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashPrefix({})", self.to_hex())
    }
}

impl fmt::Display for HashPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl Ord for HashPrefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl PartialOrd for HashPrefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Stored and transmitted as base64 text.
impl Serialize for HashPrefix {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for HashPrefix {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// A threat list's hash prefixes, always sorted by raw bytes
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefixList {
    prefixes: Vec<HashPrefix>,
}

impl PrefixList {
    /// Create a new empty list
    pub fn new() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }

    /// Build a list from prefixes in any order
    pub fn from_unsorted(mut prefixes: Vec<HashPrefix>) -> Self {
        prefixes.sort_unstable();
        Self { prefixes }
    }

    /// Append prefixes and restore sort order
    pub fn extend_sorted(&mut self, additions: impl IntoIterator<Item = HashPrefix>) {
        self.prefixes.extend(additions);
        self.prefixes.sort_unstable();
    }

    /// Remove the entries at the given positions of the current sorted order.
    ///
    /// All indices refer to the order before any removal. Out of range
    /// indices are ignored. Returns how many entries were removed.
    pub fn remove_indices(&mut self, indices: impl IntoIterator<Item = u32>) -> usize {
        let mut marked = vec![false; self.prefixes.len()];
        for index in indices {
            if let Some(slot) = marked.get_mut(index as usize) {
                *slot = true;
            }
        }

        let before = self.prefixes.len();
        let mut position = 0;
        self.prefixes.retain(|_| {
            let keep = !marked[position];
            position += 1;
            keep
        });
        before - self.prefixes.len()
    }

    /// Longest stored prefix that is a byte prefix of `query`
    pub fn longest_match(&self, query: &[u8]) -> Option<&HashPrefix> {
        let longest = query.len().min(MAX_HASH_PREFIX_LENGTH);
        (MIN_HASH_PREFIX_LENGTH..=longest).rev().find_map(|len| {
            let probe = &query[..len];
            self.prefixes
                .binary_search_by(|prefix| prefix.as_bytes().cmp(probe))
                .ok()
                .map(|index| &self.prefixes[index])
        })
    }

    /// SHA256 over the concatenation of all prefixes in sorted order
    pub fn checksum(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for prefix in &self.prefixes {
            hasher.update(prefix.as_bytes());
        }
        hasher.finalize().into()
    }

    /// True when every entry is ordered after its predecessor
    pub fn is_sorted(&self) -> bool {
        self.prefixes.windows(2).all(|pair| pair[0] <= pair[1])
    }

    /// Get the number of hash prefixes in the list
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    /// Check if the list is empty
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Iterate in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &HashPrefix> {
        self.prefixes.iter()
    }

    /// Sorted slice view
    pub fn as_slice(&self) -> &[HashPrefix] {
        &self.prefixes
    }
}

impl<'a> IntoIterator for &'a PrefixList {
    type Item = &'a HashPrefix;
    type IntoIter = std::slice::Iter<'a, HashPrefix>;
    fn into_iter(self) -> Self::IntoIter {
        self.prefixes.iter()
    }
}

impl FromIterator<HashPrefix> for PrefixList {
    fn from_iter<T: IntoIterator<Item = HashPrefix>>(iter: T) -> Self {
        Self::from_unsorted(iter.into_iter().collect())
    }
}
