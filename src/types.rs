//! Type-safe wrappers for publish path primitives.
//!
//! These newtypes keep partition indexes and offsets from being mixed up even
//! though both are plain integers on the wire.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Index of one ordered log within a topic.
///
/// Partition counts only grow while a publisher runs, so an index that was
/// valid once stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Partition(pub u32);

impl Partition {
    /// Create a partition index from a raw value.
    #[inline]
    pub const fn new(value: u32) -> Self {
        Partition(value)
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// The index as a `usize`, for addressing partition-indexed collections.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for Partition {
    fn from(value: u32) -> Self {
        Partition(value)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service-assigned position of a message within a partition (the cursor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(pub i64);

impl Offset {
    /// Create an offset from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        Offset(value)
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// The offset `delta` positions after this one, or `None` on overflow.
    #[inline]
    pub const fn checked_advance(self, delta: i64) -> Option<Self> {
        match self.0.checked_add(delta) {
            Some(value) => Some(Offset(value)),
            None => None,
        }
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Offset(value)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a successfully published message landed.
///
/// The string form is `"<partition>:<offset>"`, which is what applications
/// store when they want to refer back to a message later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageMetadata {
    pub partition: Partition,
    pub offset: Offset,
}

impl MessageMetadata {
    pub const fn new(partition: Partition, offset: Offset) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for MessageMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.offset)
    }
}

/// Parse a non-negative decimal integer made of ASCII digits only.
///
/// `str::parse` alone would also accept a leading `+`.
fn parse_digits<T: FromStr>(part: &str, input: &str) -> Result<T> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidArgument(format!(
            "malformed message metadata '{input}': expected <partition>:<offset>"
        )));
    }
    part.parse().map_err(|_| {
        Error::InvalidArgument(format!(
            "malformed message metadata '{input}': value out of range"
        ))
    })
}

impl FromStr for MessageMetadata {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let (Some(partition), Some(offset), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidArgument(format!(
                "malformed message metadata '{s}': expected <partition>:<offset>"
            )));
        };

        Ok(MessageMetadata {
            partition: Partition(parse_digits(partition, s)?),
            offset: Offset(parse_digits(offset, s)?),
        })
    }
}

impl Serialize for MessageMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageMetadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A message submitted for publishing.
///
/// Messages are moved into the publisher and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    ordering_key: Bytes,
    data: Bytes,
    attributes: HashMap<String, Bytes>,
}

impl Message {
    /// Create an unkeyed message.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Set the ordering key. Messages sharing a key land on the same partition.
    pub fn with_ordering_key(mut self, key: impl Into<Bytes>) -> Self {
        self.ordering_key = key.into();
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The ordering key, or `None` when the message is unkeyed.
    ///
    /// An empty key is treated as no key.
    pub fn ordering_key(&self) -> Option<&[u8]> {
        if self.ordering_key.is_empty() {
            None
        } else {
            Some(&self.ordering_key)
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn attributes(&self) -> &HashMap<String, Bytes> {
        &self.attributes
    }

    /// Approximate encoded size, used for batch byte limits.
    pub fn encoded_len(&self) -> usize {
        self.ordering_key.len()
            + self.data.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// Fully qualified topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPath {
    pub project: String,
    pub location: String,
    pub name: String,
}

impl TopicPath {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            location: location.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/topics/{}",
            self.project, self.location, self.name
        )
    }
}

impl FromStr for TopicPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", location, "topics", name]
                if !project.is_empty() && !location.is_empty() && !name.is_empty() =>
            {
                Ok(TopicPath::new(*project, *location, *name))
            }
            _ => Err(Error::InvalidArgument(format!(
                "malformed topic path '{s}': expected projects/<p>/locations/<l>/topics/<t>"
            ))),
        }
    }
}
