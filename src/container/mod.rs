//! Identifiers for containers and the host machine.
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

mod error;

pub use error::{Error, Result};

/// The maximum allowed length for a [`ContainerID`].
const CONTAINER_ID_MAX_LEN: usize = 255;

/// Length of the abbreviated id printed by `docker ps`.
const SHORT_ID_LEN: usize = 12;

/// A validated container identifier as reported by the container runtime.
///
/// Docker reports 64 hex characters, containerd accepts arbitrary names, so the
/// only constraints are a non-empty value without path separators or whitespace.
///
/// # Examples
///
/// ```
/// # use chain_telemetry::container::ContainerID;
/// let id = ContainerID::new("4f2a9c0e1b7d4f2a9c0e1b7d4f2a9c0e1b7d4f2a9c0e1b7d4f2a9c0e1b7d4f2a").unwrap();
/// assert_eq!(id.short(), "4f2a9c0e1b7d");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerID(Arc<str>);

impl ContainerID {
    /// Creates a new `ContainerID` from the given raw id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContainerID`] if the input is empty, longer than
    /// [`CONTAINER_ID_MAX_LEN`], or contains `/` or whitespace.
    pub fn new(src: impl AsRef<str>) -> Result<Self> {
        let src = src.as_ref();
        if src.is_empty()
            || src.len() > CONTAINER_ID_MAX_LEN
            || src.chars().any(|c| c == '/' || c.is_whitespace())
        {
            return Err(Error::InvalidContainerID(src.to_owned()));
        }

        Ok(Self(src.into()))
    }

    /// Returns the first twelve characters of the id.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ContainerID {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for ContainerID {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ContainerID {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// The host's `/etc/machine-id`, used to tag persisted samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineID([u8; 16]);

impl MachineID {
    pub fn as_raw(&self) -> [u8; 16] {
        self.0
    }
}

impl FromStr for MachineID {
    type Err = Error;

    /// Parses the 32 hex character form found in `/etc/machine-id`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidMachineID(s.to_owned()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for MachineID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
