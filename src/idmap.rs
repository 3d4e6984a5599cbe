//! User namespace id maps
//!
//! Maps are kept in the comma separated form `inside outside length[,...]`
//! used throughout the configuration. The kernel wants one triplet per line,
//! see [kernel_format()].

use crate::errors::{ConfigError, ContainerError};
use std::{fmt, str::FromStr};

/// One `inside outside length` range of a uid or gid map
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct IdMapping {
    pub inside: u32,
    pub outside: u32,
    pub length: u32,
}

impl IdMapping {
    fn to_outside(&self, id: u32) -> Option<u32> {
        if id >= self.inside && (id - self.inside) < self.length {
            self.outside.checked_add(id - self.inside)
        } else {
            None
        }
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.inside, self.outside, self.length)
    }
}

impl FromStr for IdMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidIdMap(s.to_string());
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(invalid());
        }
        let number = |field: &str| field.parse::<u32>().map_err(|_| invalid());
        let mapping = IdMapping {
            inside: number(fields[0])?,
            outside: number(fields[1])?,
            length: number(fields[2])?,
        };
        if mapping.length == 0 {
            return Err(invalid());
        }
        Ok(mapping)
    }
}

/// Parse a comma separated map; an empty string is the empty map
pub fn parse(map: &str) -> Result<Vec<IdMapping>, ConfigError> {
    map.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

/// Join mappings back into the comma separated form
#[allow(dead_code)]
pub fn to_string(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(IdMapping::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// The map as written to `/proc/<pid>/uid_map` or `gid_map`
pub fn kernel_format(map: &str) -> String {
    map.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Translate an id inside the namespace to the id it has outside
///
/// An empty map is the identity. A non-empty map that does not cover the id
/// is an error.
pub fn outside_id(map: &str, id: u32) -> Result<u32, ContainerError> {
    let mappings = parse(map)?;
    if mappings.is_empty() {
        return Ok(id);
    }
    mappings
        .iter()
        .find_map(|mapping| mapping.to_outside(id))
        .ok_or_else(|| ContainerError::UnmappedId {
            id,
            map: map.to_string(),
        })
}
