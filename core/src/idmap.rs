//! UID/GID mapping arithmetic.
//!
//! A mapping table translates IDs seen inside a container to the IDs they
//! occupy on the host. An empty table is the identity mapping.

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

/// One contiguous range of a mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// Parse a `container:host:size` triple.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 3 {
            return Err(BuildError::InvalidArgument(format!(
                "ID mapping {:?} must have the form container:host:size",
                spec
            )));
        }
        let field = |s: &str| {
            s.parse::<u32>().map_err(|e| {
                BuildError::InvalidArgument(format!("ID mapping {:?}: {}", spec, e))
            })
        };
        let map = IdMap::new(field(parts[0])?, field(parts[1])?, field(parts[2])?);
        if map.size == 0 {
            return Err(BuildError::InvalidArgument(format!(
                "ID mapping {:?} has zero size",
                spec
            )));
        }
        Ok(map)
    }
}

/// A UID/GID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdPair {
    pub uid: u32,
    pub gid: u32,
}

impl IdPair {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// UID and GID tables for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappings {
    #[serde(default)]
    pub uid_map: Vec<IdMap>,
    #[serde(default)]
    pub gid_map: Vec<IdMap>,
}

impl IdMappings {
    pub fn new(uid_map: Vec<IdMap>, gid_map: Vec<IdMap>) -> Self {
        Self { uid_map, gid_map }
    }

    /// True when no translation is performed.
    pub fn is_identity(&self) -> bool {
        self.uid_map.is_empty() && self.gid_map.is_empty()
    }

    /// Map a container pair to its host pair.
    pub fn to_host(&self, pair: IdPair) -> Result<IdPair> {
        Ok(IdPair {
            uid: map_to_host(&self.uid_map, pair.uid, "UID")?,
            gid: map_to_host(&self.gid_map, pair.gid, "GID")?,
        })
    }

    /// Map a host pair back into the container.
    pub fn to_container(&self, pair: IdPair) -> Result<IdPair> {
        Ok(IdPair {
            uid: map_to_container(&self.uid_map, pair.uid, "UID")?,
            gid: map_to_container(&self.gid_map, pair.gid, "GID")?,
        })
    }

    /// Host IDs that container root maps to.
    pub fn root_pair(&self) -> IdPair {
        self.to_host(IdPair::default()).unwrap_or_default()
    }
}

fn map_to_host(table: &[IdMap], id: u32, what: &str) -> Result<u32> {
    if table.is_empty() {
        return Ok(id);
    }
    for m in table {
        if id >= m.container_id && (id - m.container_id) < m.size {
            return Ok(m.host_id + (id - m.container_id));
        }
    }
    Err(BuildError::InvalidArgument(format!(
        "container {} {} has no mapping to the host",
        what, id
    )))
}

fn map_to_container(table: &[IdMap], id: u32, what: &str) -> Result<u32> {
    if table.is_empty() {
        return Ok(id);
    }
    for m in table {
        if id >= m.host_id && (id - m.host_id) < m.size {
            return Ok(m.container_id + (id - m.host_id));
        }
    }
    Err(BuildError::InvalidArgument(format!(
        "host {} {} has no mapping into the container",
        what, id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn userns() -> IdMappings {
        IdMappings::new(
            vec![IdMap::new(0, 100000, 65536)],
            vec![IdMap::new(0, 200000, 1000), IdMap::new(1000, 1000, 1)],
        )
    }

    #[test]
    fn test_identity_mapping() {
        let maps = IdMappings::default();
        assert!(maps.is_identity());
        assert_eq!(maps.to_host(IdPair::new(5, 6)).unwrap(), IdPair::new(5, 6));
        assert_eq!(maps.root_pair(), IdPair::new(0, 0));
    }

    #[test]
    fn test_to_host_and_back() {
        let maps = userns();
        let host = maps.to_host(IdPair::new(10, 1000)).unwrap();
        assert_eq!(host, IdPair::new(100010, 1000));
        assert_eq!(maps.to_container(host).unwrap(), IdPair::new(10, 1000));
        assert_eq!(maps.root_pair(), IdPair::new(100000, 200000));
    }

    #[test]
    fn test_unmapped_id_is_rejected() {
        let maps = userns();
        assert!(maps.to_host(IdPair::new(70000, 0)).is_err());
        assert!(maps.to_container(IdPair::new(5, 200000)).is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!(IdMap::parse("0:1000:1").unwrap(), IdMap::new(0, 1000, 1));
        assert!(IdMap::parse("0:1000").is_err());
        assert!(IdMap::parse("a:b:c").is_err());
        assert!(IdMap::parse("0:0:0").is_err());
    }
}
