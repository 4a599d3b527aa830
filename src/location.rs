//! Addresses of the logical databases a transaction touches
//!
//! A [`Location`] tells the coordinator where a logical database currently
//! lives: in the local process, or behind a remote peer/shard address. The
//! database identity and the physical address are deliberately separate,
//! because the address of a remote database can change mid-transaction when
//! its leader moves.

use std::fmt;
use uuid::Uuid;

/// Identity of one logical database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseRef {
    pub id: Uuid,
    pub name: String,
}

impl DatabaseRef {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for DatabaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Physical address of a remote peer or shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    pub host: String,
    pub port: u16,
}

impl RemoteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Where a logical database lives, as resolved for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// The database is a partition served by the local storage engine.
    Local { database: DatabaseRef },
    /// The database is served by a remote peer or shard.
    Remote {
        database: DatabaseRef,
        address: RemoteAddress,
    },
}

impl Location {
    pub fn local(database: DatabaseRef) -> Self {
        Location::Local { database }
    }

    pub fn remote(database: DatabaseRef, address: RemoteAddress) -> Self {
        Location::Remote { database, address }
    }

    /// The logical database this location resolves.
    pub fn database(&self) -> &DatabaseRef {
        match self {
            Location::Local { database } => database,
            Location::Remote { database, .. } => database,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local { .. })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local { database } => write!(f, "{} (local)", database),
            Location::Remote { database, address } => write!(f, "{} @ {}", database, address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_database_different_address_is_a_different_location() {
        let db = DatabaseRef::new(Uuid::new_v4(), "orders");
        let a = Location::remote(db.clone(), RemoteAddress::new("host-1", 7687));
        let b = Location::remote(db.clone(), RemoteAddress::new("host-2", 7687));

        assert_ne!(a, b);
        assert_eq!(a.database(), b.database());
    }
}
