//! Connection identity.
//!
//! A logical connection is named by the node that created it and a
//! per-node connection number. Together with the local role that forms the
//! [`Triplet`], which stays the same across every physical link the
//! connection ever uses.

use {
    rand::Rng,
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Random 128-bit identity of a connector node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u128);

impl NodeId {
    pub fn new_random() -> Self {
        Self(rand::rng().random())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Role-independent key of a logical connection. Both peers use the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnKey {
    /// Node that dialed the connection.
    pub owner: NodeId,
    /// Connection number, unique per owner.
    pub connection_id: u64,
}

impl ConnKey {
    pub fn new(owner: NodeId, connection_id: u64) -> Self {
        Self {
            owner,
            connection_id,
        }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The low 32 bits of the owner are plenty to tell nodes apart in logs.
        write!(f, "{:08x}/{}", self.owner.0 as u32, self.connection_id)
    }
}

/// Identity of one side of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Triplet {
    pub owner: NodeId,
    pub connection_id: u64,
    pub are_we_connector: bool,
}

impl Triplet {
    pub fn connector(key: ConnKey) -> Self {
        Self {
            owner: key.owner,
            connection_id: key.connection_id,
            are_we_connector: true,
        }
    }

    pub fn connectee(key: ConnKey) -> Self {
        Self {
            owner: key.owner,
            connection_id: key.connection_id,
            are_we_connector: false,
        }
    }

    pub fn key(&self) -> ConnKey {
        ConnKey::new(self.owner, self.connection_id)
    }
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = if self.are_we_connector { "connector" } else { "connectee" };
        write!(f, "{} ({role})", self.key())
    }
}
