//! Pool / container identity service port
//!
//! Supplies the server-side handle uuids used to open the container for
//! remote I/O, the pool map version, and the per-object leader check that
//! gates aggregation: only the leader parity shard drives a stripe.

use std::collections::HashSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::ObjectId;

/// Outcome of the leader check for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderCheck {
    Leader,
    NotLeader,
}

/// Server-side pool and container handle uuids, as distributed by the IV
/// service.
#[derive(Debug, Clone, Copy)]
pub struct SrvHandles {
    pub pool_hdl: Uuid,
    pub cont_hdl: Uuid,
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Fetch the shared pool/container handle uuids.
    async fn srv_handles(&self) -> Result<SrvHandles>;

    /// Current pool map version.
    fn map_version(&self) -> u32;

    /// Whether this target leads aggregation for the object at the given
    /// map version.
    async fn check_leader(&self, oid: ObjectId, map_version: u32) -> Result<LeaderCheck>;
}

// =============================================================================
// Static Implementation
// =============================================================================

/// Identity service with fixed handles and an explicit leader set.
/// `leaders == None` means this target leads every object.
#[derive(Debug)]
pub struct StaticIdentity {
    handles: SrvHandles,
    map_version: u32,
    leaders: Option<HashSet<ObjectId>>,
}

impl StaticIdentity {
    pub fn new(pool_hdl: Uuid, cont_hdl: Uuid, map_version: u32) -> Self {
        Self {
            handles: SrvHandles { pool_hdl, cont_hdl },
            map_version,
            leaders: None,
        }
    }

    /// Restrict leadership to an explicit object set.
    pub fn with_leaders(mut self, leaders: impl IntoIterator<Item = ObjectId>) -> Self {
        self.leaders = Some(leaders.into_iter().collect());
        self
    }
}

#[async_trait]
impl IdentityService for StaticIdentity {
    async fn srv_handles(&self) -> Result<SrvHandles> {
        Ok(self.handles)
    }

    fn map_version(&self) -> u32 {
        self.map_version
    }

    async fn check_leader(&self, oid: ObjectId, _map_version: u32) -> Result<LeaderCheck> {
        match &self.leaders {
            Some(set) if !set.contains(&oid) => Ok(LeaderCheck::NotLeader),
            _ => Ok(LeaderCheck::Leader),
        }
    }
}
