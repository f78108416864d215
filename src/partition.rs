//! Partition topologies and the builder that produces them
//!
//! A topology assigns services to named partitions and says, for each pair of
//! partitions, whether traffic between them is blocked. Pairs that are not declared
//! use the topology's default connection.

use crate::{Error, Result, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Name of a partition. The empty string is the default partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The always-present partition holding every service not assigned elsewhere
    pub fn default_partition() -> Self {
        Self(String::new())
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Whether traffic flows between two partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Open,
    Blocked,
}

impl ConnectionState {
    pub fn from_blocked(blocked: bool) -> Self {
        if blocked {
            Self::Blocked
        } else {
            Self::Open
        }
    }

    pub fn is_blocked(self) -> bool {
        self == Self::Blocked
    }
}

/// Unordered pair of partitions; `(a, b)` and `(b, a)` are the same pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionPair {
    first: PartitionId,
    second: PartitionId,
}

impl PartitionPair {
    pub fn new(a: PartitionId, b: PartitionId) -> Self {
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    pub fn first(&self) -> &PartitionId {
        &self.first
    }

    pub fn second(&self) -> &PartitionId {
        &self.second
    }
}

/// An immutable target topology, ready to be submitted with
/// [`NetworkContext::repartition_network`](crate::NetworkContext::repartition_network)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTopology {
    services: HashMap<PartitionId, HashSet<ServiceId>>,
    connections: HashMap<PartitionPair, ConnectionState>,
    default_connection: ConnectionState,
}

impl PartitionTopology {
    pub fn services(&self) -> &HashMap<PartitionId, HashSet<ServiceId>> {
        &self.services
    }

    pub fn connections(&self) -> &HashMap<PartitionPair, ConnectionState> {
        &self.connections
    }

    pub fn default_connection(&self) -> ConnectionState {
        self.default_connection
    }

    /// Partition `service_id` is declared in, if any
    pub fn partition_of(&self, service_id: &ServiceId) -> Option<&PartitionId> {
        self.services
            .iter()
            .find(|(_, members)| members.contains(service_id))
            .map(|(partition, _)| partition)
    }

    /// Connection state between two partitions, falling back to the default
    pub fn connection(&self, a: &PartitionId, b: &PartitionId) -> ConnectionState {
        if a == b {
            return ConnectionState::Open;
        }
        self.connections
            .get(&PartitionPair::new(a.clone(), b.clone()))
            .copied()
            .unwrap_or(self.default_connection)
    }
}

enum RepartitionAction {
    DeclarePartition {
        partition: PartitionId,
        services: Vec<ServiceId>,
    },
    DeclareConnection {
        partition_a: PartitionId,
        partition_b: PartitionId,
        state: ConnectionState,
    },
}

impl RepartitionAction {
    fn apply(self, index: usize, topology: &mut PartitionTopology) -> Result<()> {
        match self {
            Self::DeclarePartition {
                partition,
                services,
            } => {
                if topology.services.contains_key(&partition) {
                    return Err(Error::DuplicatePartition {
                        action_index: index,
                        partition,
                    });
                }
                for service_id in &services {
                    if let Some(existing) = topology.partition_of(service_id) {
                        return Err(Error::DuplicatePartitionMember {
                            action_index: index,
                            service_id: service_id.clone(),
                            partition: existing.clone(),
                        });
                    }
                }
                topology
                    .services
                    .insert(partition, services.into_iter().collect());
                Ok(())
            }
            Self::DeclareConnection {
                partition_a,
                partition_b,
                state,
            } => {
                let pair = PartitionPair::new(partition_a.clone(), partition_b.clone());
                if topology.connections.contains_key(&pair) {
                    return Err(Error::DuplicateConnection {
                        action_index: index,
                        partition_a,
                        partition_b,
                    });
                }
                topology.connections.insert(pair, state);
                Ok(())
            }
        }
    }
}

/// Fluent builder for a [`PartitionTopology`]
///
/// Declarations never fail while chaining; they are validated in order by [`build`](Self::build).
pub struct RepartitionerBuilder {
    default_connection: ConnectionState,
    actions: Vec<RepartitionAction>,
}

impl RepartitionerBuilder {
    /// Start a topology where undeclared partition pairs are blocked or open
    pub fn new(is_default_connection_blocked: bool) -> Self {
        Self {
            default_connection: ConnectionState::from_blocked(is_default_connection_blocked),
            actions: Vec::new(),
        }
    }

    /// Declare a partition and its member services
    pub fn with_partition<I, T>(mut self, partition: impl Into<PartitionId>, services: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ServiceId>,
    {
        self.actions.push(RepartitionAction::DeclarePartition {
            partition: partition.into(),
            services: services.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Declare whether traffic between two partitions is blocked
    pub fn with_partition_connection(
        mut self,
        partition_a: impl Into<PartitionId>,
        partition_b: impl Into<PartitionId>,
        is_blocked: bool,
    ) -> Self {
        self.actions.push(RepartitionAction::DeclareConnection {
            partition_a: partition_a.into(),
            partition_b: partition_b.into(),
            state: ConnectionState::from_blocked(is_blocked),
        });
        self
    }

    /// Apply every declaration in order, stopping at the first invalid one
    pub fn build(self) -> Result<PartitionTopology> {
        let mut topology = PartitionTopology {
            services: HashMap::new(),
            connections: HashMap::new(),
            default_connection: self.default_connection,
        };

        for (index, action) in self.actions.into_iter().enumerate() {
            action.apply(index, &mut topology)?;
        }

        Ok(topology)
    }
}
