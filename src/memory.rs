//! In-process orchestrator for tests that do not need real containers
//!
//! Keeps a model of the running services and the current partition topology so
//! service doubles can ask whether two services can reach each other. Failures can be
//! injected per operation.

use crate::{
    AddServiceArgs, AddServiceResponse, ConnectionState, OrchestratorClient, OrchestratorError,
    PartitionId, PartitionPair, RegisterTestExecutionArgs, RemoveServiceArgs, RepartitionArgs,
    ServiceId,
};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A call received by [`InMemoryOrchestrator`], in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCall {
    AddService(AddServiceArgs),
    RemoveService(RemoveServiceArgs),
    Repartition(RepartitionArgs),
    RegisterTestExecution(RegisterTestExecutionArgs),
}

#[derive(Debug, Clone)]
struct RunningService {
    ip: Ipv4Addr,
    partition: PartitionId,
    command: Option<Vec<String>>,
    environment: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct InjectedFailures {
    add_service: HashSet<ServiceId>,
    remove_service: HashSet<ServiceId>,
    repartition: bool,
    transient_registrations: u32,
}

#[derive(Debug)]
struct EngineState {
    subnet: Ipv4Network,
    next_host: u32,
    services: HashMap<ServiceId, RunningService>,
    connections: HashMap<PartitionPair, ConnectionState>,
    default_connection: ConnectionState,
    calls: Vec<OrchestratorCall>,
    registered_timeouts: Vec<u64>,
    failures: InjectedFailures,
}

impl EngineState {
    fn allocate_ip(&mut self) -> Result<Ipv4Addr, OrchestratorError> {
        // Host 0 is the network address and host 1 the gateway
        let host = self.next_host + 2;
        let ip = self
            .subnet
            .nth(host)
            .filter(|ip| *ip != self.subnet.broadcast())
            .ok_or_else(|| OrchestratorError::Rejected(format!("subnet {} exhausted", self.subnet)))?;
        self.next_host += 1;
        Ok(ip)
    }

    fn connection(&self, a: &PartitionId, b: &PartitionId) -> ConnectionState {
        if a == b {
            return ConnectionState::Open;
        }
        self.connections
            .get(&PartitionPair::new(a.clone(), b.clone()))
            .copied()
            .unwrap_or(self.default_connection)
    }
}

/// Orchestrator that runs entirely in memory
#[derive(Debug)]
pub struct InMemoryOrchestrator {
    state: Mutex<EngineState>,
}

impl Default for InMemoryOrchestrator {
    fn default() -> Self {
        let base = Ipv4Addr::new(172, 23, 0, 0);
        Self::with_subnet(Ipv4Network::new(base, 16).unwrap_or_else(|_| Ipv4Network::from(base)))
    }
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate service IPs from `subnet`
    pub fn with_subnet(subnet: Ipv4Network) -> Self {
        Self {
            state: Mutex::new(EngineState {
                subnet,
                next_host: 0,
                services: HashMap::new(),
                connections: HashMap::new(),
                default_connection: ConnectionState::Open,
                calls: Vec::new(),
                registered_timeouts: Vec::new(),
                failures: InjectedFailures::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call received so far, failed ones included
    pub fn calls(&self) -> Vec<OrchestratorCall> {
        self.state().calls.clone()
    }

    /// Hard timeouts registered so far, in seconds
    pub fn registered_timeouts(&self) -> Vec<u64> {
        self.state().registered_timeouts.clone()
    }

    pub fn running_services(&self) -> Vec<ServiceId> {
        self.state().services.keys().cloned().collect()
    }

    pub fn ip_of(&self, service_id: &ServiceId) -> Option<String> {
        self.state()
            .services
            .get(service_id)
            .map(|service| service.ip.to_string())
    }

    pub fn partition_of(&self, service_id: &ServiceId) -> Option<PartitionId> {
        self.state()
            .services
            .get(service_id)
            .map(|service| service.partition.clone())
    }

    /// Start command as launched, with the IP placeholder replaced
    pub fn launched_command(&self, service_id: &ServiceId) -> Option<Vec<String>> {
        self.state()
            .services
            .get(service_id)
            .and_then(|service| service.command.clone())
    }

    /// Environment as launched, with the IP placeholder replaced
    pub fn launched_environment(&self, service_id: &ServiceId) -> Option<HashMap<String, String>> {
        self.state()
            .services
            .get(service_id)
            .map(|service| service.environment.clone())
    }

    /// Whether traffic from `from` can currently reach `to`.
    ///
    /// False if either service is not running.
    pub fn can_communicate(&self, from: &ServiceId, to: &ServiceId) -> bool {
        let state = self.state();
        match (state.services.get(from), state.services.get(to)) {
            (Some(a), Some(b)) => !state.connection(&a.partition, &b.partition).is_blocked(),
            _ => false,
        }
    }

    pub fn fail_add_service(&self, service_id: impl Into<ServiceId>) {
        self.state().failures.add_service.insert(service_id.into());
    }

    pub fn fail_remove_service(&self, service_id: impl Into<ServiceId>) {
        self.state().failures.remove_service.insert(service_id.into());
    }

    pub fn fail_repartition(&self, fail: bool) {
        self.state().failures.repartition = fail;
    }

    /// Report the next `count` registrations as unreachable
    pub fn fail_registrations(&self, count: u32) {
        self.state().failures.transient_registrations = count;
    }
}

fn substitute_ip(value: &str, placeholder: &str, ip: &str) -> String {
    if placeholder.is_empty() {
        value.to_string()
    } else {
        value.replace(placeholder, ip)
    }
}

#[async_trait]
impl OrchestratorClient for InMemoryOrchestrator {
    async fn add_service(&self, args: AddServiceArgs) -> Result<AddServiceResponse, OrchestratorError> {
        let mut state = self.state();
        state.calls.push(OrchestratorCall::AddService(args.clone()));

        let service_id = ServiceId::new(args.service_id);
        if state.failures.add_service.contains(&service_id) {
            return Err(OrchestratorError::Rejected(format!(
                "injected failure starting '{}'",
                service_id
            )));
        }
        if state.services.contains_key(&service_id) {
            return Err(OrchestratorError::Rejected(format!(
                "service '{}' is already running",
                service_id
            )));
        }

        let ip = state.allocate_ip()?;
        let ip_str = ip.to_string();
        let command = args.start_command.map(|cmd| {
            cmd.iter()
                .map(|arg| substitute_ip(arg, &args.ip_placeholder, &ip_str))
                .collect()
        });
        let environment = args
            .docker_environment_vars
            .iter()
            .map(|(k, v)| (k.clone(), substitute_ip(v, &args.ip_placeholder, &ip_str)))
            .collect();

        tracing::debug!("In-memory engine started '{}' at {}", service_id, ip);
        state.services.insert(
            service_id,
            RunningService {
                ip,
                partition: PartitionId::new(args.partition_id),
                command,
                environment,
            },
        );

        Ok(AddServiceResponse { ip_address: ip_str })
    }

    async fn remove_service(&self, args: RemoveServiceArgs) -> Result<(), OrchestratorError> {
        let mut state = self.state();
        state.calls.push(OrchestratorCall::RemoveService(args.clone()));

        let service_id = ServiceId::new(args.service_id);
        if state.failures.remove_service.contains(&service_id) {
            return Err(OrchestratorError::Rejected(format!(
                "injected failure stopping '{}'",
                service_id
            )));
        }
        state
            .services
            .remove(&service_id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::Rejected(format!("no running service '{}'", service_id)))
    }

    async fn repartition(&self, args: RepartitionArgs) -> Result<(), OrchestratorError> {
        let mut state = self.state();
        state.calls.push(OrchestratorCall::Repartition(args.clone()));

        if state.failures.repartition {
            return Err(OrchestratorError::Rejected("injected repartition failure".into()));
        }

        let mut assignments = HashMap::new();
        for (partition, members) in &args.partition_services {
            for member in members {
                let service_id = ServiceId::new(member.as_str());
                if !state.services.contains_key(&service_id) {
                    return Err(OrchestratorError::Rejected(format!(
                        "partition '{}' names unknown service '{}'",
                        partition, member
                    )));
                }
                assignments.insert(service_id, PartitionId::new(partition.as_str()));
            }
        }

        let mut connections = HashMap::new();
        for (a, targets) in &args.partition_connections {
            for (b, connection) in targets {
                connections.insert(
                    PartitionPair::new(PartitionId::new(a.as_str()), PartitionId::new(b.as_str())),
                    ConnectionState::from_blocked(connection.is_blocked),
                );
            }
        }

        for (service_id, service) in state.services.iter_mut() {
            service.partition = assignments
                .remove(service_id)
                .unwrap_or_else(PartitionId::default_partition);
        }
        state.connections = connections;
        state.default_connection = ConnectionState::from_blocked(args.default_connection.is_blocked);
        Ok(())
    }

    async fn register_test_execution(&self, args: RegisterTestExecutionArgs) -> Result<(), OrchestratorError> {
        let mut state = self.state();
        state.calls.push(OrchestratorCall::RegisterTestExecution(args));

        if state.failures.transient_registrations > 0 {
            state.failures.transient_registrations -= 1;
            return Err(OrchestratorError::Unreachable("in-memory engine not ready".into()));
        }
        state.registered_timeouts.push(args.test_timeout_seconds);
        Ok(())
    }
}
