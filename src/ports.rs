//! Per-service loopback port allocation
//!
//! Every service owns a small fixed range. A port found free is kept bound by
//! a reservation socket until the supervisor hands it to the subprocess, so a
//! concurrent allocation (from this or another gateway on the host) cannot
//! claim it between the check and the spawn.

use crate::error::ControlError;
use crate::service::ServiceId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use tracing::{debug, info, warn};

/// A live allocation owned by the registry
struct PortAllocation {
    port: u16,
    allocated_at: DateTime<Utc>,
    /// Bound, listening, never accepting
    reservation: Option<TcpListener>,
}

/// Snapshot of an allocation handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub service: ServiceId,
    pub port: u16,
    pub allocated_at: DateTime<Utc>,
    /// Whether the reservation socket is still held
    pub reserved: bool,
}

/// Allocates, validates and releases ports per service
pub struct PortRegistry {
    ranges: HashMap<ServiceId, (u16, u16)>,
    allocations: Mutex<HashMap<ServiceId, PortAllocation>>,
}

impl PortRegistry {
    /// Create a registry over the given inclusive ranges.
    ///
    /// Fails if a range is empty or two ranges overlap.
    pub fn new(ranges: impl IntoIterator<Item = (ServiceId, (u16, u16))>) -> anyhow::Result<Self> {
        let ranges: HashMap<ServiceId, (u16, u16)> = ranges.into_iter().collect();

        for (service, (start, end)) in &ranges {
            if *start == 0 || start > end {
                anyhow::bail!("invalid port range {}-{} for {}", start, end, service);
            }
            for (other, (o_start, o_end)) in &ranges {
                if other != service && start <= o_end && o_start <= end {
                    anyhow::bail!(
                        "port range of {} ({}-{}) overlaps {} ({}-{})",
                        service, start, end, other, o_start, o_end
                    );
                }
            }
        }

        Ok(Self {
            ranges,
            allocations: Mutex::new(HashMap::new()),
        })
    }

    /// Registry using each service's built-in range
    pub fn with_default_ranges() -> Self {
        Self {
            ranges: ServiceId::ALL
                .into_iter()
                .map(|id| (id, id.default_port_range()))
                .collect(),
            allocations: Mutex::new(HashMap::new()),
        }
    }

    pub fn range(&self, service: ServiceId) -> (u16, u16) {
        self.ranges
            .get(&service)
            .copied()
            .unwrap_or_else(|| service.default_port_range())
    }

    /// Allocate a port for `service`, reusing a still-valid allocation.
    ///
    /// A fresh port is returned with its reservation socket held.
    pub fn allocate(&self, service: ServiceId) -> Result<Allocation, ControlError> {
        let mut allocations = self.allocations.lock();

        if let Some(existing) = allocations.get(&service) {
            if Self::still_held(existing) {
                debug!(service = %service, port = existing.port, "Reusing port allocation");
                return Ok(snapshot(service, existing));
            }
            warn!(
                service = %service,
                port = existing.port,
                "Discarding stale port allocation (holder is gone)"
            );
            allocations.remove(&service);
        }

        let (start, end) = self.range(service);
        let span = u32::from(end - start) + 1;
        let offset = rand::thread_rng().gen_range(0..span);

        for i in 0..span {
            let port = start + ((offset + i) % span) as u16;
            if allocations.values().any(|a| a.port == port) {
                continue;
            }
            match bind_loopback(port) {
                Ok(listener) => {
                    let allocation = PortAllocation {
                        port,
                        allocated_at: Utc::now(),
                        reservation: Some(listener),
                    };
                    info!(service = %service, port, "Port allocated and reserved");
                    let result = snapshot(service, &allocation);
                    allocations.insert(service, allocation);
                    return Ok(result);
                }
                Err(e) => {
                    debug!(service = %service, port, error = %e, "Port candidate in use");
                }
            }
        }

        warn!(service = %service, start, end, "Port range exhausted");
        Err(ControlError::ResourceExhausted { service, start, end })
    }

    /// Check that the recorded port is still genuinely held.
    ///
    /// If the port can be bound, its holder died: the stale record is dropped
    /// and `false` is returned.
    pub fn validate_allocation(&self, service: ServiceId) -> bool {
        let mut allocations = self.allocations.lock();
        let Some(existing) = allocations.get(&service) else {
            return false;
        };
        if Self::still_held(existing) {
            return true;
        }
        info!(service = %service, port = existing.port, "Cleared stale port allocation");
        allocations.remove(&service);
        false
    }

    fn still_held(allocation: &PortAllocation) -> bool {
        if allocation.reservation.is_some() {
            return true;
        }
        // The probe listener is dropped right away when the bind succeeds
        bind_loopback(allocation.port).is_err()
    }

    /// Close the reservation so the subprocess can bind the port itself.
    ///
    /// The record stays; the port remains assigned to `service`.
    pub fn hand_off(&self, service: ServiceId) -> Option<u16> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations.get_mut(&service)?;
        if allocation.reservation.take().is_some() {
            debug!(service = %service, port = allocation.port, "Reservation handed off");
        }
        Some(allocation.port)
    }

    /// Record an externally managed port (no reservation, no range check)
    pub fn pin(&self, service: ServiceId, port: u16) -> Allocation {
        let mut allocations = self.allocations.lock();
        let allocation = PortAllocation {
            port,
            allocated_at: Utc::now(),
            reservation: None,
        };
        info!(service = %service, port, "Pinned external port");
        let result = snapshot(service, &allocation);
        allocations.insert(service, allocation);
        result
    }

    /// Close any reservation and forget the allocation
    pub fn release(&self, service: ServiceId) {
        if let Some(allocation) = self.allocations.lock().remove(&service) {
            info!(service = %service, port = allocation.port, "Port released");
        }
    }

    pub fn get(&self, service: ServiceId) -> Option<Allocation> {
        self.allocations
            .lock()
            .get(&service)
            .map(|a| snapshot(service, a))
    }

    pub fn port(&self, service: ServiceId) -> Option<u16> {
        self.allocations.lock().get(&service).map(|a| a.port)
    }

    /// All current allocations ordered by service
    pub fn allocations(&self) -> Vec<Allocation> {
        let allocations = self.allocations.lock();
        let mut list: Vec<Allocation> = allocations
            .iter()
            .map(|(service, a)| snapshot(*service, a))
            .collect();
        list.sort_by_key(|a| a.service);
        list
    }
}

fn snapshot(service: ServiceId, allocation: &PortAllocation) -> Allocation {
    Allocation {
        service,
        port: allocation.port,
        allocated_at: allocation.allocated_at,
        reserved: allocation.reservation.is_some(),
    }
}

fn bind_loopback(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}
