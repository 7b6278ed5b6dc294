//! Resource offers and the per-match capacity ledger.
//!
//! An [`Offer`] is immutable as received from the resource manager. While a
//! batch of pending slots is matched against it, an [`OfferWrapper`] tracks
//! how much has been claimed so far. `reserve` is the only way to claim
//! capacity and it re-checks the remaining amounts, so `used <= total`
//! holds on every dimension no matter what the caller matched beforehand.

use std::collections::BTreeMap;

use berth_id::{AgentId, OfferId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inclusive range of host ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(begin: u16, end: u16) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> usize {
        if self.end < self.begin {
            0
        } else {
            usize::from(self.end - self.begin) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A time-boxed grant of resources from one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    #[serde(default)]
    pub ports: Vec<PortRange>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Offer {
    /// Total number of distinct host ports on offer.
    pub fn port_count(&self) -> usize {
        self.ports.iter().map(PortRange::len).sum()
    }
}

/// Amounts a slot asks for.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceClaim {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub ports: usize,
}

/// Reservation failures. Each one means the offer is left untouched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AllocError {
    #[error("insufficient {resource}: requested {requested}, remaining {remaining}")]
    Insufficient {
        resource: &'static str,
        requested: f64,
        remaining: f64,
    },

    #[error("slot {0} is not waiting for an offer")]
    NotPending(String),

    #[error("slot {0} has no current task")]
    NoTask(String),
}

/// An offer plus the capacity already claimed from it in this round.
#[derive(Debug, Clone)]
pub struct OfferWrapper {
    offer: Offer,
    cpus_used: f64,
    mem_used: f64,
    disk_used: f64,
    port_used_size: usize,
}

impl OfferWrapper {
    pub fn new(offer: Offer) -> Self {
        Self {
            offer,
            cpus_used: 0.0,
            mem_used: 0.0,
            disk_used: 0.0,
            port_used_size: 0,
        }
    }

    pub fn offer(&self) -> &Offer {
        &self.offer
    }

    pub fn cpus_used(&self) -> f64 {
        self.cpus_used
    }

    pub fn mem_used(&self) -> f64 {
        self.mem_used
    }

    pub fn disk_used(&self) -> f64 {
        self.disk_used
    }

    pub fn port_used_size(&self) -> usize {
        self.port_used_size
    }

    pub fn cpus_remain(&self) -> f64 {
        self.offer.cpus - self.cpus_used
    }

    pub fn mem_remain(&self) -> f64 {
        self.offer.mem - self.mem_used
    }

    pub fn disk_remain(&self) -> f64 {
        self.offer.disk - self.disk_used
    }

    pub fn ports_remain(&self) -> usize {
        self.offer.port_count().saturating_sub(self.port_used_size)
    }

    /// Returns the first dimension that cannot satisfy `claim`, if any.
    pub fn shortfall(&self, claim: &ResourceClaim) -> Option<AllocError> {
        // Compared as `used + requested` so the sum stored by `reserve` is
        // exactly the value checked against the total.
        let checks = [
            ("cpus", claim.cpus, self.cpus_used, self.offer.cpus),
            ("mem", claim.mem, self.mem_used, self.offer.mem),
            ("disk", claim.disk, self.disk_used, self.offer.disk),
            (
                "ports",
                claim.ports as f64,
                self.port_used_size as f64,
                self.offer.port_count() as f64,
            ),
        ];
        checks
            .into_iter()
            .find(|(_, requested, used, total)| used + requested > *total)
            .map(|(resource, requested, used, total)| AllocError::Insufficient {
                resource,
                requested,
                remaining: total - used,
            })
    }

    pub fn fits(&self, claim: &ResourceClaim) -> bool {
        self.shortfall(claim).is_none()
    }

    /// Claims `claim` from the offer and returns the host ports assigned.
    ///
    /// Ports are handed out in range order starting after the ones already
    /// claimed. Nothing is modified on error.
    pub fn reserve(&mut self, claim: &ResourceClaim) -> Result<Vec<u16>, AllocError> {
        if let Some(err) = self.shortfall(claim) {
            return Err(err);
        }

        let ports: Vec<u16> = self
            .offer
            .ports
            .iter()
            .flat_map(|range| range.begin..=range.end)
            .skip(self.port_used_size)
            .take(claim.ports)
            .collect();

        self.cpus_used += claim.cpus;
        self.mem_used += claim.mem;
        self.disk_used += claim.disk;
        self.port_used_size += ports.len();

        Ok(ports)
    }
}
