//! Pending-placement queue and reservation bookkeeping.
//!
//! The allocator does not look at slots itself. It remembers which slots
//! wait for an offer (FIFO, each slot at most once) and which offer each
//! placed slot was reserved on. Matching walks [`OfferAllocator::pending_slots`]
//! in queue order from the scheduler core, where the slots live.

use std::collections::{HashMap, HashSet, VecDeque};

use berth_id::{AgentId, OfferId, SlotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::offer::{Offer, ResourceClaim};

/// Where a slot's current task was reserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferInfo {
    pub offer_id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub reserved_at: DateTime<Utc>,
}

impl OfferInfo {
    pub fn new(offer: &Offer, claim: &ResourceClaim) -> Self {
        Self {
            offer_id: offer.id.clone(),
            agent_id: offer.agent_id.clone(),
            hostname: offer.hostname.clone(),
            cpus: claim.cpus,
            mem: claim.mem,
            disk: claim.disk,
            reserved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct OfferAllocator {
    pending: VecDeque<SlotId>,
    queued: HashSet<SlotId>,
    by_slot_id: HashMap<SlotId, OfferInfo>,
}

impl OfferAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `slot_id` for placement. Returns `false` if it was already
    /// queued.
    pub fn put_slot_back_to_pending_queue(&mut self, slot_id: SlotId) -> bool {
        if !self.queued.insert(slot_id.clone()) {
            return false;
        }
        self.pending.push_back(slot_id);
        true
    }

    pub fn remove_from_pending_queue(&mut self, slot_id: &SlotId) -> bool {
        if !self.queued.remove(slot_id) {
            return false;
        }
        self.pending.retain(|queued| queued != slot_id);
        true
    }

    pub fn is_pending(&self, slot_id: &SlotId) -> bool {
        self.queued.contains(slot_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of the queue in placement order.
    pub fn pending_slots(&self) -> Vec<SlotId> {
        self.pending.iter().cloned().collect()
    }

    pub fn record_reservation(&mut self, slot_id: SlotId, info: OfferInfo) -> Option<OfferInfo> {
        self.by_slot_id.insert(slot_id, info)
    }

    pub fn release(&mut self, slot_id: &SlotId) -> Option<OfferInfo> {
        self.by_slot_id.remove(slot_id)
    }

    pub fn reservation(&self, slot_id: &SlotId) -> Option<&OfferInfo> {
        self.by_slot_id.get(slot_id)
    }

    pub fn reservation_count(&self) -> usize {
        self.by_slot_id.len()
    }

    /// Slots holding a reservation on `offer_id`.
    pub fn slots_on_offer(&self, offer_id: &OfferId) -> Vec<SlotId> {
        let mut slots: Vec<SlotId> = self
            .by_slot_id
            .iter()
            .filter(|(_, info)| &info.offer_id == offer_id)
            .map(|(slot_id, _)| slot_id.clone())
            .collect();
        slots.sort();
        slots
    }

    /// Replaces the reservation map with state loaded at startup.
    pub fn restore(&mut self, reservations: HashMap<SlotId, OfferInfo>) {
        self.by_slot_id = reservations;
    }

    /// Drops every trace of `slot_id`.
    pub fn forget(&mut self, slot_id: &SlotId) {
        self.remove_from_pending_queue(slot_id);
        self.by_slot_id.remove(slot_id);
    }
}
