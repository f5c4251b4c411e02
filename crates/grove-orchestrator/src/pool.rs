use grove_core::{GroveError, GroveResult};
use grove_worktree::{IsolatedCheckout, IsolationProvider};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Occupancy of one context slot.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Occupancy {
    Free,
    /// Held, optionally by a known agent handle.
    Held(Option<Uuid>),
}

struct SlotEntry {
    occupancy: Occupancy,
    /// The isolated checkout this slot is bound to, once bound.
    binding: Option<IsolatedCheckout>,
}

/// Fixed-capacity pool of context slots.
///
/// The slot table is an explicit arena owned by this pool; there is no
/// process-wide registry. Free slot ids travel through a channel, so
/// acquisition suspends cooperatively and is FIFO-fair among waiters: the
/// receiver sits behind a queue-fair async mutex and each freed slot goes
/// to the longest-waiting caller.
pub struct ContextPool {
    capacity: usize,
    slots: Mutex<HashMap<Uuid, SlotEntry>>,
    free_tx: mpsc::Sender<Uuid>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<Uuid>>,
}

impl ContextPool {
    /// Creates a pool with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (free_tx, free_rx) = mpsc::channel(capacity);
        let mut slots = HashMap::with_capacity(capacity);
        for _ in 0..capacity {
            let id = Uuid::new_v4();
            slots.insert(
                id,
                SlotEntry {
                    occupancy: Occupancy::Free,
                    binding: None,
                },
            );
            // Channel capacity equals slot count; these sends cannot fail.
            let _ = free_tx.try_send(id);
        }
        Self {
            capacity,
            slots: Mutex::new(slots),
            free_tx,
            free_rx: tokio::sync::Mutex::new(free_rx),
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn held_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| matches!(s.occupancy, Occupancy::Held(_)))
            .count()
    }

    /// Waits for a free slot, suspending cooperatively until one is
    /// available or `timeout` elapses.
    pub async fn acquire(&self, timeout: Duration) -> GroveResult<Uuid> {
        // The timeout covers both the wait for the receiver (queue-fair, so
        // waiters line up in request order) and the wait for a free slot.
        let slot = tokio::time::timeout(timeout, async {
            let mut rx = self.free_rx.lock().await;
            rx.recv().await
        })
        .await
        .map_err(|_| GroveError::AcquireTimeout(timeout.as_millis() as u64))?
        .ok_or_else(|| GroveError::AcquireTimeout(timeout.as_millis() as u64))?;

        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(&slot) {
            entry.occupancy = Occupancy::Held(None);
        }
        debug!(slot = %slot, "slot acquired");
        Ok(slot)
    }

    /// Returns a slot to the free pool. Releasing a slot that is not held
    /// fails with [`GroveError::DoubleRelease`] and changes nothing.
    pub fn release(&self, slot: Uuid) -> GroveResult<()> {
        {
            let mut slots = self.slots.lock();
            let entry = slots
                .get_mut(&slot)
                .ok_or(GroveError::DoubleRelease(slot))?;
            if entry.occupancy == Occupancy::Free {
                return Err(GroveError::DoubleRelease(slot));
            }
            entry.occupancy = Occupancy::Free;
        }
        // Capacity bounds outstanding ids, so this send cannot block.
        let _ = self.free_tx.try_send(slot);
        debug!(slot = %slot, "slot released");
        Ok(())
    }

    /// Binds a held slot to a fresh isolated checkout.
    ///
    /// On the provider's failure the slot is returned to the free pool so a
    /// later dispatch can retry, and [`GroveError::IsolationCreate`] is
    /// surfaced to the caller.
    pub async fn bind(
        &self,
        slot: Uuid,
        name: &str,
        branch_ref: &str,
        provider: &dyn IsolationProvider,
    ) -> GroveResult<IsolatedCheckout> {
        {
            let slots = self.slots.lock();
            let entry = slots
                .get(&slot)
                .ok_or_else(|| GroveError::Session(format!("unknown slot {slot}")))?;
            if entry.occupancy == Occupancy::Free {
                return Err(GroveError::Session(format!("bind of free slot {slot}")));
            }
        }

        match provider.create_isolated(name, branch_ref).await {
            Ok(checkout) => {
                let mut slots = self.slots.lock();
                if let Some(entry) = slots.get_mut(&slot) {
                    entry.binding = Some(checkout.clone());
                }
                info!(slot = %slot, checkout = %checkout.name, "slot bound");
                Ok(checkout)
            }
            Err(e) => {
                // Leave the slot usable for a retry by a later dispatch.
                let _ = self.release(slot);
                Err(GroveError::IsolationCreate(e.to_string()))
            }
        }
    }

    /// Records which agent handle holds the slot.
    pub fn set_holder(&self, slot: Uuid, handle_id: Uuid) -> GroveResult<()> {
        let mut slots = self.slots.lock();
        let entry = slots
            .get_mut(&slot)
            .ok_or_else(|| GroveError::Session(format!("unknown slot {slot}")))?;
        match entry.occupancy {
            Occupancy::Free => Err(GroveError::Session(format!(
                "cannot assign holder to free slot {slot}"
            ))),
            Occupancy::Held(_) => {
                entry.occupancy = Occupancy::Held(Some(handle_id));
                Ok(())
            }
        }
    }

    /// The agent handle currently holding a slot, once assigned.
    pub fn holder(&self, slot: Uuid) -> Option<Uuid> {
        match self.slots.lock().get(&slot).map(|s| s.occupancy.clone()) {
            Some(Occupancy::Held(holder)) => holder,
            _ => None,
        }
    }

    /// The checkout a slot is bound to, if any.
    pub fn binding(&self, slot: Uuid) -> Option<IsolatedCheckout> {
        self.slots.lock().get(&slot).and_then(|s| s.binding.clone())
    }

    /// Every bound checkout in the pool, for shutdown cleanup.
    pub fn bindings(&self) -> Vec<(Uuid, IsolatedCheckout)> {
        self.slots
            .lock()
            .iter()
            .filter_map(|(id, entry)| entry.binding.clone().map(|b| (*id, b)))
            .collect()
    }
}
