//! Registry of in-flight transfers
//!
//! Owned by the I/O thread; nothing else ever sees a [`Transfer`] while the
//! kernel holds its request, so there is no locking here.

use std::collections::HashMap;

use crate::kernel::TransferId;
use crate::transfer::Transfer;

#[derive(Debug, Default)]
pub struct TransferRegistry {
    next_id: u64,
    transfers: HashMap<TransferId, Transfer>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer and assign its id
    pub fn insert(&mut self, transfer: Transfer) -> TransferId {
        self.next_id += 1;
        let id = TransferId(self.next_id);
        self.transfers.insert(id, transfer);
        id
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        self.transfers.get_mut(&id)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.transfers.contains_key(&id)
    }

    /// Remove a transfer the kernel just finished with
    ///
    /// # Panics
    ///
    /// If `id` is not registered. The kernel only ever hands back requests
    /// the engine submitted, so an unknown id is an engine bug.
    pub fn complete_and_remove(&mut self, id: TransferId) -> Transfer {
        match self.transfers.remove(&id) {
            Some(transfer) => transfer,
            None => panic!("completion for unregistered transfer {}", id),
        }
    }

    /// Remove a transfer if it is still registered
    pub fn take(&mut self, id: TransferId) -> Option<Transfer> {
        self.transfers.remove(&id)
    }

    /// Remove every transfer, oldest first
    pub fn cancel_all(&mut self) -> Vec<Transfer> {
        let mut drained: Vec<(TransferId, Transfer)> = self.transfers.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, transfer)| transfer).collect()
    }

    /// Registered ids, oldest first
    pub fn ids(&self) -> Vec<TransferId> {
        let mut ids: Vec<TransferId> = self.transfers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}
