use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use macpool_core::mac::{MacAddress, MacRange};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::leadership::Epoch;

use self::{
    owner::{Owner, OwnerKind},
    table::{AllocationRecord, AllocationTable, TransactionId},
};

pub mod owner;
pub mod table;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("The MAC address range is exhausted!")]
    PoolExhausted,
    #[error("Address {} is already allocated to {}!", .address, .holder)]
    AddressConflict { address: MacAddress, holder: Owner },
    #[error("Address {} is out of range!", .0)]
    AddressOutOfRange(MacAddress),
    #[error("Address {} isn't allocated!", .0)]
    NotFound(MacAddress),
    #[error("Address {} belongs to {}!", .address, .holder)]
    OwnerMismatch { address: MacAddress, holder: Owner },
    #[error("This replica is no longer the active allocator!")]
    StaleEpoch,
}

/// Allocation table of a single leadership epoch.
///
/// All operations take the same lock for the duration of the table mutation
/// only. Once the epoch it was built for ends, every mutating call fails with
/// [`AllocationError::StaleEpoch`]; a new leader builds a new manager.
#[derive(Debug)]
pub struct PoolManager {
    table: Mutex<AllocationTable>,
    epoch: Epoch,
}

impl PoolManager {
    pub fn new(table: AllocationTable, epoch: Epoch) -> Self {
        Self {
            table: Mutex::new(table),
            epoch,
        }
    }

    pub fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    pub async fn range(&self) -> MacRange {
        *self.table.lock().await.range()
    }

    pub async fn allocate(
        &self,
        transaction: &TransactionId,
        owner: &Owner,
    ) -> Result<MacAddress, AllocationError> {
        self.ensure_current()?;

        let address = self
            .table
            .lock()
            .await
            .allocate(transaction, owner, Utc::now())?;

        info!("Allocated {address} address for {owner}!");

        Ok(address)
    }

    pub async fn reserve(
        &self,
        transaction: &TransactionId,
        owner: &Owner,
        address: MacAddress,
    ) -> Result<(), AllocationError> {
        self.ensure_current()?;

        let inserted = self
            .table
            .lock()
            .await
            .reserve(transaction, owner, address, Utc::now())?;

        if inserted {
            info!("Reserved requested {address} address for {owner}!");
        }

        Ok(())
    }

    pub async fn confirm(&self, address: &MacAddress, owner: &Owner) -> Result<(), AllocationError> {
        self.ensure_current()?;
        self.table.lock().await.confirm(address, owner)?;

        debug!("Confirmed {address} address of {owner}.");

        Ok(())
    }

    /// Releasing an address that isn't allocated is not an error.
    pub async fn release(&self, address: &MacAddress, owner: &Owner) -> Result<(), AllocationError> {
        self.ensure_current()?;

        match self.table.lock().await.release(address, owner)? {
            Some(_) => info!("Released {address} address of {owner}!"),
            None => debug!("Address {address} was already released."),
        }

        Ok(())
    }

    pub async fn rollback_transaction(
        &self,
        transaction: &TransactionId,
    ) -> Result<Vec<MacAddress>, AllocationError> {
        self.ensure_current()?;

        let released = self.table.lock().await.rollback(transaction);

        for address in &released {
            info!("Rolled back {address} address (transaction {transaction})!");
        }

        Ok(released)
    }

    /// Drops provisional records that are older than `wait_time` at `now`.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        wait_time: Duration,
    ) -> Result<Vec<AllocationRecord>, AllocationError> {
        self.ensure_current()?;

        let cutoff = now.checked_sub_signed(wait_time).unwrap_or(DateTime::<Utc>::MIN_UTC);

        Ok(self.table.lock().await.sweep(cutoff))
    }

    pub async fn seed(&self, address: MacAddress, owner: &Owner) -> Result<(), AllocationError> {
        self.ensure_current()?;
        self.table.lock().await.seed(address, owner, Utc::now())?;

        info!("Adopted {address} address already used by {owner}!");

        Ok(())
    }

    pub async fn release_missing(
        &self,
        kind: OwnerKind,
        namespace: &str,
        name: &str,
        keep: &HashSet<MacAddress>,
    ) -> Result<Vec<MacAddress>, AllocationError> {
        self.ensure_current()?;

        let released = self
            .table
            .lock()
            .await
            .release_missing(kind, namespace, name, keep);

        for address in &released {
            info!("Released {address} address no longer used by {kind} '{name}' in '{namespace}' namespace!");
        }

        Ok(released)
    }

    pub async fn retain_objects(
        &self,
        kind: OwnerKind,
        live: &HashSet<(String, String)>,
    ) -> Result<Vec<MacAddress>, AllocationError> {
        self.ensure_current()?;

        let released = self.table.lock().await.retain_objects(kind, live);

        for address in &released {
            warn!("Released {address} address of a {kind} that disappeared from the cluster!");
        }

        Ok(released)
    }

    pub async fn snapshot(&self) -> Vec<AllocationRecord> {
        self.table.lock().await.records().cloned().collect()
    }

    fn ensure_current(&self) -> Result<(), AllocationError> {
        match self.epoch.is_current() {
            true => Ok(()),
            false => Err(AllocationError::StaleEpoch),
        }
    }
}
