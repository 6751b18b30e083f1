use std::{
    collections::{HashMap, HashSet},
    fmt::{Display, Formatter},
};

use chrono::{DateTime, Utc};
use macpool_core::mac::{MacAddress, MacRange};

use super::{
    owner::{Owner, OwnerKind},
    AllocationError,
};

/// Correlates every address allocated while handling one admission request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Used for records seeded from objects that already exist on the cluster.
    pub fn seed() -> Self {
        Self("seed".to_owned())
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Provisional,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: MacAddress,
    pub owner: Owner,
    pub state: AllocationState,
    pub allocated_at: DateTime<Utc>,
    pub transaction: TransactionId,
}

/// Address → record map for a single range. At most one record exists per
/// address and every recorded address lies within the range.
#[derive(Debug)]
pub struct AllocationTable {
    range: MacRange,
    records: HashMap<MacAddress, AllocationRecord>,
    /// where the next free address scan starts
    cursor: MacAddress,
}

impl AllocationTable {
    pub fn new(range: MacRange) -> Self {
        Self {
            range,
            records: HashMap::new(),
            cursor: range.start(),
        }
    }

    pub fn range(&self) -> &MacRange {
        &self.range
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, address: &MacAddress) -> Option<&AllocationRecord> {
        self.records.get(address)
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.values()
    }

    pub fn allocate(
        &mut self,
        transaction: &TransactionId,
        owner: &Owner,
        now: DateTime<Utc>,
    ) -> Result<MacAddress, AllocationError> {
        if self.records.len() as u64 >= self.range.size() {
            return Err(AllocationError::PoolExhausted);
        }

        let address = self
            .range
            .iter_from(self.cursor)
            .find(|candidate| !self.records.contains_key(candidate))
            .ok_or(AllocationError::PoolExhausted)?;

        // the successor of the allocated address, wrapping to the start
        self.cursor = self.range.iter_from(address).nth(1).unwrap_or(address);
        self.insert_provisional(address, transaction, owner, now);

        Ok(address)
    }

    /// Records an address requested explicitly by the object. An address
    /// already held by the same object is accepted without a new record.
    pub fn reserve(
        &mut self,
        transaction: &TransactionId,
        owner: &Owner,
        address: MacAddress,
        now: DateTime<Utc>,
    ) -> Result<bool, AllocationError> {
        if !self.range.contains(&address) {
            return Err(AllocationError::AddressOutOfRange(address));
        }

        match self.records.get(&address) {
            Some(record) if record.owner.same_object(owner) => Ok(false),
            Some(record) => Err(AllocationError::AddressConflict {
                address,
                holder: record.owner.clone(),
            }),
            None => {
                self.insert_provisional(address, transaction, owner, now);
                Ok(true)
            }
        }
    }

    pub fn confirm(&mut self, address: &MacAddress, owner: &Owner) -> Result<(), AllocationError> {
        let record = self
            .records
            .get_mut(address)
            .ok_or(AllocationError::NotFound(*address))?;

        if !record.owner.matches(owner) {
            return Err(AllocationError::OwnerMismatch {
                address: *address,
                holder: record.owner.clone(),
            });
        }

        record.state = AllocationState::Confirmed;

        if record.owner.generated_name && !owner.generated_name {
            record.owner = owner.clone();
        }

        Ok(())
    }

    /// Returns the removed record, `None` if there was nothing to release.
    pub fn release(
        &mut self,
        address: &MacAddress,
        owner: &Owner,
    ) -> Result<Option<AllocationRecord>, AllocationError> {
        match self.records.get(address) {
            None => Ok(None),
            Some(record) if !record.owner.matches(owner) => Err(AllocationError::OwnerMismatch {
                address: *address,
                holder: record.owner.clone(),
            }),
            Some(_) => Ok(self.records.remove(address)),
        }
    }

    pub fn rollback(&mut self, transaction: &TransactionId) -> Vec<MacAddress> {
        self.remove_where(|record| {
            record.state == AllocationState::Provisional && &record.transaction == transaction
        })
    }

    /// Removes provisional records allocated at or before `cutoff`.
    pub fn sweep(&mut self, cutoff: DateTime<Utc>) -> Vec<AllocationRecord> {
        let expired = self
            .records
            .values()
            .filter(|record| {
                record.state == AllocationState::Provisional && record.allocated_at <= cutoff
            })
            .map(|record| record.address)
            .collect::<Vec<_>>();

        expired
            .iter()
            .filter_map(|address| self.records.remove(address))
            .collect()
    }

    /// Inserts a confirmed record for an address an existing object already uses.
    pub fn seed(
        &mut self,
        address: MacAddress,
        owner: &Owner,
        now: DateTime<Utc>,
    ) -> Result<(), AllocationError> {
        if !self.range.contains(&address) {
            return Err(AllocationError::AddressOutOfRange(address));
        }

        if let Some(record) = self.records.get(&address) {
            return Err(AllocationError::AddressConflict {
                address,
                holder: record.owner.clone(),
            });
        }

        self.records.insert(
            address,
            AllocationRecord {
                address,
                owner: owner.clone(),
                state: AllocationState::Confirmed,
                allocated_at: now,
                transaction: TransactionId::seed(),
            },
        );

        Ok(())
    }

    /// Releases confirmed addresses of one object that it no longer uses.
    pub fn release_missing(
        &mut self,
        kind: OwnerKind,
        namespace: &str,
        name: &str,
        keep: &HashSet<MacAddress>,
    ) -> Vec<MacAddress> {
        self.remove_where(|record| {
            record.state == AllocationState::Confirmed
                && record.owner.is_object(kind, namespace, name)
                && !keep.contains(&record.address)
        })
    }

    /// Releases confirmed addresses of `kind` objects missing from `live`
    /// (namespace, name) pairs.
    pub fn retain_objects(
        &mut self,
        kind: OwnerKind,
        live: &HashSet<(String, String)>,
    ) -> Vec<MacAddress> {
        self.remove_where(|record| {
            record.state == AllocationState::Confirmed
                && record.owner.kind == kind
                && !live.contains(&(record.owner.namespace.clone(), record.owner.name.clone()))
        })
    }

    fn insert_provisional(
        &mut self,
        address: MacAddress,
        transaction: &TransactionId,
        owner: &Owner,
        now: DateTime<Utc>,
    ) {
        self.records.insert(
            address,
            AllocationRecord {
                address,
                owner: owner.clone(),
                state: AllocationState::Provisional,
                allocated_at: now,
                transaction: transaction.clone(),
            },
        );
    }

    fn remove_where(&mut self, predicate: impl Fn(&AllocationRecord) -> bool) -> Vec<MacAddress> {
        let matching = self
            .records
            .values()
            .filter(|record| predicate(record))
            .map(|record| record.address)
            .collect::<Vec<_>>();

        for address in &matching {
            self.records.remove(address);
        }

        matching
    }
}
