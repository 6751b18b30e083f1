use kube::core::{admission::AdmissionRequest, DynamicObject};
use log::warn;
use macpool_core::mac::{MacAddress, MacError};

use crate::pool::{
    owner::{Owner, OwnerKind},
    table::TransactionId,
    PoolManager,
};

use self::error::MutationError;

pub mod dispatcher;
pub mod error;
pub mod namespaces;
pub mod pod;
pub mod virtualmachine;

/// The parts of an admission request the mutation handlers work with.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub transaction: TransactionId,
    pub namespace: String,
    /// `generateName` prefix when `generated_name` is set
    pub name: String,
    pub generated_name: bool,
    pub object: DynamicObject,
    pub dry_run: bool,
}

impl MutationRequest {
    pub fn from_admission(request: &AdmissionRequest<DynamicObject>) -> Result<Self, MutationError> {
        let object = request.object.clone().ok_or(MutationError::MissingObject)?;
        let namespace = request
            .namespace
            .clone()
            .or_else(|| object.metadata.namespace.clone())
            .unwrap_or_default();

        let name = object
            .metadata
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| Some(request.name.clone()).filter(|name| !name.is_empty()));

        let (name, generated_name) = match name {
            Some(name) => (name, false),
            None => (
                object
                    .metadata
                    .generate_name
                    .clone()
                    .ok_or(MutationError::InvalidObjectData("metadata.name".into()))?,
                true,
            ),
        };

        Ok(Self {
            transaction: TransactionId::new(request.uid.clone()),
            namespace,
            name,
            generated_name,
            object,
            dry_run: request.dry_run,
        })
    }

    pub fn owner(&self, kind: OwnerKind, interface: impl Into<String>) -> Owner {
        match self.generated_name {
            true => Owner::with_generated_name(kind, &self.namespace, &self.name, interface),
            false => Owner::new(kind, &self.namespace, &self.name, interface),
        }
    }
}

/// One interface of the admitted object and the address it currently carries.
#[derive(Debug)]
pub struct InterfaceRequest {
    pub owner: Owner,
    pub current: Option<Result<MacAddress, MacError>>,
}

/// Allocates or reserves an address for every interface within one
/// transaction. The result holds, per interface, the address to write into
/// the object, `None` where the object is left as is. On failure everything
/// allocated so far is rolled back.
pub async fn assign_addresses(
    pool: &PoolManager,
    transaction: &TransactionId,
    interfaces: Vec<InterfaceRequest>,
) -> Result<Vec<Option<MacAddress>>, MutationError> {
    let range = pool.range().await;
    let mut assigned = Vec::with_capacity(interfaces.len());

    for interface in interfaces {
        let owner = interface.owner;
        let result = match interface.current {
            None => pool.allocate(transaction, &owner).await.map(Some).map_err(MutationError::from),
            Some(Ok(address)) if range.contains(&address) => pool
                .reserve(transaction, &owner, address)
                .await
                .map(|_| None)
                .map_err(MutationError::from),
            // addresses outside the managed range aren't tracked
            Some(Ok(_)) => Ok(None),
            Some(Err(source)) => Err(MutationError::InvalidAddress {
                interface: owner.interface.clone(),
                source,
            }),
        };

        match result {
            Ok(address) => assigned.push(address),
            Err(err) => {
                rollback(pool, transaction).await;
                return Err(err);
            }
        }
    }

    Ok(assigned)
}

pub async fn rollback(pool: &PoolManager, transaction: &TransactionId) {
    if let Err(err) = pool.rollback_transaction(transaction).await {
        warn!("Couldn't roll back transaction {transaction}! {err}");
    }
}
