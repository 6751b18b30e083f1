use std::borrow::Cow;

use macpool_core::{mac::MacError, resources::network_selection::NetworkSelectionError};
use thiserror::Error;

use crate::pool::AllocationError;

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Admission request carries no object!")]
    MissingObject,
    #[error("'{}' resource contains invalid data!", .0)]
    InvalidObjectData(Cow<'static, str>),
    #[error("Interface '{}' requests an invalid MAC address! {}", .interface, .source)]
    InvalidAddress { interface: String, source: MacError },
    #[error("Pod networks annotation is invalid! {}", .0)]
    InvalidNetworks(NetworkSelectionError),
    #[error("Couldn't assign a MAC address! {}", .0)]
    Allocation(AllocationError),
    #[error("Unsupported resource kind '{}'!", .0)]
    UnsupportedKind(String),
    #[error("VirtualMachines aren't tracked yet, their API isn't served or is still being listed!")]
    VirtualMachinesNotTracked,
}

impl From<AllocationError> for MutationError {
    fn from(value: AllocationError) -> Self {
        Self::Allocation(value)
    }
}
