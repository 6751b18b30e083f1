use std::sync::Arc;

use json_patch::Patch;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    DynamicObject,
};
use log::{debug, info, warn};
use macpool_core::resources::labels::{POD_OPT_OUT_LABEL, VIRTUAL_MACHINE_OPT_OUT_LABEL};

use crate::{
    pool::{table::TransactionId, AllocationError, PoolManager},
    watchers::WatchSync,
};

use super::{
    error::MutationError, namespaces::NamespaceFilter, pod::PodMutator, rollback,
    virtualmachine::VirtualMachineMutator, MutationRequest,
};

const POD_KIND: &str = "Pod";
const VIRTUAL_MACHINE_KIND: &str = "VirtualMachine";

/// Routes admission requests to the handler of their resource kind and turns
/// the outcome into an admission response.
pub struct Dispatcher {
    pool: Arc<PoolManager>,
    namespaces: NamespaceFilter,
    pods: PodMutator,
    virtual_machines: VirtualMachineMutator,
    /// VirtualMachines are only mutated once their watcher listed them
    virtual_machines_sync: WatchSync,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<PoolManager>,
        namespaces: NamespaceFilter,
        virtual_machines_sync: WatchSync,
    ) -> Self {
        Self {
            pool,
            namespaces,
            pods: PodMutator,
            virtual_machines: VirtualMachineMutator,
            virtual_machines_sync,
        }
    }

    pub async fn review(&self, review: AdmissionReview<DynamicObject>) -> AdmissionReview<DynamicObject> {
        let request: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(request) => request,
            Err(err) => {
                warn!("Received an invalid admission review! {err}");
                return AdmissionResponse::invalid(err.to_string()).into_review();
            }
        };

        let response = match self.mutate(&request).await {
            Ok(None) => AdmissionResponse::from(&request),
            Ok(Some(patch)) => match AdmissionResponse::from(&request).with_patch(patch) {
                Ok(response) => response,
                Err(err) => {
                    rollback(&self.pool, &TransactionId::new(request.uid.clone())).await;
                    AdmissionResponse::from(&request).deny(format!("Couldn't serialize the patch! {err}"))
                }
            },
            Err(err) => {
                warn!(
                    "Denied {} {}/{}! {err}",
                    request.kind.kind,
                    request.namespace.as_deref().unwrap_or_default(),
                    request.name
                );
                AdmissionResponse::from(&request).deny(err.to_string())
            }
        };

        response.into_review()
    }

    pub async fn mutate(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<Option<Patch>, MutationError> {
        if !matches!(request.operation, Operation::Create | Operation::Update) {
            return Ok(None);
        }

        if !self.pool.epoch().is_current() {
            return Err(AllocationError::StaleEpoch.into());
        }

        let opt_out_label = match request.kind.kind.as_str() {
            POD_KIND => POD_OPT_OUT_LABEL,
            VIRTUAL_MACHINE_KIND => VIRTUAL_MACHINE_OPT_OUT_LABEL,
            other => return Err(MutationError::UnsupportedKind(other.to_owned())),
        };

        // unconfirmed records would be swept and their addresses handed out again
        if request.kind.kind == VIRTUAL_MACHINE_KIND && !self.virtual_machines_sync.is_synced() {
            return Err(MutationError::VirtualMachinesNotTracked);
        }

        let mutation = MutationRequest::from_admission(request)?;

        if self.namespaces.is_opted_out(&mutation.namespace, opt_out_label) {
            debug!(
                "Namespace {} opted out of {} mutation, skipping...",
                mutation.namespace, request.kind.kind
            );
            return Ok(None);
        }

        let patch = match request.kind.kind.as_str() {
            POD_KIND => self.pods.mutate(&self.pool, &mutation).await?,
            _ => self.virtual_machines.mutate(&self.pool, &mutation).await?,
        };

        if mutation.dry_run {
            rollback(&self.pool, &mutation.transaction).await;
        } else if patch.is_some() {
            info!(
                "Assigned addresses to {} {}/{} (transaction {})!",
                request.kind.kind, mutation.namespace, mutation.name, mutation.transaction
            );
        }

        Ok(patch)
    }
}
