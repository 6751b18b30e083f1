use json_patch::{Patch, PatchOperation, ReplaceOperation};
use macpool_core::resources::{
    annotations::{escape_json_pointer, NETWORKS_ANNOTATION},
    labels::is_virt_launcher,
    network_selection::parse_network_selection,
};
use serde_json::Value;

use crate::pool::{owner::OwnerKind, PoolManager};

use super::{assign_addresses, error::MutationError, rollback, InterfaceRequest, MutationRequest};

/// Fills `mac` of every Multus network attachment of a pod that lacks one.
#[derive(Debug, Default)]
pub struct PodMutator;

impl PodMutator {
    pub async fn mutate(
        &self,
        pool: &PoolManager,
        request: &MutationRequest,
    ) -> Result<Option<Patch>, MutationError> {
        let metadata = &request.object.metadata;

        if metadata.labels.as_ref().is_some_and(is_virt_launcher) {
            return Ok(None);
        }

        let Some(raw_networks) = metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(NETWORKS_ANNOTATION))
        else {
            return Ok(None);
        };

        let mut networks =
            parse_network_selection(raw_networks).map_err(MutationError::InvalidNetworks)?;

        let interfaces = networks
            .iter()
            .map(|network| InterfaceRequest {
                owner: request.owner(OwnerKind::Pod, network.interface_id()),
                current: network.parsed_mac(),
            })
            .collect::<Vec<_>>();

        let assigned = assign_addresses(pool, &request.transaction, interfaces).await?;

        if assigned.iter().all(Option::is_none) {
            return Ok(None);
        }

        for (network, address) in networks.iter_mut().zip(assigned) {
            if let Some(address) = address {
                network.mac = Some(address.to_string());
            }
        }

        let serialized = match serde_json::to_string(&networks) {
            Ok(serialized) => serialized,
            Err(err) => {
                rollback(pool, &request.transaction).await;
                return Err(MutationError::InvalidObjectData(
                    format!("{NETWORKS_ANNOTATION} ({err})").into(),
                ));
            }
        };

        Ok(Some(Patch(vec![PatchOperation::Replace(ReplaceOperation {
            path: format!("/metadata/annotations/{}", escape_json_pointer(NETWORKS_ANNOTATION)),
            value: Value::String(serialized),
        })])))
    }
}
