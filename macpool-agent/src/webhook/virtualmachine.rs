use json_patch::{AddOperation, Patch, PatchOperation};
use macpool_core::resources::crd::virtualmachine::VirtualMachineSpec;
use serde_json::{json, Value};

use crate::pool::{owner::OwnerKind, PoolManager};

use super::{assign_addresses, error::MutationError, InterfaceRequest, MutationRequest};

/// Fills `macAddress` of every VirtualMachine interface that lacks one.
#[derive(Debug, Default)]
pub struct VirtualMachineMutator;

impl VirtualMachineMutator {
    pub async fn mutate(
        &self,
        pool: &PoolManager,
        request: &MutationRequest,
    ) -> Result<Option<Patch>, MutationError> {
        let spec: VirtualMachineSpec = serde_json::from_value(
            request
                .object
                .data
                .get("spec")
                .cloned()
                .unwrap_or_else(|| json!({})),
        )
        .map_err(|err| MutationError::InvalidObjectData(format!("spec ({err})").into()))?;

        let interfaces = spec
            .interfaces()
            .iter()
            .map(|interface| InterfaceRequest {
                owner: request.owner(OwnerKind::VirtualMachine, &interface.name),
                current: interface.parsed_mac_address(),
            })
            .collect::<Vec<_>>();

        let operations = assign_addresses(pool, &request.transaction, interfaces)
            .await?
            .into_iter()
            .enumerate()
            .filter_map(|(index, address)| {
                Some(PatchOperation::Add(AddOperation {
                    path: VirtualMachineSpec::mac_address_pointer(index),
                    value: Value::String(address?.to_string()),
                }))
            })
            .collect::<Vec<_>>();

        Ok((!operations.is_empty()).then_some(Patch(operations)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::{
        leadership::LeadershipGate,
        pool::{
            owner::{Owner, OwnerKind},
            table::{AllocationState, TransactionId},
            AllocationError,
        },
        webhook::{
            error::MutationError,
            tests::{pool, request},
        },
    };

    use super::VirtualMachineMutator;

    fn vm(name: &str, interfaces: Value) -> Value {
        json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachine",
            "metadata": { "name": name, "namespace": "default" },
            "spec": {
                "running": true,
                "template": { "spec": { "domain": { "devices": { "interfaces": interfaces } } } }
            }
        })
    }

    #[tokio::test]
    async fn assigns_addresses_only_to_interfaces_without_one() {
        let gate = LeadershipGate::standalone();
        let pool = pool(&gate, "02:00:00:00:00:00", "02:00:00:00:00:0f");
        let request = request(
            "uid-1",
            vm(
                "fedora",
                json!([
                    { "name": "default", "masquerade": {} },
                    { "name": "external", "bridge": {}, "macAddress": "0a:00:00:00:00:01" }
                ]),
            ),
        );

        let patch = VirtualMachineMutator.mutate(&pool, &request).await.unwrap().unwrap();

        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{
                "op": "add",
                "path": "/spec/template/spec/domain/devices/interfaces/0/macAddress",
                "value": "02:00:00:00:00:00"
            }])
        );

        let records = pool.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, AllocationState::Provisional);
        assert_eq!(records[0].transaction, TransactionId::new("uid-1"));
        assert_eq!(
            records[0].owner,
            Owner::new(OwnerKind::VirtualMachine, "default", "fedora", "default")
        );
    }

    #[tokio::test]
    async fn vm_without_interfaces_is_left_alone() {
        let gate = LeadershipGate::standalone();
        let pool = pool(&gate, "02:00:00:00:00:00", "02:00:00:00:00:0f");

        assert!(VirtualMachineMutator
            .mutate(&pool, &request("uid", vm("empty", json!([]))))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn second_interface_failure_rolls_back_the_first() {
        let gate = LeadershipGate::standalone();
        let pool = pool(&gate, "02:00:00:00:00:00", "02:00:00:00:00:01");
        let blocker = Owner::new(OwnerKind::VirtualMachine, "default", "blocker", "default");
        pool.allocate(&TransactionId::new("earlier"), &blocker).await.unwrap();

        let result = VirtualMachineMutator
            .mutate(
                &pool,
                &request(
                    "uid-2",
                    vm("two-nics", json!([{ "name": "default" }, { "name": "br1" }])),
                ),
            )
            .await;

        assert!(matches!(
            result,
            Err(MutationError::Allocation(AllocationError::PoolExhausted))
        ));

        let records = pool.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owner, blocker);
    }

    #[tokio::test]
    async fn explicit_address_of_another_owner_is_denied() {
        let gate = LeadershipGate::standalone();
        let pool = pool(&gate, "02:00:00:00:00:00", "02:00:00:00:00:0f");
        let holder = Owner::new(OwnerKind::VirtualMachine, "default", "holder", "default");
        let taken = "02:00:00:00:00:01".parse().unwrap();
        pool.reserve(&TransactionId::new("earlier"), &holder, taken).await.unwrap();
        pool.confirm(&taken, &holder).await.unwrap();

        let requested = json!([{ "name": "default", "macAddress": "02:00:00:00:00:01" }]);
        let result = VirtualMachineMutator
            .mutate(&pool, &request("uid-3", vm("intruder", requested.clone())))
            .await;

        assert!(matches!(
            result,
            Err(MutationError::Allocation(AllocationError::AddressConflict { .. }))
        ));

        pool.release(&taken, &holder).await.unwrap();

        let patch = VirtualMachineMutator
            .mutate(&pool, &request("uid-4", vm("intruder", requested)))
            .await
            .unwrap();
        let record = pool.snapshot().await.remove(0);

        assert!(patch.is_none());
        assert_eq!(record.state, AllocationState::Provisional);
        assert_eq!(record.owner.name, "intruder");
    }

    #[tokio::test]
    async fn malformed_requested_address_is_denied_without_leftovers() {
        let gate = LeadershipGate::standalone();
        let pool = pool(&gate, "02:00:00:00:00:00", "02:00:00:00:00:0f");

        let result = VirtualMachineMutator
            .mutate(
                &pool,
                &request(
                    "uid-5",
                    vm("broken", json!([{ "name": "default" }, { "name": "br1", "macAddress": "02:00" }])),
                ),
            )
            .await;

        assert!(matches!(result, Err(MutationError::InvalidAddress { .. })));
        assert!(pool.snapshot().await.is_empty());
    }
}
