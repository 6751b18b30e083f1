use backoff::{future::retry_notify, Error as BackoffError};
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::ListParams, Client};
use log::{info, warn};
use macpool_core::{
    kubernetes::{
        operations::{cluster_retry_policy, list_resources, log_retry},
        GetApi,
    },
    mac::MacRange,
    resources::{crd::virtualmachine::VirtualMachine, labels::get_ignored_pods_listparams},
};

use crate::{
    assignments::{pod_assignments, virtual_machine_assignments, Assignment},
    pool::{table::AllocationTable, AllocationError},
};

/// Objects currently on the cluster, as read at startup.
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    pub virtual_machines: Vec<VirtualMachine>,
    pub pods: Vec<Pod>,
}

/// Builds a fresh table holding a confirmed record for every in-range
/// address used by the given objects. Duplicates are reported and skipped.
pub fn seed_allocations(
    range: MacRange,
    snapshot: &ClusterSnapshot,
) -> (AllocationTable, Vec<(Assignment, AllocationError)>) {
    let mut table = AllocationTable::new(range);
    let mut conflicts = Vec::new();
    let now = Utc::now();

    let assignments = snapshot
        .virtual_machines
        .iter()
        .flat_map(|vm| virtual_machine_assignments(vm, &range))
        .chain(
            snapshot
                .pods
                .iter()
                .flat_map(|pod| pod_assignments(pod, &range)),
        );

    for assignment in assignments {
        if let Err(err) = table.seed(assignment.address, &assignment.owner, now) {
            conflicts.push((assignment, err));
        }
    }

    (table, conflicts)
}

/// Reads all Pods and VirtualMachines, retrying until the API answers.
pub async fn read_cluster_snapshot(client: &Client) -> Result<ClusterSnapshot, kube::Error> {
    let vm_api = client.global_api::<VirtualMachine>();
    let pod_api = client.global_api::<Pod>();
    let pod_params = get_ignored_pods_listparams();

    let virtual_machines = retry_notify(
        cluster_retry_policy(),
        || async {
            match list_resources(&vm_api, &ListParams::default()).await {
                Ok(vms) => Ok(Some(vms)),
                Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
                Err(err) => Err(BackoffError::transient(err)),
            }
        },
        log_retry("Listing virtual machines"),
    )
    .await?;

    let pods = retry_notify(
        cluster_retry_policy(),
        || async {
            list_resources(&pod_api, &pod_params)
                .await
                .map_err(BackoffError::transient)
        },
        log_retry("Listing pods"),
    )
    .await?;

    if virtual_machines.is_none() {
        warn!(
            "VirtualMachine API is not served, is KubeVirt installed? \
             VirtualMachine admissions will be denied until it is!"
        );
    }

    Ok(ClusterSnapshot {
        virtual_machines: virtual_machines.unwrap_or_default(),
        pods,
    })
}

pub async fn rebuild_allocations(
    client: &Client,
    range: MacRange,
) -> Result<AllocationTable, kube::Error> {
    info!("Rebuilding address allocations from the cluster...");

    let snapshot = read_cluster_snapshot(client).await?;
    let (table, conflicts) = seed_allocations(range, &snapshot);

    for (assignment, err) in conflicts {
        warn!(
            "{} uses an address that is already taken, it won't be tracked! {err}",
            assignment.owner
        );
    }

    match table.is_empty() {
        true => info!("Address allocations rebuilt, no addresses in use yet!"),
        false => info!("Address allocations rebuilt, {} address(es) in use!", table.len()),
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use macpool_core::{mac::MacRange, resources::crd::virtualmachine::VirtualMachine};
    use serde_json::json;

    use crate::pool::{
        owner::{Owner, OwnerKind},
        table::AllocationState,
    };

    use super::{seed_allocations, ClusterSnapshot};

    fn vm(name: &str, mac: &str) -> VirtualMachine {
        serde_json::from_value(json!({
            "metadata": { "name": name, "namespace": "default" },
            "spec": { "template": { "spec": { "domain": { "devices": { "interfaces": [
                { "name": "default", "macAddress": mac }
            ] } } } } }
        }))
        .unwrap()
    }

    #[test]
    fn rebuild_holds_exactly_the_existing_addresses() {
        let range = MacRange::parse("02:00:00:00:00:00", "02:00:00:00:00:ff").unwrap();
        let snapshot = ClusterSnapshot {
            virtual_machines: vec![vm("first", "02:00:00:00:00:01"), vm("second", "02:00:00:00:00:02")],
            pods: vec![],
        };

        let (table, conflicts) = seed_allocations(range, &snapshot);

        assert!(conflicts.is_empty());
        assert_eq!(table.len(), 2);
        assert!(table.records().all(|record| record.state == AllocationState::Confirmed));
        assert_eq!(
            table.get(&"02:00:00:00:00:01".parse().unwrap()).unwrap().owner,
            Owner::new(OwnerKind::VirtualMachine, "default", "first", "default")
        );
        assert_eq!(
            table.get(&"02:00:00:00:00:02".parse().unwrap()).unwrap().owner,
            Owner::new(OwnerKind::VirtualMachine, "default", "second", "default")
        );
    }

    #[test]
    fn rebuild_reports_duplicates() {
        let range = MacRange::parse("02:00:00:00:00:00", "02:00:00:00:00:ff").unwrap();
        let snapshot = ClusterSnapshot {
            virtual_machines: vec![vm("first", "02:00:00:00:00:01"), vm("copy", "02:00:00:00:00:01")],
            ..Default::default()
        };

        let (table, conflicts) = seed_allocations(range, &snapshot);

        assert_eq!(table.len(), 1);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].0.owner.name, "copy");
    }
}
