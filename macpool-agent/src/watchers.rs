use std::{
    collections::HashSet,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use backoff::{future::retry_notify, Error as BackoffError};
use futures::StreamExt;
use k8s_openapi::{api::core::v1::Pod, serde::de::DeserializeOwned};
use kube::{
    api::ListParams,
    runtime::{
        watcher::{default_backoff, watcher, Config, Event},
        WatchStreamExt,
    },
    Api, Client, Resource, ResourceExt,
};
use log::{info, warn};
use macpool_core::{
    helpers::pretty_type_name,
    kubernetes::{
        operations::{cluster_retry_policy, log_retry},
        GetApi,
    },
    mac::{MacAddress, MacRange},
    resources::{crd::virtualmachine::VirtualMachine, labels::get_tracked_pods_selector},
};

use crate::{
    assignments::{pod_assignments, virtual_machine_assignments, Assignment},
    pool::{owner::OwnerKind, AllocationError, PoolManager},
};

type Extractor<K> = fn(&K, &MacRange) -> Vec<Assignment>;

/// Set once a watcher applied its first full listing to the pool. Until then
/// the pool doesn't know every address objects of that kind already use.
#[derive(Debug, Clone, Default)]
pub struct WatchSync(Arc<AtomicBool>);

impl WatchSync {
    pub fn is_synced(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn mark_synced(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Waits for the VirtualMachine API to be served (KubeVirt may be installed
/// after the allocator started), then watches VirtualMachines.
pub async fn watch_virtual_machines(client: Client, pool: Arc<PoolManager>, sync: WatchSync) {
    let api = client.global_api::<VirtualMachine>();

    tokio::select! {
        served = wait_until_served(&api) => {
            if let Err(err) = served {
                warn!("Couldn't reach the VirtualMachine API, VirtualMachines won't be tracked! {err}");
                return;
            }
        }
        _ = pool.epoch().ended() => return,
    }

    watch_objects(
        api,
        Config::default(),
        pool,
        OwnerKind::VirtualMachine,
        virtual_machine_assignments,
        Some(sync),
    )
    .await
}

pub async fn watch_pods(client: Client, pool: Arc<PoolManager>) {
    watch_objects(
        client.global_api::<Pod>(),
        Config::default().labels(&get_tracked_pods_selector()),
        pool,
        OwnerKind::Pod,
        pod_assignments,
        None,
    )
    .await
}

async fn wait_until_served<K>(api: &Api<K>) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let probe = ListParams::default().limit(1);
    let description = format!("Looking up {} API", pretty_type_name::<K>());

    retry_notify(
        cluster_retry_policy(),
        || async {
            api.list(&probe)
                .await
                .map(|_| ())
                .map_err(BackoffError::transient)
        },
        log_retry(&description),
    )
    .await?;

    Ok(())
}

/// Confirms provisional addresses once their objects are persisted and
/// releases addresses of deleted objects and interfaces.
async fn watch_objects<K>(
    api: Api<K>,
    config: Config,
    pool: Arc<PoolManager>,
    kind: OwnerKind,
    extract: Extractor<K>,
    sync: Option<WatchSync>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    info!("Starting {} watcher...", pretty_type_name::<K>());

    let range = pool.range().await;
    let mut events = watcher(api, config).backoff(default_backoff()).boxed();

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = pool.epoch().ended() => break,
        };

        let result = match event {
            Some(Ok(event)) => {
                let listing = matches!(event, Event::Restarted(_));
                let result = handle_event(&pool, kind, &range, extract, event).await;

                if let (true, Ok(()), Some(sync)) = (listing, &result, &sync) {
                    sync.mark_synced();
                }

                result
            }
            Some(Err(err)) => {
                warn!("{} watcher failed! {err}", pretty_type_name::<K>());
                Ok(())
            }
            None => break,
        };

        if let Err(AllocationError::StaleEpoch) = result {
            break;
        }
    }

    info!("Exiting {} watcher!", pretty_type_name::<K>());
}

async fn handle_event<K: Resource>(
    pool: &PoolManager,
    kind: OwnerKind,
    range: &MacRange,
    extract: Extractor<K>,
    event: Event<K>,
) -> Result<(), AllocationError> {
    match event {
        Event::Applied(object) => {
            let namespace = object.namespace().unwrap_or_default();
            let assignments = extract(&object, range);

            observe_applied(pool, kind, &namespace, &object.name_any(), assignments).await
        }
        Event::Deleted(object) => {
            let namespace = object.namespace().unwrap_or_default();
            let assignments = extract(&object, range);

            observe_deleted(pool, kind, &namespace, &object.name_any(), assignments).await
        }
        Event::Restarted(objects) => {
            let mut live = HashSet::new();

            for object in &objects {
                let namespace = object.namespace().unwrap_or_default();
                let name = object.name_any();

                observe_applied(pool, kind, &namespace, &name, extract(object, range)).await?;
                live.insert((namespace, name));
            }

            pool.retain_objects(kind, &live).await?;

            Ok(())
        }
    }
}

pub async fn observe_applied(
    pool: &PoolManager,
    kind: OwnerKind,
    namespace: &str,
    name: &str,
    assignments: Vec<Assignment>,
) -> Result<(), AllocationError> {
    for assignment in &assignments {
        let confirmed = match pool.confirm(&assignment.address, &assignment.owner).await {
            // persisted without passing through this replica's webhook
            Err(AllocationError::NotFound(_)) => pool.seed(assignment.address, &assignment.owner).await,
            result => result,
        };

        match confirmed {
            Ok(()) => {}
            Err(AllocationError::StaleEpoch) => return Err(AllocationError::StaleEpoch),
            Err(err) => warn!("{} uses a conflicting address! {err}", assignment.owner),
        }
    }

    let keep = assignments
        .iter()
        .map(|assignment| assignment.address)
        .collect::<HashSet<MacAddress>>();

    pool.release_missing(kind, namespace, name, &keep).await?;

    Ok(())
}

pub async fn observe_deleted(
    pool: &PoolManager,
    kind: OwnerKind,
    namespace: &str,
    name: &str,
    assignments: Vec<Assignment>,
) -> Result<(), AllocationError> {
    for assignment in &assignments {
        match pool.release(&assignment.address, &assignment.owner).await {
            Ok(()) => {}
            Err(AllocationError::StaleEpoch) => return Err(AllocationError::StaleEpoch),
            Err(err) => warn!("Couldn't release address of deleted {}! {err}", assignment.owner),
        }
    }

    pool.release_missing(kind, namespace, name, &HashSet::new()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use kube::runtime::watcher::Event;
    use macpool_core::{
        mac::{MacAddress, MacRange},
        resources::crd::virtualmachine::VirtualMachine,
    };
    use serde_json::json;

    use crate::{
        assignments::{virtual_machine_assignments, Assignment},
        leadership::LeadershipGate,
        pool::{
            owner::{Owner, OwnerKind},
            table::{AllocationState, AllocationTable, TransactionId},
            PoolManager,
        },
    };

    use super::{handle_event, observe_applied, observe_deleted};

    fn pool(gate: &LeadershipGate) -> PoolManager {
        let range = MacRange::parse("02:00:00:00:00:00", "02:00:00:00:00:0f").unwrap();

        PoolManager::new(AllocationTable::new(range), gate.current_epoch().unwrap())
    }

    fn vm(interface: &str) -> Owner {
        Owner::new(OwnerKind::VirtualMachine, "default", "fedora", interface)
    }

    #[tokio::test]
    async fn persisted_object_confirms_its_addresses() {
        let gate = LeadershipGate::standalone();
        let pool = pool(&gate);
        let address = pool.allocate(&TransactionId::new("tx"), &vm("default")).await.unwrap();

        observe_applied(
            &pool,
            OwnerKind::VirtualMachine,
            "default",
            "fedora",
            vec![Assignment { owner: vm("default"), address }],
        )
        .await
        .unwrap();

        assert_eq!(pool.snapshot().await[0].state, AllocationState::Confirmed);
    }

    #[tokio::test]
    async fn unknown_address_is_adopted_and_removed_interface_released() {
        let gate = LeadershipGate::standalone();
        let pool = pool(&gate);
        let adopted: MacAddress = "02:00:00:00:00:05".parse().unwrap();
        let dropped: MacAddress = "02:00:00:00:00:06".parse().unwrap();

        observe_applied(
            &pool,
            OwnerKind::VirtualMachine,
            "default",
            "fedora",
            vec![
                Assignment { owner: vm("default"), address: adopted },
                Assignment { owner: vm("br1"), address: dropped },
            ],
        )
        .await
        .unwrap();
        observe_applied(
            &pool,
            OwnerKind::VirtualMachine,
            "default",
            "fedora",
            vec![Assignment { owner: vm("default"), address: adopted }],
        )
        .await
        .unwrap();

        let records = pool.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, adopted);
    }

    #[tokio::test]
    async fn deleted_object_frees_its_addresses() {
        let gate = LeadershipGate::standalone();
        let pool = pool(&gate);
        let address = pool.allocate(&TransactionId::new("tx"), &vm("default")).await.unwrap();
        pool.confirm(&address, &vm("default")).await.unwrap();

        observe_deleted(
            &pool,
            OwnerKind::VirtualMachine,
            "default",
            "fedora",
            vec![Assignment { owner: vm("default"), address }],
        )
        .await
        .unwrap();

        assert!(pool.snapshot().await.is_empty());
    }

    fn virtual_machine(name: &str, address: &str) -> VirtualMachine {
        serde_json::from_value(json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachine",
            "metadata": { "name": name, "namespace": "default" },
            "spec": { "template": { "spec": { "domain": { "devices": {
                "interfaces": [ { "name": "default", "macAddress": address } ]
            } } } } }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn relisting_confirms_live_objects_and_forgets_vanished_ones() {
        let gate = LeadershipGate::standalone();
        let pool = pool(&gate);
        let range = pool.range().await;
        let pending = pool.allocate(&TransactionId::new("tx"), &vm("default")).await.unwrap();
        let vanished: MacAddress = "02:00:00:00:00:09".parse().unwrap();
        pool.seed(
            vanished,
            &Owner::new(OwnerKind::VirtualMachine, "default", "deleted-meanwhile", "default"),
        )
        .await
        .unwrap();

        handle_event(
            &pool,
            OwnerKind::VirtualMachine,
            &range,
            virtual_machine_assignments,
            Event::Restarted(vec![
                virtual_machine("fedora", &pending.to_string()),
                virtual_machine("centos", "02:00:00:00:00:0a"),
            ]),
        )
        .await
        .unwrap();

        let mut records = pool.snapshot().await;
        records.sort_by_key(|record| record.address);
        let records = records
            .iter()
            .map(|record| (record.address.to_string(), record.owner.name.as_str(), record.state))
            .collect::<Vec<_>>();

        assert_eq!(
            records,
            vec![
                ("02:00:00:00:00:00".to_owned(), "fedora", AllocationState::Confirmed),
                ("02:00:00:00:00:0a".to_owned(), "centos", AllocationState::Confirmed),
            ]
        );
    }
}
