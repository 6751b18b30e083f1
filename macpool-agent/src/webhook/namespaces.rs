use futures::{Future, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    runtime::{
        reflector::{self, reflector, ObjectRef, Store},
        watcher::{watcher, Config},
        WatchStreamExt,
    },
    Client, ResourceExt,
};
use log::warn;
use macpool_core::{kubernetes::GetApi, resources::labels::is_opted_out};

/// Answers whether a namespace opted out of address assignment, based on a
/// reflected cache of namespace labels.
#[derive(Clone, Default)]
pub struct NamespaceFilter {
    store: Option<Store<Namespace>>,
}

impl NamespaceFilter {
    pub fn new(store: Store<Namespace>) -> Self {
        Self { store: Some(store) }
    }

    /// Every namespace takes part.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_opted_out(&self, namespace: &str, opt_out_label: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        store
            .get(&ObjectRef::new(namespace))
            .is_some_and(|namespace| is_opted_out(namespace.labels(), opt_out_label))
    }
}

pub fn start_namespace_reflector(client: &Client) -> (impl Future<Output = ()>, Store<Namespace>) {
    let watcher = watcher(client.cluster_api::<Namespace>(), Config::default()).map_ok(|event| {
        event.modify(|namespace| {
            namespace.managed_fields_mut().clear();
            namespace.annotations_mut().clear();
            namespace.spec = None;
            namespace.status = None;
        })
    });
    let (store, writer) = reflector::store();
    let reflector = reflector(writer, watcher)
        .applied_objects()
        .for_each(|result| {
            if let Err(err) = result {
                warn!("Namespace watcher failed! {err}");
            }

            std::future::ready(())
        });

    (reflector, store)
}
