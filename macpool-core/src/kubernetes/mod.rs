use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Api, Client, Resource};

pub mod operations;

pub trait GetApi {
    fn global_api<T: Resource<DynamicType = ()>>(&self) -> Api<T>;
    fn namespaced_api<T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>>(
        &self,
        namespace: &str,
    ) -> Api<T>;
    fn cluster_api<T: Resource<Scope = ClusterResourceScope, DynamicType = ()>>(&self) -> Api<T>;
}

impl GetApi for Client {
    fn global_api<T: Resource<DynamicType = ()>>(&self) -> Api<T> {
        Api::all(self.clone())
    }

    fn namespaced_api<T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>>(
        &self,
        namespace: &str,
    ) -> Api<T> {
        Api::namespaced(self.clone(), namespace)
    }

    fn cluster_api<T: Resource<Scope = ClusterResourceScope, DynamicType = ()>>(&self) -> Api<T> {
        Api::all(self.clone())
    }
}
