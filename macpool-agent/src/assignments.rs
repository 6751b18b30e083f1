use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use log::warn;
use macpool_core::{
    mac::{MacAddress, MacRange},
    resources::{
        annotations::NETWORKS_ANNOTATION, crd::virtualmachine::VirtualMachine,
        labels::is_virt_launcher, network_selection::parse_network_selection,
    },
};

use crate::pool::owner::{Owner, OwnerKind};

/// An in-range address a persisted object currently uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub owner: Owner,
    pub address: MacAddress,
}

pub fn virtual_machine_assignments(vm: &VirtualMachine, range: &MacRange) -> Vec<Assignment> {
    let namespace = vm.namespace().unwrap_or_default();
    let name = vm.name_any();

    vm.spec
        .interfaces()
        .iter()
        .filter_map(|interface| match interface.parsed_mac_address()? {
            Ok(address) => Some(Assignment {
                owner: Owner::new(OwnerKind::VirtualMachine, &namespace, &name, &interface.name),
                address,
            }),
            Err(err) => {
                warn!("Ignoring virtual machine '{name}' in '{namespace}' namespace! {err}");
                None
            }
        })
        .filter(|assignment| range.contains(&assignment.address))
        .collect()
}

pub fn pod_assignments(pod: &Pod, range: &MacRange) -> Vec<Assignment> {
    if is_virt_launcher(pod.labels()) {
        return Vec::new();
    }

    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let Some(raw_networks) = pod.annotations().get(NETWORKS_ANNOTATION) else {
        return Vec::new();
    };

    let networks = match parse_network_selection(raw_networks) {
        Ok(networks) => networks,
        Err(err) => {
            warn!("Ignoring networks of pod '{name}' in '{namespace}' namespace! {err}");
            return Vec::new();
        }
    };

    networks
        .iter()
        .filter_map(|network| match network.parsed_mac()? {
            Ok(address) => Some(Assignment {
                owner: Owner::new(OwnerKind::Pod, &namespace, &name, network.interface_id()),
                address,
            }),
            Err(err) => {
                warn!("Ignoring network of pod '{name}' in '{namespace}' namespace! {err}");
                None
            }
        })
        .filter(|assignment| range.contains(&assignment.address))
        .collect()
}
