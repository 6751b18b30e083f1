use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::mac::MacAddress;

/// The part of a `kubevirt.io/v1` VirtualMachine the allocator reads. Unknown
/// fields are dropped on deserialization, so this type is never written back.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    namespaced,
    derive = "Default"
)]
pub struct VirtualMachineSpec {
    #[serde(default)]
    pub template: VirtualMachineInstanceTemplate,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct VirtualMachineInstanceTemplate {
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct VirtualMachineInstanceSpec {
    #[serde(default)]
    pub domain: DomainSpec,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct DomainSpec {
    #[serde(default)]
    pub devices: Devices,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct Devices {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    #[serde(default)]
    pub name: String,
    pub mac_address: Option<String>,
}

impl VirtualMachineSpec {
    pub fn interfaces(&self) -> &[Interface] {
        &self.template.spec.domain.devices.interfaces
    }

    /// JSON pointer of the `macAddress` field of the interface at `index`.
    pub fn mac_address_pointer(index: usize) -> String {
        format!("/spec/template/spec/domain/devices/interfaces/{index}/macAddress")
    }
}

impl Interface {
    /// `None` when no address is set, `Some(Err(_))` when it can't be parsed.
    pub fn parsed_mac_address(&self) -> Option<Result<MacAddress, crate::mac::MacError>> {
        self.mac_address
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .map(str::parse)
    }
}
