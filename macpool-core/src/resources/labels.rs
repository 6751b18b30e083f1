use std::collections::BTreeMap;

use kube::api::ListParams;

pub const LEADER_LABEL: &str = "kubemacpool-leader";
pub const APP_LABEL: &str = "app.kubernetes.io/name";
pub const APP_NAME: &str = "kubemacpool";

pub const VIRT_LAUNCHER_LABEL: &str = "kubevirt.io";
pub const VIRT_LAUNCHER_VALUE: &str = "virt-launcher";

pub const POD_OPT_OUT_LABEL: &str = "mutatepods.kubemacpool.io";
pub const VIRTUAL_MACHINE_OPT_OUT_LABEL: &str = "mutatevirtualmachines.kubemacpool.io";
pub const OPT_OUT_VALUE: &str = "ignore";

pub fn get_leader_labels(is_leader: bool) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_owned(), APP_NAME.to_owned()),
        (LEADER_LABEL.to_owned(), is_leader.to_string()),
    ])
}

/// Pods created by KubeVirt for a VirtualMachine carry the VM's addresses and
/// must not be tracked twice.
pub fn get_tracked_pods_selector() -> String {
    format!("{VIRT_LAUNCHER_LABEL}!={VIRT_LAUNCHER_VALUE}")
}

pub fn get_ignored_pods_listparams() -> ListParams {
    ListParams::default().labels(&get_tracked_pods_selector())
}

pub fn is_virt_launcher(labels: &BTreeMap<String, String>) -> bool {
    labels
        .get(VIRT_LAUNCHER_LABEL)
        .is_some_and(|value| value == VIRT_LAUNCHER_VALUE)
}

pub fn is_opted_out(labels: &BTreeMap<String, String>, opt_out_label: &str) -> bool {
    labels
        .get(opt_out_label)
        .is_some_and(|value| value == OPT_OUT_VALUE)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{
        get_ignored_pods_listparams, get_tracked_pods_selector, is_opted_out, is_virt_launcher,
        POD_OPT_OUT_LABEL,
    };

    #[test]
    fn recognizes_virt_launcher_pods() {
        let launcher = BTreeMap::from([("kubevirt.io".to_owned(), "virt-launcher".to_owned())]);
        let handler = BTreeMap::from([("kubevirt.io".to_owned(), "virt-handler".to_owned())]);

        assert!(is_virt_launcher(&launcher));
        assert!(!is_virt_launcher(&handler));
        assert!(!is_virt_launcher(&BTreeMap::new()));
    }

    #[test]
    fn opt_out_requires_ignore_value() {
        let ignored = BTreeMap::from([(POD_OPT_OUT_LABEL.to_owned(), "ignore".to_owned())]);
        let allocated = BTreeMap::from([(POD_OPT_OUT_LABEL.to_owned(), "allocate".to_owned())]);

        assert!(is_opted_out(&ignored, POD_OPT_OUT_LABEL));
        assert!(!is_opted_out(&allocated, POD_OPT_OUT_LABEL));
    }

    #[test]
    fn list_params_share_the_tracked_pods_selector() {
        assert_eq!(get_tracked_pods_selector(), "kubevirt.io!=virt-launcher");
        assert_eq!(
            get_ignored_pods_listparams().label_selector,
            Some(get_tracked_pods_selector())
        );
    }
}
