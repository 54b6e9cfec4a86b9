//! Deterministic names derived from pod/container IDs.
//!
//! These are bit-exact per the wire contract: kubelet and any external
//! reconciliation tooling key off them, so they must not drift between
//! versions of this runtime.

use crate::ids::{ContainerId, PodId};

/// Transient unit name bound to a pod sandbox.
pub fn pod_unit_name(pod_id: &PodId) -> String {
    format!("cri-pod-{pod_id}.service")
}

/// Transient unit name bound to a container.
pub fn container_unit_name(container_id: &ContainerId) -> String {
    format!("cri-container-{container_id}.service")
}

/// Network namespace name for a pod, and the canonical path `ip netns`
/// places it at.
pub fn pod_netns_name(pod_id: &PodId) -> String {
    let full = pod_id.to_string();
    let prefix: String = full.chars().take(8).collect();
    format!("cri-{prefix}")
}

pub fn pod_netns_path(pod_id: &PodId) -> String {
    format!("/var/run/netns/{}", pod_netns_name(pod_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_names_use_service_suffix() {
        let pod = PodId::new();
        assert!(pod_unit_name(&pod).starts_with("cri-pod-"));
        assert!(pod_unit_name(&pod).ends_with(".service"));

        let container = ContainerId::new();
        assert!(container_unit_name(&container).starts_with("cri-container-"));
        assert!(container_unit_name(&container).ends_with(".service"));
    }

    #[test]
    fn netns_name_uses_first_8_chars_of_pod_id() {
        let pod = PodId::new();
        let id_string = pod.to_string();
        let expected = format!("cri-{}", &id_string[..8]);
        assert_eq!(pod_netns_name(&pod), expected);
    }

    #[test]
    fn netns_path_is_canonical() {
        let pod = PodId::new();
        assert_eq!(
            pod_netns_path(&pod),
            format!("/var/run/netns/{}", pod_netns_name(&pod))
        );
    }
}
