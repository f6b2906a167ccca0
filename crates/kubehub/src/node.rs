//! Node resource -> [`MachineView`].

use k8s_openapi::api::core::v1::Node;
use keel_core::{MachineView, Readiness};
use kube::ResourceExt;

fn condition_true(node: &Node, kind: &str) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == kind))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

pub fn readiness(node: &Node) -> Readiness {
    Readiness {
        ready: condition_true(node, "Ready"),
        disk_pressure: condition_true(node, "DiskPressure"),
        pid_pressure: condition_true(node, "PIDPressure"),
    }
}

/// Image names the kubelet reports in `status.images`.
pub fn reported_images(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|s| s.images.as_ref())
        .map(|imgs| imgs.iter().flat_map(|i| i.names.iter().flatten().cloned()).collect())
        .unwrap_or_default()
}

/// View with the kubelet-reported images as the observation.
pub fn machine_view(node: &Node) -> MachineView {
    let names = reported_images(node);
    machine_view_with(node, names.iter().map(String::as_str))
}

/// View with an explicit observation (the agent's runtime listing).
pub fn machine_view_with<'a>(node: &Node, images: impl IntoIterator<Item = &'a str>) -> MachineView {
    MachineView::new(node.name_any(), readiness(node), images, node.labels().clone())
}
