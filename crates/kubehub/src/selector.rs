use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector as KubeSelector;
use keel_core::{LabelSelector, SelectorError};

/// Convert a kube label selector; `None` selects every node.
pub fn to_core_selector(selector: Option<&KubeSelector>) -> Result<LabelSelector, SelectorError> {
    let Some(sel) = selector else { return Ok(LabelSelector::everything()) };
    let labels = sel.match_labels.iter().flatten().map(|(k, v)| (k.as_str(), v.as_str()));
    let exprs = sel
        .match_expressions
        .iter()
        .flatten()
        .map(|e| (e.key.as_str(), e.operator.as_str(), e.values.as_deref().unwrap_or(&[])));
    LabelSelector::from_parts(labels, exprs)
}
