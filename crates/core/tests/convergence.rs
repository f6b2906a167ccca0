#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::prelude::*;
use keel_core::{hash_images, observed_from_labels};

type Labels = BTreeMap<String, String>;

fn key(image: &str) -> String { label_key(&ImageRef::parse(image).unwrap().identity()) }

/// One machine-side pass: runtime inventory as the observation.
fn agent_pass(labels: &mut Labels, desired: &[&str], runtime: &[&str]) {
    let next = compute_state(&hash_images(desired.iter().copied()), &hash_images(runtime.iter().copied()), labels);
    LabelDelta::between(labels, &next).apply_to(labels);
}

/// One declaration-side pass: label-reported presence as the observation.
fn controller_pass(labels: &mut Labels, desired: &[&str]) {
    let observed = observed_from_labels(labels);
    let next = compute_state(&hash_images(desired.iter().copied()), &observed, labels);
    LabelDelta::between(labels, &next).apply_to(labels);
}

fn state<'a>(labels: &'a Labels, image: &str) -> Option<&'a str> { labels.get(&key(image)).map(String::as_str) }

#[test]
fn image_lifecycle_across_both_sides() {
    let mut labels = Labels::new();
    labels.insert("kubernetes.io/hostname".into(), "n1".into());

    controller_pass(&mut labels, &["app:v1"]);
    assert_eq!(state(&labels, "app:v1"), Some("pending"));

    // The controller cannot confirm presence on its own.
    controller_pass(&mut labels, &["app:v1"]);
    assert_eq!(state(&labels, "app:v1"), Some("pending"));

    agent_pass(&mut labels, &["app:v1"], &["app:v1"]);
    assert_eq!(state(&labels, "app:v1"), Some("available"));

    // Undeclared: the controller flags it, only the agent drops it.
    controller_pass(&mut labels, &[]);
    assert_eq!(state(&labels, "app:v1"), Some("deleting"));
    controller_pass(&mut labels, &[]);
    assert_eq!(state(&labels, "app:v1"), Some("deleting"));
    agent_pass(&mut labels, &[], &["app:v1"]);
    assert_eq!(state(&labels, "app:v1"), Some("deleting"));
    agent_pass(&mut labels, &[], &[]);
    assert_eq!(state(&labels, "app:v1"), None);

    assert_eq!(labels.get("kubernetes.io/hostname").map(String::as_str), Some("n1"));
}

#[test]
fn redeclaring_a_deleting_image_brings_it_back() {
    let mut labels = Labels::new();
    labels.insert(key("app:v1"), ImageState::Deleting.to_string());
    agent_pass(&mut labels, &["app:v1"], &["app:v1"]);
    assert_eq!(state(&labels, "app:v1"), Some("available"));
}

#[test]
fn repeated_passes_are_stable() {
    let mut labels = Labels::new();
    agent_pass(&mut labels, &["app:v1", "db:2"], &["db:2", "untracked:1"]);
    let settled = labels.clone();
    for _ in 0..3 {
        agent_pass(&mut labels, &["app:v1", "db:2"], &["db:2", "untracked:1"]);
        controller_pass(&mut labels, &["app:v1", "db:2"]);
    }
    assert_eq!(labels, settled);
    assert_eq!(state(&labels, "untracked:1"), None);
}

#[test]
fn operator_hold_survives_both_sides() {
    let mut labels = Labels::new();
    labels.insert(key("app:v1"), "unknown".into());
    controller_pass(&mut labels, &["app:v1"]);
    agent_pass(&mut labels, &[], &["app:v1"]);
    assert_eq!(state(&labels, "app:v1"), Some("unknown"));
    agent_pass(&mut labels, &[], &[]);
    assert_eq!(state(&labels, "app:v1"), None);
}
