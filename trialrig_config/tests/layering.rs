use std::fs;

use trialrig_config::{TaskKind, load_layered, merge_tables};
use tempfile::tempdir;

#[test]
fn later_layers_override_key_by_key() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("rig.toml");
    let task = dir.path().join("task.toml");
    let subject = dir.path().join("subject.toml");
    fs::write(
        &base,
        "[task]\nresponse_window = 30.0\niti_delay = 1.0\n[hardware]\nsync_channel = \"BNC2\"\n",
    )
    .unwrap();
    fs::write(&task, "[task]\nkind = \"biased\"\nresponse_window = 45.0\n").unwrap();
    fs::write(&subject, "[session]\nsubject = \"mouse_01\"\n").unwrap();

    let cfg = load_layered(&[&base, &task, &subject]).unwrap();
    assert_eq!(cfg.task.kind, TaskKind::Biased);
    assert_eq!(cfg.task.response_window, 45.0);
    // untouched by later layers
    assert_eq!(cfg.task.iti_delay, 1.0);
    assert_eq!(cfg.hardware.sync_channel, "BNC2");
    assert_eq!(cfg.session.subject, "mouse_01");
    // untouched by any layer
    assert_eq!(cfg.task.feedback_error_delay, 2.0);
}

#[test]
fn arrays_are_replaced_not_concatenated() {
    let mut base: toml::Table = toml::from_str("[task]\ncontrast_set = [1.0, 0.5]").unwrap();
    let over: toml::Table = toml::from_str("[task]\ncontrast_set = [0.25]").unwrap();
    merge_tables(&mut base, over);
    let set = base["task"]["contrast_set"].as_array().unwrap();
    assert_eq!(set.len(), 1);
}

#[test]
fn parse_errors_name_the_file() {
    let dir = tempdir().unwrap();
    let bad = dir.path().join("bad.toml");
    fs::write(&bad, "[task\n").unwrap();
    let err = load_layered(&[&bad]).unwrap_err();
    assert!(err.to_string().contains("bad.toml"));
}

#[test]
fn type_errors_surface_as_invalid_configuration() {
    let dir = tempdir().unwrap();
    let f = dir.path().join("t.toml");
    fs::write(&f, "[task]\nresponse_window = \"long\"\n").unwrap();
    let err = load_layered(&[&f]).unwrap_err();
    assert!(err.to_string().contains("invalid configuration"));
}

#[test]
fn automatic_stopping_defaults_on_and_can_be_disabled() {
    let dir = tempdir().unwrap();
    let f = dir.path().join("s.toml");
    fs::write(&f, "[session]\nmax_trials = 10\n").unwrap();
    assert!(load_layered(&[&f]).unwrap().session.automatic_stopping);
    fs::write(&f, "[session]\nautomatic_stopping = false\n").unwrap();
    assert!(!load_layered(&[&f]).unwrap().session.automatic_stopping);
}
