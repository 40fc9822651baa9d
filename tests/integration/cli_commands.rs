#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use arbor::{
    primitives::pager::{Pager, PagerOptions},
    storage::btree::{collect_entries, verify_tree},
    types::Geometry,
};
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

struct Workspace {
    _dir: TempDir,
    db: PathBuf,
    config: PathBuf,
}

fn workspace() -> Workspace {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("tree.arbor");
    let config = dir.path().join("cli.toml");
    fs::write(&config, "").expect("write config");
    Workspace {
        _dir: dir,
        db,
        config,
    }
}

fn arbor(ws: &Workspace) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("arbor");
    cmd.env_remove("ARBOR_DB")
        .env("ARBOR_CONFIG", &ws.config)
        .arg("--db")
        .arg(&ws.db);
    cmd
}

fn stdout_of(cmd: &mut assert_cmd::Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).expect("utf8 stdout")
}

fn keys_in(path: &Path) -> Vec<u64> {
    let pager = Pager::open(path, PagerOptions::default()).expect("open tree");
    collect_entries(&pager)
        .expect("collect entries")
        .into_iter()
        .map(|(k, _)| k)
        .collect()
}

fn init_small(ws: &Workspace) {
    arbor(ws)
        .args([
            "init",
            "--page-size",
            "512",
            "--min-entries",
            "2",
            "--max-entries",
            "5",
            "--max-value-len",
            "16",
        ])
        .assert()
        .success();
}

#[test]
fn init_load_delete_verify_roundtrip() {
    let ws = workspace();
    init_small(&ws);

    let loaded = stdout_of(arbor(&ws).args(["load", "--count", "40", "--step", "2"]));
    assert!(loaded.contains("loaded 40 keys"), "{loaded}");

    let deleted = stdout_of(arbor(&ws).args(["delete", "4", "5", "4", "--stats"]));
    assert!(deleted.contains("4: found"), "{deleted}");
    assert!(deleted.contains("5: not found"), "{deleted}");
    assert!(deleted.contains("4: not found"), "{deleted}");
    assert!(deleted.contains("operations=3 found=1 not_found=2"), "{deleted}");

    let verified = stdout_of(arbor(&ws).arg("verify"));
    assert!(verified.contains("keys=39"), "{verified}");
    assert!(verified.contains("issues=0"), "{verified}");

    let keys = keys_in(&ws.db);
    assert_eq!(keys.len(), 39);
    assert!(!keys.contains(&4));
}

#[test]
fn deferred_modes_from_flags_give_the_same_tree() {
    let ws = workspace();
    init_small(&ws);
    arbor(&ws)
        .args(["load", "--keys", "1,2,3,4,5,6,7,8,9,10,11,12"])
        .assert()
        .success();
    arbor(&ws)
        .args([
            "--io-mode",
            "deferred",
            "--commit-mode",
            "deferred",
            "--cache-pages",
            "0",
            "delete",
            "--step-budget",
            "1",
            "1",
            "2",
            "3",
        ])
        .assert()
        .success();
    assert_eq!(keys_in(&ws.db), (4u64..=12).collect::<Vec<_>>());
    let pager = Pager::open(&ws.db, PagerOptions::default()).expect("open tree");
    assert!(verify_tree(&pager).expect("verify").is_ok());
}

#[test]
fn dump_prints_nodes_and_entries() {
    let ws = workspace();
    init_small(&ws);
    arbor(&ws)
        .args(["load", "--keys", "10,20,30,40,50,60,70"])
        .assert()
        .success();
    let nodes = stdout_of(arbor(&ws).arg("dump"));
    assert!(nodes.contains("internal"), "{nodes}");
    assert!(nodes.contains("leaf"), "{nodes}");
    let entries = stdout_of(arbor(&ws).args(["dump", "--entries"]));
    assert_eq!(entries.lines().count(), 7);
    assert!(entries.lines().any(|line| line == "30\t30"), "{entries}");
}

#[test]
fn config_file_supplies_the_database() {
    let ws = workspace();
    init_small(&ws);
    fs::write(
        &ws.config,
        format!("[database]\ndefault = {:?}\n", ws.db.display().to_string()),
    )
    .expect("write config");
    let mut cmd = cargo_bin_cmd!("arbor");
    cmd.env_remove("ARBOR_DB")
        .env("ARBOR_CONFIG", &ws.config)
        .args(["load", "--count", "3"])
        .assert()
        .success();
    assert_eq!(keys_in(&ws.db), vec![0, 1, 2]);
}

#[test]
fn load_can_reshape_the_tree() {
    let ws = workspace();
    init_small(&ws);
    arbor(&ws)
        .args(["load", "--count", "30", "--min-entries", "3", "--max-entries", "8"])
        .assert()
        .success();
    let pager = Pager::open(&ws.db, PagerOptions::default()).expect("open tree");
    let sb = pager.superblock().expect("superblock");
    assert_eq!(sb.geometry, Geometry::new(3, 8, 16));
    let report = verify_tree(&pager).expect("verify");
    assert!(report.is_ok(), "{:?}", report.issues);
    assert_eq!(report.keys, 30);

    // A reshape that cannot hold a merge is refused and leaves the file alone.
    arbor(&ws)
        .args(["load", "--count", "5", "--max-entries", "5", "--min-entries", "3"])
        .assert()
        .failure()
        .code(1);
    assert_eq!(keys_in(&ws.db).len(), 30);
}

#[test]
fn errors_exit_nonzero() {
    let ws = workspace();
    init_small(&ws);
    // Refuses to clobber an existing file.
    arbor(&ws).arg("init").assert().failure().code(1);
    arbor(&ws).arg("load").assert().failure().code(1);

    let missing = workspace();
    let mut cmd = cargo_bin_cmd!("arbor");
    cmd.env_remove("ARBOR_DB")
        .env("ARBOR_CONFIG", &missing.config)
        .arg("verify")
        .assert()
        .failure()
        .code(1);
}
