use std::ffi::OsString;
use std::fs;
use std::path::Path;

use tally_core::backend::Table;
use tally_core::memory::MemoryBackend;
use tempfile::tempdir;

fn args(rc: &Path, data: &Path, rest: &[&str]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "tally".into(),
        "--tallyrc".into(),
        rc.into(),
        "--data".into(),
        data.into(),
    ];
    args.extend(rest.iter().map(OsString::from));
    args
}

#[tokio::test]
async fn local_backend_flow_from_signup_to_logout() {
    let temp = tempdir().expect("tempdir");
    let rc = temp.path().join("tallyrc");
    fs::write(&rc, "backend = local\ncolor = off\n").expect("write rc");
    let data = temp.path().join("data");

    tally_core::run(args(
        &rc,
        &data,
        &["signup", "ada@example.com", "--password", "engine-1843"],
    ))
    .await
    .expect("signup");
    tally_core::run(args(
        &rc,
        &data,
        &["login", "ada@example.com", "--password", "engine-1843"],
    ))
    .await
    .expect("login");
    tally_core::run(args(
        &rc,
        &data,
        &["add", "--category", "Work", "write", "the", "notes"],
    ))
    .await
    .expect("add");

    let rows = MemoryBackend::open(&data.join("local.json"))
        .expect("open snapshot")
        .rows(Table::Todos);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["task"], "write the notes");
    let id = rows[0]["id"].as_i64().expect("id").to_string();

    tally_core::run(args(&rc, &data, &["cycle", &id]))
        .await
        .expect("cycle");
    tally_core::run(args(&rc, &data, &["rc.task.validation=strict", "edit", &id, "abc"]))
        .await
        .expect_err("short text is rejected under the strict rule");
    tally_core::run(args(&rc, &data, &["list", "--category", "work"]))
        .await
        .expect("list");
    tally_core::run(args(&rc, &data, &["kv", "set", "theme", "dark"]))
        .await
        .expect("kv set");

    let backend = MemoryBackend::open(&data.join("local.json")).expect("open snapshot");
    let rows = backend.rows(Table::Todos);
    assert_eq!(rows[0]["status"], "in_progress");
    assert_eq!(rows[0]["task"], "write the notes");
    assert_eq!(backend.rows(Table::Categories).len(), 1);
    let kv = fs::read_to_string(data.join("kv.json")).expect("kv file");
    assert!(kv.contains("\"theme\""));

    tally_core::run(args(&rc, &data, &["logout"]))
        .await
        .expect("logout");
    tally_core::run(args(&rc, &data, &["list"]))
        .await
        .expect_err("listing requires a session");
}
