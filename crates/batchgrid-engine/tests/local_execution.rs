//! End-to-end runs of small job graphs on the local backend.
//!
//! Every job runs `Record.sh`, which appends `<unit>:<task>` to a shared
//! order file, so the tests can check the execution order against the
//! declared dependencies.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use batchgrid_core::{BatchConfig, Dependency, EngineKind, JobSpec, RunLayout};
use batchgrid_engine::backend::LocalBackend;
use batchgrid_engine::{Engine, FinishReport, SystemRunner};

const RECORD: &str = r#"#!/bin/bash
if [ "${Fail}" = "1" ]; then
    exit 1
fi
echo "${Unit}:${LOCAL_TASK_ID}" >> "${OrderFile}"
"#;

fn local_engine(dir: &Path, concurrency: i64) -> (Engine, PathBuf) {
    let scripts = dir.join("scripts");
    fs::create_dir_all(&scripts).unwrap();
    fs::write(scripts.join("Record.sh"), RECORD).unwrap();

    let mut config = BatchConfig::scaffold(EngineKind::Local, dir);
    config.engine.scripts_dir = scripts;
    config.engine.max_current_jobs = concurrency;
    config.engine.poll_interval_ms = 10;
    config.build.source_area = dir.join("src");

    let layout = RunLayout::dated(dir, "Order", "2026-10-19");
    let engine = Engine::with_backend(
        config,
        layout,
        Arc::new(SystemRunner),
        Box::new(LocalBackend::new()),
    );
    (engine, dir.join("order.txt"))
}

fn record(sub_job: &str, order: &Path) -> JobSpec {
    JobSpec::new(sub_job, "Record.sh")
        .memory(10)
        .env("Unit", sub_job)
        .env("OrderFile", order.display())
}

fn position(lines: &[String], entry: &str) -> usize {
    lines
        .iter()
        .position(|l| l == entry)
        .unwrap_or_else(|| panic!("{entry} never ran: {lines:?}"))
}

#[test]
fn dependencies_are_respected_in_execution_order() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, order) = local_engine(dir.path(), 4);

    let a = engine.submit_array(record("A", &order).array(3), &[]).unwrap();
    let b = engine
        .submit_array(record("B", &order).array(3), &[Dependency::one_to_one(a.clone())])
        .unwrap();
    engine
        .submit_job(record("C", &order), &[Dependency::whole(b), Dependency::tasks(a, [2])])
        .unwrap();

    let report = engine.finish().unwrap();
    let FinishReport::Executed(summary) = report else {
        panic!("local runs execute: {report:?}");
    };
    assert_eq!(summary.declared, 7);
    assert_eq!(summary.succeeded, 7);

    let lines: Vec<String> = fs::read_to_string(&order)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(lines.len(), 7);
    for t in 1..=3 {
        assert!(position(&lines, &format!("A:{t}")) < position(&lines, &format!("B:{t}")));
    }
    assert_eq!(lines.last().unwrap(), "C:-1");
}

#[test]
fn failed_units_take_their_dependents_with_them() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, order) = local_engine(dir.path(), 2);

    let broken = engine
        .submit_job(record("Broken", &order).env("Fail", 1), &[])
        .unwrap();
    let after = engine
        .submit_job(record("After", &order), &[Dependency::whole(broken)])
        .unwrap();
    engine
        .submit_job(record("Last", &order), &[Dependency::whole(after)])
        .unwrap();
    engine.submit_job(record("Free", &order), &[]).unwrap();

    let FinishReport::Executed(summary) = engine.finish().unwrap() else {
        panic!("local runs execute");
    };
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.excluded, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(fs::read_to_string(&order).unwrap().trim(), "Free:-1");
}

#[test]
fn a_single_slot_runs_everything_serially() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, order) = local_engine(dir.path(), 1);

    engine.submit_array(record("Many", &order).array(5), &[]).unwrap();
    let FinishReport::Executed(summary) = engine.finish().unwrap() else {
        panic!("local runs execute");
    };
    assert_eq!(summary.succeeded, 5);
    assert_eq!(fs::read_to_string(&order).unwrap().lines().count(), 5);
}

#[test]
fn local_order_is_a_valid_order_of_the_declared_graph() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, order) = local_engine(dir.path(), 3);

    let a = engine.submit_job(record("A", &order), &[]).unwrap();
    let b = engine.submit_job(record("B", &order), &[Dependency::whole(a.clone())]).unwrap();
    let c = engine.submit_job(record("C", &order), &[Dependency::whole(a)]).unwrap();
    let d = engine
        .submit_job(record("D", &order), &[Dependency::whole(b), Dependency::whole(c.clone())])
        .unwrap();
    engine
        .submit_job(record("E", &order), &[Dependency::whole(d), Dependency::whole(c)])
        .unwrap();
    let graph = engine.graph().clone();

    let FinishReport::Executed(summary) = engine.finish().unwrap() else {
        panic!("local runs execute");
    };
    assert_eq!(summary.succeeded, 5);

    let executed: Vec<String> = fs::read_to_string(&order)
        .unwrap()
        .lines()
        .map(|l| format!("Order_{}", l.trim_end_matches(":-1")))
        .collect();
    assert!(graph.is_valid_order(&executed), "{executed:?}");
}
