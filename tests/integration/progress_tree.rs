//! Progress tree aggregation and selection through the public API.

use workloop::progress::{progress_domain, ProgressNode};

use crate::fixtures::ClockedRoot;

fn assert_aggregates(node: &ProgressNode, local_total: f64, local_count: f64) {
    let snap = node.snapshot();
    let total: f64 = snap.tasks.iter().map(|t| t.total).sum::<f64>() + local_total;
    let count: f64 = snap.tasks.iter().map(|t| t.count).sum::<f64>() + local_count;
    assert!((snap.total - total).abs() < 1e-9, "total {} != {}", snap.total, total);
    assert!((snap.count - count).abs() < 1e-9, "count {} != {}", snap.count, count);
}

#[test]
fn test_domain_sums_children_and_local_additions() {
    let env = ClockedRoot::new(0.0);
    let download = env.root.create_task("download", "Downloading", 10.0);
    let bench = env.root.create_task("bench", "Benchmark", 5.0);

    download.add_count(3.0);
    bench.add_count(2.0);
    env.root.add_total(4.0);
    env.root.add_count(1.0);

    assert_eq!(env.root.total(), 19.0);
    assert_eq!(env.root.count(), 6.0);
    assert_aggregates(&env.root, 4.0, 1.0);
}

#[test]
fn test_count_stays_within_bounds_after_large_deltas() {
    let env = ClockedRoot::new(0.0);
    let task = env.root.create_task("t", "", 10.0);

    assert_eq!(task.add_count(1_000_000.0), 10.0);
    assert_eq!(task.count(), 10.0);
    assert_eq!(env.root.count(), 10.0);

    assert_eq!(task.add_count(-1_000_000.0), -10.0);
    assert_eq!(task.count(), 0.0);
    assert_eq!(env.root.count(), 0.0);

    task.add_count(8.0);
    task.add_total(-5.0);
    assert_eq!(task.total(), 5.0);
    assert_eq!(task.count(), 5.0);
    assert_eq!(env.root.count(), 5.0);
    assert_aggregates(&env.root, 0.0, 0.0);
}

#[test]
fn test_completion_tolerance() {
    let env = ClockedRoot::new(0.0);
    let task = env.root.create_task("t", "", 1000.0);

    task.add_count(998.0);
    assert!(!task.is_completed());
    task.add_count(1.0);
    assert!(task.is_completed());
}

#[test]
fn test_leading_task_is_sticky() {
    let env = ClockedRoot::new(0.0);
    let first = env.root.create_task("first", "", 10.0);
    let second = env.root.create_task("second", "", 10.0);

    assert_eq!(env.root.leading_task(false), Some(first.clone()));
    assert_eq!(env.root.leading_task(false), Some(first.clone()));

    first.add_count(10.0);
    assert_eq!(env.root.leading_task(false), Some(second.clone()));

    // The earlier sibling becomes incomplete again, the choice does not move.
    first.add_total(5.0);
    assert!(!first.is_completed());
    assert_eq!(env.root.leading_task(false), Some(second.clone()));

    second.add_count(10.0);
    assert_eq!(env.root.leading_task(false), Some(first.clone()));

    first.close();
    assert_eq!(env.root.leading_task(false), None);
}

#[test]
fn test_recursive_leading_task_descends() {
    let env = ClockedRoot::new(0.0);
    let stage = env.root.create_task("stage", "", 0.0);
    let done = stage.create_task("prepare", "", 1.0);
    let running = stage.create_task("compute", "", 4.0);
    done.close();

    assert_eq!(env.root.leading_task_for("stage"), Some(running.clone()));
    assert_eq!(env.root.leading_task(true), Some(running));
    assert_eq!(env.root.leading_task_for("missing"), None);
    assert!(stage.leading_task(false).is_some());
}

#[test]
fn test_get_task_miss_leaves_tree_untouched() {
    let env = ClockedRoot::new(0.0);
    env.root.create_task("a", "", 3.0);

    let ghost = env.root.get_task("nope");
    assert_eq!(ghost.total(), 0.0);
    assert!(!ghost.has_parent());
    ghost.add_total(50.0);

    assert_eq!(env.root.total(), 3.0);
    assert_eq!(env.root.task_tags(), vec!["a".to_string()]);
    assert_eq!(env.root.get_task("a").total(), 3.0);
}

#[test]
fn test_replaced_task_no_longer_reports() {
    let env = ClockedRoot::new(0.0);
    let old = env.root.create_task("job", "old", 10.0);
    old.add_count(2.0);

    let new = env.root.create_task("job", "new", 4.0);
    assert_eq!(env.root.total(), 4.0);
    assert_eq!(env.root.count(), 0.0);

    old.add_count(5.0);
    assert_eq!(env.root.count(), 0.0);
    new.add_count(1.0);
    assert_eq!(env.root.count(), 1.0);
    assert_eq!(env.root.get_task("job").label(), "new");
}

#[test]
fn test_add_task_rejects_cycles_and_foreign_trees() {
    let env = ClockedRoot::new(0.0);
    let parent = env.root.create_task("parent", "", 1.0);
    let child = parent.create_task("child", "", 1.0);

    assert!(child.add_task("loop", &parent).is_err());
    assert!(parent.add_task("self", &parent).is_err());

    let other = ClockedRoot::new(0.0);
    let foreign = other.root.create_task("x", "", 1.0);
    assert!(env.root.add_task("x", &foreign).is_err());
}

#[test]
fn test_add_task_moves_contribution() {
    let env = ClockedRoot::new(0.0);
    let left = env.root.create_task("left", "", 0.0);
    let right = env.root.create_task("right", "", 0.0);
    let unit = left.create_task("unit", "", 6.0);
    unit.add_count(2.0);

    right.add_task("unit", &unit).unwrap();
    assert_eq!(left.total(), 0.0);
    assert_eq!(right.total(), 6.0);
    assert_eq!(right.count(), 2.0);
    assert_eq!(env.root.total(), 6.0);
    assert_aggregates(&env.root, 0.0, 0.0);
}

#[test]
fn test_snapshot_json() {
    let env = ClockedRoot::new(0.0);
    let task = env.root.create_task("bench", "Benchmark", 2.0);
    task.add_count(1.0);

    let snap = env.root.snapshot();
    let bench = snap.task("bench").unwrap();
    assert_eq!(bench.label.as_deref(), Some("Benchmark"));
    assert_eq!(bench.count, 1.0);

    let json: serde_json::Value = serde_json::from_str(&env.root.to_string()).unwrap();
    assert_eq!(json["tasks"][0]["tag"], "bench");
    assert_eq!(json["total"], 2.0);
}

#[test]
fn test_progress_domains_are_independent() {
    let first = progress_domain();
    let second = progress_domain();
    first.create_task("x", "", 3.0);

    assert_eq!(first.total(), 3.0);
    assert_eq!(second.total(), 0.0);
    assert!(!first.has_parent());
    assert_ne!(first, second);
    assert_eq!(first.leading_task(false), Some(first.get_task("x")));
}
