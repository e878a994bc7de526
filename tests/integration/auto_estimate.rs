//! Auto task estimation driven by a shared scheduler on a virtual clock.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::fixtures::ClockedRoot;

#[test]
fn test_linear_phase_tracks_elapsed_seconds() {
    let env = ClockedRoot::new(0.0);
    let task = env.root.start_auto_task("bench", "Benchmark", 10.0);
    assert!(task.is_auto());

    env.tick_at(5_000.0);
    assert!((task.count() - 5.0).abs() < 1e-9);
    assert_eq!(task.total(), 10.0);
    assert!((env.root.count() - 5.0).abs() < 1e-9);
}

#[test]
fn test_overrun_decays_towards_inflated_total() {
    let env = ClockedRoot::new(0.0);
    let task = env.root.start_auto_task("bench", "", 10.0);

    env.tick_at(10_600.0);
    assert!((task.total() - 13.0).abs() < 1e-9);
    assert!((task.count() - 10.0).abs() < 1e-9);
    assert!((env.root.total() - 13.0).abs() < 1e-9);

    let mut last = task.count();
    for step in 1..=200 {
        env.tick_at(10_600.0 + step as f64 * 60_000.0);
        let count = task.count();
        assert!(count >= last, "count went backwards at step {}", step);
        assert!(count < task.total(), "count reached total at step {}", step);
        last = count;
    }

    task.close();
    assert_eq!(task.count(), task.total());
    assert!(env.root.is_completed());
    assert_eq!(env.tick_at(20_000_000.0), 0);
}

#[test]
fn test_close_snaps_to_total_during_linear_phase() {
    let env = ClockedRoot::new(0.0);
    let task = env.root.start_auto_task("bench", "", 10.0);
    env.tick_at(2_000.0);

    task.close();
    assert!(task.is_closed());
    assert_eq!(task.count(), 10.0);
    assert_eq!(env.root.count(), 10.0);

    // Later ticks leave a closed task alone.
    env.tick_at(8_000.0);
    assert_eq!(task.count(), 10.0);
    assert_eq!(env.scheduler.live_count(), 0);
}

#[test]
fn test_auto_and_manual_tasks_share_a_domain() {
    let env = ClockedRoot::new(0.0);
    let manual = env.root.create_task("download", "", 4.0);
    let auto = env.root.start_auto_task("bench", "", 6.0);

    manual.add_count(4.0);
    env.tick_at(3_000.0);

    assert_eq!(env.root.total(), 10.0);
    assert!((env.root.count() - 7.0).abs() < 1e-9);
    assert_eq!(env.root.leading_task(false), Some(auto));
}

async fn wait_until_completed(task: &workloop::ProgressNode) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !task.is_completed() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_bound_future_success_closes_task() {
    let env = ClockedRoot::new(0.0);
    let (tx, rx) = oneshot::channel::<()>();
    let task = env.root.create_auto_task("bench", "", 30.0, rx);

    env.tick_at(1_000.0);
    assert!(!task.is_completed());

    tx.send(()).unwrap();
    wait_until_completed(&task).await;
    assert_eq!(task.count(), 30.0);
    assert!(task.is_closed());
}

#[tokio::test]
async fn test_bound_future_failure_also_closes_task() {
    let env = ClockedRoot::new(0.0);
    let (tx, rx) = oneshot::channel::<()>();
    let task = env.root.create_auto_task("bench", "", 30.0, rx);

    // Dropping the sender resolves the receiver with an error.
    drop(tx);
    wait_until_completed(&task).await;
    assert_eq!(task.count(), task.total());
    assert!(env.root.is_completed());
}
