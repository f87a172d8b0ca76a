//! Descriptor accounting runs in its own test binary so no concurrent test
//! opens or closes descriptors while the table is being counted.

use std::time::Duration;

use task_hooks::{Options, TaskManager};

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

fn opts(pairs: &[(&str, &str)]) -> Options {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn finished_closed_and_timed_out_tasks_release_their_descriptors() {
    let mut manager = TaskManager::new();
    let baseline = open_descriptors();

    manager
        .launch_process("test", "printf hello", Options::new(), 5000, |_| {})
        .unwrap();
    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    assert_eq!(open_descriptors(), baseline, "after exit");

    let id = manager
        .launch_process("test", "cat", opts(&[("stdin", "1")]), 0, |_| {})
        .unwrap();
    manager.run_once(Duration::from_millis(10)).unwrap();
    assert!(open_descriptors() > baseline);
    assert!(manager.close(id));
    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    assert_eq!(open_descriptors(), baseline, "after close");

    manager
        .launch_process("test", "sleep 5", Options::new(), 100, |_| {})
        .unwrap();
    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    assert_eq!(open_descriptors(), baseline, "after timeout");

    manager
        .launch_process("test", "true", opts(&[("detached", "1")]), 0, |_| {})
        .unwrap();
    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    assert_eq!(open_descriptors(), baseline, "after detached run");
}
