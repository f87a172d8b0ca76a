use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

use task_hooks::{HookConfig, Options, ProcessStatus, TaskManager, TaskMessage};

#[derive(Debug, Clone, PartialEq)]
struct Call {
    status: ProcessStatus,
    stdout: Option<String>,
    stderr: Option<String>,
}

type Calls = Rc<RefCell<Vec<Call>>>;

fn recorder() -> (Calls, impl FnMut(&task_hooks::ProcessOutput<'_>) + 'static) {
    let calls: Calls = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&calls);
    let callback = move |out: &task_hooks::ProcessOutput<'_>| {
        sink.borrow_mut().push(Call {
            status: out.status,
            stdout: out.stdout_text().map(|s| s.into_owned()),
            stderr: out.stderr_text().map(|s| s.into_owned()),
        })
    };
    (calls, callback)
}

fn opts(pairs: &[(&str, &str)]) -> Options {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn terminal_calls(calls: &Calls) -> Vec<Call> {
    calls
        .borrow()
        .iter()
        .filter(|c| c.status.is_terminal())
        .cloned()
        .collect()
}

fn stdout_of(calls: &Calls) -> String {
    calls
        .borrow()
        .iter()
        .filter_map(|c| c.stdout.clone())
        .collect()
}

#[test]
fn output_and_exit_code_are_delivered_once() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    manager
        .launch_process("test", "printf hello", Options::new(), 5000, callback)
        .unwrap();

    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    let terminal = terminal_calls(&calls);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].status, ProcessStatus::Exited(0));
    assert_eq!(stdout_of(&calls), "hello");
}

#[test]
fn non_zero_exit_code() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    let options = opts(&[("arg1", "-c"), ("arg2", "echo oops >&2; exit 3")]);
    manager
        .launch_process("test", "/bin/sh", options, 0, callback)
        .unwrap();

    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    let terminal = terminal_calls(&calls);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].status, ProcessStatus::Exited(3));
    let stderr: String = calls.borrow().iter().filter_map(|c| c.stderr.clone()).collect();
    assert_eq!(stderr, "oops\n");
}

#[test]
fn unknown_program_reports_exec_failure() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    manager
        .launch_process("test", "/nonexistent/program --flag", Options::new(), 0, callback)
        .unwrap();

    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    let terminal = terminal_calls(&calls);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].status, ProcessStatus::Exited(1));
    let stderr: String = calls.borrow().iter().filter_map(|c| c.stderr.clone()).collect();
    assert!(stderr.contains("Error with command '/nonexistent/program --flag'"));
}

#[test]
fn timeout_kills_the_child() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    let started = Instant::now();
    let id = manager
        .launch_process("test", "sleep 5", Options::new(), 200, callback)
        .unwrap();

    while manager.contains(id) && started.elapsed() < Duration::from_secs(5) {
        manager.run_once(Duration::from_millis(50)).unwrap();
    }
    let elapsed = started.elapsed();
    assert!(!manager.contains(id));
    assert!(elapsed >= Duration::from_millis(150), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);

    let terminal = terminal_calls(&calls);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].status, ProcessStatus::Error);

    // the killed child is reaped by later iterations
    assert!(manager.run_until_idle(Duration::from_secs(5)).unwrap());
}

#[test]
fn flush_threshold_sends_partial_output() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    let options = opts(&[
        ("buffer_flush", "4"),
        ("arg1", "-c"),
        ("arg2", "printf abcd; sleep 0.3; printf efgh"),
    ]);
    manager
        .launch_process("test", "/bin/sh", options, 0, callback)
        .unwrap();

    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    let recorded = calls.borrow().clone();
    let running: Vec<&Call> = recorded
        .iter()
        .filter(|c| c.status == ProcessStatus::Running)
        .collect();
    assert!(running.len() >= 2, "{:?}", recorded);
    assert_eq!(running[0].stdout.as_deref(), Some("abcd"));
    assert_eq!(stdout_of(&calls), "abcdefgh");
    assert_eq!(terminal_calls(&calls).len(), 1);
}

#[test]
fn output_below_threshold_waits_for_exit() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    manager
        .launch_process("test", "printf 'short output'", Options::new(), 0, callback)
        .unwrap();

    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    let recorded = calls.borrow().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, ProcessStatus::Exited(0));
    assert_eq!(recorded[0].stdout.as_deref(), Some("short output"));
}

#[test]
fn detached_process_delivers_only_status() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    manager
        .launch_process("test", "printf ignored", opts(&[("detached", "1")]), 0, callback)
        .unwrap();

    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    let recorded = calls.borrow().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, ProcessStatus::Exited(0));
    assert_eq!(recorded[0].stdout, None);
    assert_eq!(recorded[0].stderr, None);
}

#[test]
fn stdin_is_forwarded_to_the_child() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    let id = manager
        .launch_process("test", "cat", opts(&[("stdin", "1")]), 5000, callback)
        .unwrap();

    manager.send_stdin(id, b"line one\n").unwrap();
    manager.close_stdin(id).unwrap();
    assert!(manager.close_stdin(id).is_err());

    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    assert_eq!(stdout_of(&calls), "line one\n");
    assert_eq!(terminal_calls(&calls)[0].status, ProcessStatus::Exited(0));
}

#[test]
fn stdin_requires_the_option() {
    let mut manager = TaskManager::new();
    let (_calls, callback) = recorder();
    let id = manager
        .launch_process("test", "sleep 5", Options::new(), 0, callback)
        .unwrap();
    assert!(manager.send_stdin(id, b"x").is_err());
    assert!(manager.close(id));
}

#[test]
fn signal_ends_the_child_with_error() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    let id = manager
        .launch_process("test", "sleep 5", Options::new(), 0, callback)
        .unwrap();
    manager.signal_by_name(id, "TERM").unwrap();

    assert!(manager.run_until_idle(Duration::from_secs(5)).unwrap());
    let terminal = terminal_calls(&calls);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].status, ProcessStatus::Error);
}

#[test]
fn close_is_idempotent_and_silent() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    let id = manager
        .launch_process("test", "sleep 5", Options::new(), 0, callback)
        .unwrap();
    manager.run_once(Duration::from_millis(10)).unwrap();

    assert!(manager.close(id));
    assert!(!manager.close(id));
    assert!(manager.tasks().is_empty());
    assert_eq!(manager.pending_cleanup(), 1);
    assert!(manager.run_until_idle(Duration::from_secs(5)).unwrap());
    assert_eq!(manager.pending_cleanup(), 0);
    assert!(calls.borrow().is_empty());
}

#[test]
fn callback_can_close_its_own_task() {
    let mut manager = TaskManager::new();
    let sender = manager.sender();
    let calls: Rc<RefCell<Vec<ProcessStatus>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&calls);
    let id_cell = Rc::new(RefCell::new(None));
    let id_for_callback = Rc::clone(&id_cell);

    let options = opts(&[
        ("buffer_flush", "1"),
        ("arg1", "-c"),
        ("arg2", "printf x; sleep 5"),
    ]);
    let id = manager
        .launch_process("test", "/bin/sh", options, 0, move |out| {
            sink.borrow_mut().push(out.status);
            if let Some(id) = *id_for_callback.borrow() {
                let _ = sender.send(TaskMessage::Close(id));
            }
        })
        .unwrap();
    *id_cell.borrow_mut() = Some(id);

    assert!(manager.run_until_idle(Duration::from_secs(4)).unwrap());
    assert!(!manager.contains(id));
    assert_eq!(*calls.borrow(), vec![ProcessStatus::Running]);
}

#[test]
fn function_runs_in_the_child() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    manager
        .launch_function(
            "test",
            "answer",
            || {
                // print! would go to the test harness capture, not fd 1
                let _ = std::io::stdout().write_all(b"from child");
                42
            },
            Options::new(),
            0,
            callback,
        )
        .unwrap();

    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    assert_eq!(terminal_calls(&calls)[0].status, ProcessStatus::Exited(42));
    assert_eq!(stdout_of(&calls), "from child");
}

#[test]
fn large_output_is_split_at_buffer_capacity() {
    let config = HookConfig::default().with_buffer_capacity(1024);
    let mut manager = TaskManager::with_config(config);
    assert_eq!(manager.config().buffer_capacity, 1024);
    let (calls, callback) = recorder();
    let options = opts(&[("arg1", "-c"), ("arg2", "head -c 5000 /dev/zero | tr '\\0' a")]);
    manager
        .launch_process("test", "/bin/sh", options, 0, callback)
        .unwrap();

    assert!(manager.run_until_idle(Duration::from_secs(10)).unwrap());
    let recorded = calls.borrow().clone();
    assert!(recorded
        .iter()
        .all(|c| c.stdout.as_ref().map_or(0, String::len) <= 1024));
    assert_eq!(stdout_of(&calls).len(), 5000);
    assert_eq!(terminal_calls(&calls).len(), 1);
}

#[test]
fn task_listing_describes_processes() {
    let mut manager = TaskManager::new();
    let (_calls, callback) = recorder();
    let id = manager
        .launch_process("lister", "sleep 5", Options::new(), 0, callback)
        .unwrap();

    let tasks = manager.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, id);
    assert_eq!(tasks[0].owner, "lister");
    assert!(tasks[0].description.contains("command: \"sleep 5\""));
    drop(manager);
}

#[test]
fn short_timeout_is_a_single_shot() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    let started = Instant::now();
    let id = manager
        .launch_process("test", "sleep 2", Options::new(), 100, callback)
        .unwrap();

    while manager.contains(id) && started.elapsed() < Duration::from_secs(3) {
        manager.run_once(Duration::from_millis(20)).unwrap();
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(200), "{:?}", elapsed);
    assert_eq!(terminal_calls(&calls)[0].status, ProcessStatus::Error);
    assert!(manager.run_until_idle(Duration::from_secs(5)).unwrap());
}

fn pid_of(description: &str) -> i32 {
    description
        .rsplit("child pid: ")
        .next()
        .and_then(|pid| pid.trim().parse().ok())
        .unwrap()
}

#[test]
fn dropping_the_manager_reaps_live_children() {
    let mut manager = TaskManager::new();
    let (calls, callback) = recorder();
    let id = manager
        .launch_process("test", "sleep 5", Options::new(), 0, callback)
        .unwrap();
    let pid = pid_of(&manager.tasks()[0].description);
    assert!(pid > 0);
    assert!(manager.contains(id));
    drop(manager);

    assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
    assert!(calls.borrow().is_empty());
}
