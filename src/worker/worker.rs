use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver};
use log::{debug, warn};

use crate::models::options::{Options, OutputMap};
use crate::supervisor::Registry;
use crate::transfer::{self, TransferSettings, RC_OK};

/// Clears the running flag however the worker thread ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle on a thread performing one URL transfer.
pub struct TransferWorker {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    result: Receiver<OutputMap>,
}

pub fn spawn_transfer_worker(
    url: String,
    options: Options,
    settings: TransferSettings,
) -> io::Result<TransferWorker> {
    spawn_worker(move |cancel| run_transfer(&url, &options, &settings, cancel))
}

/// Runs `body` on a named thread. Its output map is published before the
/// running flag clears; a body that panics publishes nothing.
pub(crate) fn spawn_worker<F>(body: F) -> io::Result<TransferWorker>
where
    F: FnOnce(&AtomicBool) -> OutputMap + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let cancel = Arc::new(AtomicBool::new(false));
    let (sender, result) = bounded(1);

    let guard = RunningGuard(Arc::clone(&running));
    let thread_cancel = Arc::clone(&cancel);
    let handle = thread::Builder::new()
        .name("url-transfer".to_string())
        .spawn(move || {
            let _guard = guard;
            let output = body(&thread_cancel);
            // publish before the guard clears the running flag
            if sender.try_send(output).is_err() {
                warn!("transfer result dropped");
            }
        })?;

    Ok(TransferWorker {
        handle: Some(handle),
        running,
        cancel,
        result,
    })
}

fn run_transfer(
    url: &str,
    options: &Options,
    settings: &TransferSettings,
    cancel: &AtomicBool,
) -> OutputMap {
    let mut output = OutputMap::new();
    let rc = transfer::download(url, options, Some(&mut output), settings, cancel);
    if rc != RC_OK {
        output.insert("error_code".to_string(), rc.to_string());
    }
    debug!("transfer of \"{}\" ended with code {}", url, rc);
    output
}

impl TransferWorker {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The output map, once the worker has published it.
    pub fn take_output(&self) -> Option<OutputMap> {
        self.result.try_recv().ok()
    }

    /// Asks the transfer to stop at its next body chunk.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Joins a finished thread now; otherwise leaves the join to the
    /// registry so the caller never blocks on a transfer in flight.
    pub fn finish(&mut self, registry: &mut Registry) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("url transfer thread panicked");
            }
        } else {
            self.cancel();
            registry.schedule_join(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_until_stopped(worker: &TransferWorker) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while worker.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn publishes_error_code_for_invalid_url() {
        let worker =
            spawn_transfer_worker("::nope::".to_string(), Options::new(), TransferSettings::default())
                .unwrap();
        wait_until_stopped(&worker);
        assert!(!worker.is_running());
        let output = worker.take_output().unwrap();
        assert_eq!(output["error_code"], "1");
        assert!(output.contains_key("error"));
        assert!(worker.take_output().is_none());
    }

    #[test]
    fn finish_joins_finished_thread() {
        let mut worker =
            spawn_transfer_worker("::nope::".to_string(), Options::new(), TransferSettings::default())
                .unwrap();
        wait_until_stopped(&worker);
        let mut registry = Registry::new(Duration::from_millis(10), 5);
        // the flag drops just before the thread itself exits
        thread::sleep(Duration::from_millis(20));
        worker.finish(&mut registry);
        worker.finish(&mut registry);
        assert!(registry.orphan_count() <= 1);
    }

    #[test]
    fn panicking_body_stops_without_output() {
        let worker = spawn_worker(|_| panic!("transfer failed hard")).unwrap();
        wait_until_stopped(&worker);
        assert!(!worker.is_running());
        assert!(worker.take_output().is_none());
    }
}
