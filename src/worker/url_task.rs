use std::io;

use log::{error, info, warn};

use crate::config::HookConfig;
use crate::error::{HookError, Result};
use crate::hook::HookId;
use crate::models::options::{Options, OutputMap};
use crate::models::task::{TaskId, TaskKind};
use crate::supervisor::{start_supervisor, Registry, SupervisedTask, TickOutcome};
use crate::transfer::{TransferSettings, RC_THREAD_ERROR, RC_TIMEOUT, RC_TRANSFER_ERROR};
use crate::worker::worker::{spawn_transfer_worker, TransferWorker};

/// Receives the URL, the options it was fetched with and the output map.
pub type UrlCallback = Box<dyn FnMut(&str, &Options, &OutputMap)>;

pub struct UrlLaunch {
    pub owner: String,
    pub url: String,
    pub options: Options,
    pub timeout_ms: u64,
}

pub struct UrlTask {
    id: TaskId,
    owner: String,
    url: String,
    options: Options,
    timeout_ms: u64,
    callback: UrlCallback,
    worker: Option<TransferWorker>,
    timer: Option<HookId>,
    deleted: bool,
}

fn thread_error_output(err: &io::Error) -> OutputMap {
    let mut output = OutputMap::new();
    output.insert("error_code".to_string(), RC_THREAD_ERROR.to_string());
    output.insert(
        "error_code_thread".to_string(),
        err.raw_os_error().unwrap_or(0).to_string(),
    );
    output.insert("error".to_string(), format!("error creating thread: {}", err));
    output
}

fn timeout_output(timeout_ms: u64) -> OutputMap {
    let mut output = OutputMap::new();
    output.insert("error_code".to_string(), RC_TIMEOUT.to_string());
    output.insert(
        "error".to_string(),
        format!("transfer timeout reached ({:.3}s)", timeout_ms as f64 / 1000.0),
    );
    output
}

fn lost_result_output() -> OutputMap {
    let mut output = OutputMap::new();
    output.insert("error_code".to_string(), RC_TRANSFER_ERROR.to_string());
    output.insert(
        "error".to_string(),
        "transfer thread ended without a result".to_string(),
    );
    output
}

impl UrlTask {
    pub fn start(
        id: TaskId,
        launch: UrlLaunch,
        mut callback: UrlCallback,
        registry: &mut Registry,
        config: &HookConfig,
    ) -> Result<Self> {
        let UrlLaunch {
            owner,
            url,
            options,
            timeout_ms,
        } = launch;
        let settings = TransferSettings::from_config(config, timeout_ms);

        let worker = match spawn_transfer_worker(url.clone(), options.clone(), settings) {
            Ok(worker) => worker,
            Err(err) => {
                error!("url task {}: cannot create transfer thread: {}", id, err);
                callback(&url, &options, &thread_error_output(&err));
                return Err(HookError::ThreadSpawn(err));
            }
        };
        let timer = start_supervisor(registry, id, timeout_ms, config.tick_interval);

        info!("url task {} started: \"{}\", timeout {} ms", id, url, timeout_ms);
        Ok(UrlTask {
            id,
            owner,
            url,
            options,
            timeout_ms,
            callback,
            worker: Some(worker),
            timer: Some(timer),
            deleted: false,
        })
    }

    fn deliver(&mut self, output: &OutputMap) {
        (self.callback)(&self.url, &self.options, output);
    }
}

impl SupervisedTask for UrlTask {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Url
    }

    fn description(&self) -> String {
        let running = self.worker.as_ref().is_some_and(TransferWorker::is_running);
        format!("url: \"{}\", transfer running: {}", self.url, running)
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    fn tick(&mut self, remaining_calls: Option<u32>, _registry: &mut Registry) -> TickOutcome {
        if self.deleted {
            return TickOutcome::Pending;
        }
        let Some(worker) = self.worker.as_ref() else {
            return TickOutcome::Finished;
        };

        if !worker.is_running() {
            let output = worker.take_output().unwrap_or_else(|| {
                warn!("url task {}: transfer thread ended without a result", self.id);
                lost_result_output()
            });
            self.deliver(&output);
            info!("url task {} ended", self.id);
            return TickOutcome::Finished;
        }

        if remaining_calls == Some(0) {
            // output published between the two checks still counts as done
            let output = match worker.take_output() {
                Some(output) => output,
                None => {
                    warn!(
                        "url task {}: timeout reached for \"{}\" ({} ms)",
                        self.id, self.url, self.timeout_ms
                    );
                    worker.cancel();
                    timeout_output(self.timeout_ms)
                }
            };
            self.deliver(&output);
            return TickOutcome::Finished;
        }

        TickOutcome::Pending
    }

    fn release(&mut self, registry: &mut Registry) {
        if let Some(timer) = self.timer.take() {
            registry.unhook(timer);
        }
        if let Some(mut worker) = self.worker.take() {
            worker.finish(registry);
        }
    }
}
