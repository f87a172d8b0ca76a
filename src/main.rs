use task_hooks::app::cli;
use task_hooks::TaskManager;

fn main() {
    let manager = TaskManager::new();

    if let Err(e) = cli::run_cli(manager) {
        eprintln!("[ERROR]: {}", e);
        std::process::exit(1);
    }
}
