use std::{
    io::{self, Write},
    time::Duration,
};

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal,
};

use crate::error::Result;
use crate::manager::task_manager::TaskManager;
use crate::models::options::{Options, OutputMap};
use crate::models::task::{ProcessStatus, TaskId};
use crate::process::task::ProcessOutput;

const OWNER: &str = "cli";
const KEY_POLL: Duration = Duration::from_millis(20);
const LOOP_WAIT: Duration = Duration::from_millis(30);

struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Raw mode needs explicit carriage returns.
fn raw_text(text: &str) -> String {
    text.trim_end_matches('\n').replace('\n', "\r\n")
}

fn print_process_output(output: &ProcessOutput<'_>) {
    let tag = format!("[{}]", output.command);
    if let Some(text) = output.stdout_text() {
        println!("\r{} {}", tag, raw_text(&text));
    }
    if let Some(text) = output.stderr_text() {
        println!("\r{} stderr: {}", tag, raw_text(&text));
    }
    match output.status {
        ProcessStatus::Running => {}
        ProcessStatus::Exited(code) => println!("\r{} exited with code {}", tag, code),
        ProcessStatus::Error => println!("\r{} ended with an error", tag),
    }
    print!("\r>>> ");
    let _ = io::stdout().flush();
}

fn print_url_output(url: &str, _options: &Options, output: &OutputMap) {
    let tag = format!("[{}]", url);
    if let Some(code) = output.get("response_code") {
        println!("\r{} response code {}", tag, code);
    }
    if let Some(body) = output.get("output") {
        println!("\r{} {}", tag, raw_text(body));
    }
    if let Some(error) = output.get("error") {
        println!(
            "\r{} error {}: {}",
            tag,
            output.get("error_code").map(String::as_str).unwrap_or("?"),
            error
        );
    }
    print!("\r>>> ");
    let _ = io::stdout().flush();
}

fn parse_id(arg: Option<&str>) -> Option<TaskId> {
    match arg.map(str::parse::<u64>) {
        Some(Ok(id)) => Some(TaskId(id)),
        Some(Err(_)) => {
            println!("\rInvalid task ID format.");
            None
        }
        None => {
            println!("\rTask ID must be specified.");
            None
        }
    }
}

fn report<T>(result: Result<T>) {
    if let Err(e) = result {
        println!("\r{}", e);
    }
}

/// Runs one command line. Returns false when the user asked to quit.
fn execute_command(manager: &mut TaskManager, input: &str) -> bool {
    let input = input.trim();
    let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
    let rest = rest.trim();

    match command {
        "run" | "detached" => {
            if rest.is_empty() {
                println!("\rCommand to execute must be specified.");
                return true;
            }
            let mut options = Options::new();
            options.insert("stdin".to_string(), "1".to_string());
            if command == "detached" {
                options.insert("detached".to_string(), "1".to_string());
            }
            match manager.launch_process(OWNER, rest, options, 0, print_process_output) {
                Ok(id) => println!("\rStarted task {}", id),
                Err(e) => println!("\r{}", e),
            }
        }
        "url" => {
            if rest.is_empty() {
                println!("\rURL must be specified.");
                return true;
            }
            match manager.fetch_url(OWNER, rest, Options::new(), 30_000, print_url_output) {
                Ok(id) => println!("\rStarted task {}", id),
                Err(e) => println!("\r{}", e),
            }
        }
        "stdin" => {
            let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
            if let Some(id) = parse_id(Some(id).filter(|s| !s.is_empty())) {
                report(manager.send_stdin(id, format!("{}\n", text).as_bytes()));
            }
        }
        "eof" => {
            if let Some(id) = parse_id(rest.split_whitespace().next()) {
                report(manager.close_stdin(id));
            }
        }
        "signal" => {
            let mut args = rest.split_whitespace();
            if let Some(id) = parse_id(args.next()) {
                match args.next() {
                    Some(signal) => report(manager.signal_by_name(id, signal)),
                    None => println!("\rSignal must be specified."),
                }
            }
        }
        "close" => {
            if let Some(id) = parse_id(rest.split_whitespace().next()) {
                if manager.close(id) {
                    println!("\rTask {} closed", id);
                } else {
                    println!("\rTask {} not found", id);
                }
            }
        }
        "list" => {
            let tasks = manager.tasks();
            if tasks.is_empty() {
                println!("\rNo active tasks");
            } else {
                println!("\r\tTask list:");
                println!("\r{}\t {} \t {} \t {}", "ID", "Kind", "Owner", "Description");
                println!("\r{}", "-".repeat(60));
                for task in tasks {
                    println!("\r{}", task);
                }
            }
        }
        "exit" => {
            println!("\rExiting the program...");
            return false;
        }
        "" => {}
        other => println!("\rUnknown command: {}. Please try again.", other),
    }
    true
}

pub fn run_cli(mut manager: TaskManager) -> Result<()> {
    println!("Task hooks started. Enter a command or 'exit' to quit.");
    let _raw = RawMode::enable()?;
    let mut commands_history: Vec<String> = Vec::new();
    let mut history_index = 0;
    let mut input = String::new();

    print!("\r>>> ");
    io::stdout().flush()?;
    loop {
        manager.run_once(LOOP_WAIT)?;
        if !event::poll(KEY_POLL)? {
            continue;
        }
        let Event::Key(key_event) = event::read()? else {
            continue;
        };
        if key_event.kind != KeyEventKind::Press {
            continue;
        }

        match key_event.code {
            KeyCode::Enter => {
                println!();
                if !input.trim().is_empty() {
                    commands_history.push(input.clone());
                }
                history_index = commands_history.len();
                if !execute_command(&mut manager, &input) {
                    break;
                }
                input.clear();
                print!("\r>>> ");
            }
            KeyCode::Up => {
                history_index = history_index.saturating_sub(1);
                if let Some(command) = commands_history.get(history_index) {
                    input = command.clone();
                    redraw(&input)?;
                }
            }
            KeyCode::Down => {
                if history_index < commands_history.len() {
                    history_index += 1;
                }
                input = commands_history
                    .get(history_index)
                    .cloned()
                    .unwrap_or_default();
                redraw(&input)?;
            }
            KeyCode::Char(c) => {
                input.push(c);
                print!("{}", c);
            }
            KeyCode::Backspace => {
                input.pop();
                redraw(&input)?;
            }
            _ => {}
        }
        io::stdout().flush()?;
    }

    manager.close_all();
    Ok(())
}

fn redraw(input: &str) -> io::Result<()> {
    execute!(
        io::stdout(),
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine)
    )?;
    print!(">>> {}", input);
    Ok(())
}
