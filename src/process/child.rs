//! What runs in the forked child before (and instead of) `exec`.
//!
//! Everything that needs allocation is prepared in the parent, so the child
//! only duplicates descriptors and calls `execvp`. Setup failures end the
//! child with status 1; the child never returns into the caller's code.

use std::ffi::{c_char, CString};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::AtomicBool;

use crate::models::options::{Options, ProcessOptions};
use crate::process::pipes::{ChildEnds, ParentEnds};
use crate::transfer::{self, TransferSettings};

/// Function run inside the child for `func:` commands; returns the exit code.
pub type ChildFn = Box<dyn FnOnce() -> i32>;

const EXIT_FAILURE: i32 = 1;

pub struct PreparedExec {
    argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    error_message: Vec<u8>,
}

impl PreparedExec {
    pub fn argv(&self) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }
}

pub enum ChildProgram {
    Exec(PreparedExec),
    Url {
        url: String,
        options: Options,
        settings: TransferSettings,
    },
    Function(ChildFn),
    Invalid {
        message: Vec<u8>,
    },
}

impl ChildProgram {
    pub fn prepare(
        command: &str,
        parsed: &ProcessOptions,
        options: &Options,
        settings: TransferSettings,
        function: Option<ChildFn>,
    ) -> Self {
        let error_message = format!("Error with command '{}'\n", command).into_bytes();

        if let Some(url) = command.strip_prefix("url:") {
            return ChildProgram::Url {
                url: url.trim_start_matches(' ').to_string(),
                options: options.clone(),
                settings,
            };
        }
        if command.starts_with("func:") {
            return match function {
                Some(function) => ChildProgram::Function(function),
                None => ChildProgram::Invalid {
                    message: error_message,
                },
            };
        }

        // explicit argN keys win over splitting the command line
        let words = if parsed.args.is_empty() {
            shlex::split(command)
        } else {
            Some(
                std::iter::once(command.to_string())
                    .chain(parsed.args.iter().cloned())
                    .collect(),
            )
        };
        let mut words = match words {
            Some(words) if !words.is_empty() => words,
            _ => {
                return ChildProgram::Invalid {
                    message: error_message,
                }
            }
        };
        words[0] = expand_home(&words[0]);

        let argv: Option<Vec<CString>> = words.into_iter().map(|w| CString::new(w).ok()).collect();
        match argv {
            Some(argv) => {
                let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|a| a.as_ptr()).collect();
                argv_ptrs.push(ptr::null());
                ChildProgram::Exec(PreparedExec {
                    argv,
                    argv_ptrs,
                    error_message,
                })
            }
            None => ChildProgram::Invalid {
                message: error_message,
            },
        }
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => {
            let mut expanded = home.into_os_string().into_string().unwrap_or_default();
            if expanded.is_empty() {
                return path.to_string();
            }
            expanded.push_str(rest);
            expanded
        }
        None => path.to_string(),
    }
}

fn install(source: Option<&OwnedFd>, null: &OwnedFd, target: RawFd) -> bool {
    let fd = source.unwrap_or(null).as_raw_fd();
    unsafe { libc::dup2(fd, target) >= 0 }
}

fn write_stderr(message: &[u8]) {
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    }
}

fn exit_now(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

/// Entry point of the forked child.
pub fn run_child(parent: ParentEnds, child: ChildEnds, program: ChildProgram) -> ! {
    drop(parent);
    unsafe {
        let _ = libc::setuid(libc::getuid());
        // the parent may ignore SIGPIPE; exec'd programs expect the default
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let ChildEnds {
        stdin,
        stdout,
        stderr,
        null,
    } = child;
    let installed = install(stdin.as_ref(), &null, libc::STDIN_FILENO)
        && install(stdout.as_ref(), &null, libc::STDOUT_FILENO)
        && install(stderr.as_ref(), &null, libc::STDERR_FILENO);
    drop((stdin, stdout, stderr, null));
    if !installed {
        exit_now(EXIT_FAILURE);
    }

    let rc = match program {
        ChildProgram::Exec(exec) => {
            unsafe {
                libc::execvp(exec.argv_ptrs[0], exec.argv_ptrs.as_ptr());
            }
            write_stderr(&exec.error_message);
            EXIT_FAILURE
        }
        ChildProgram::Url {
            url,
            options,
            settings,
        } => transfer::download(&url, &options, None, &settings, &AtomicBool::new(false)),
        ChildProgram::Function(function) => function(),
        ChildProgram::Invalid { message } => {
            write_stderr(&message);
            EXIT_FAILURE
        }
    };

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    exit_now(rc)
}
