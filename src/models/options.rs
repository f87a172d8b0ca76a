use std::collections::BTreeMap;

/// String key/value options given when a task is registered.
pub type Options = BTreeMap<String, String>;

/// Response metadata and body written by a URL transfer.
pub type OutputMap = BTreeMap<String, String>;

/// Process-related keys of an [`Options`] map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    pub detached: bool,
    pub stdin: bool,
    pub buffer_flush: usize,
    /// Values of `arg1`, `arg2`, ... up to the first missing index.
    pub args: Vec<String>,
}

impl ProcessOptions {
    pub fn from_options(options: &Options, capacity: usize) -> Self {
        let buffer_flush = options
            .get("buffer_flush")
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|n| (1..=capacity).contains(n))
            .unwrap_or(capacity);

        let mut args = Vec::new();
        while let Some(arg) = options.get(&format!("arg{}", args.len() + 1)) {
            args.push(arg.clone());
        }

        ProcessOptions {
            detached: options.contains_key("detached"),
            stdin: options.contains_key("stdin"),
            buffer_flush,
            args,
        }
    }
}
