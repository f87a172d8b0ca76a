//! Blocking HTTP transfer shared by the URL worker thread and `url:`
//! process commands.
//!
//! Results are reported through integer return codes so they can double as
//! a child exit status.

use std::error::Error as StdError;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use reqwest::blocking::{Body, Client, Response};
use reqwest::redirect::Policy;
use reqwest::{Method, Proxy, Url};

use crate::config::HookConfig;
use crate::models::options::{Options, OutputMap};

pub const RC_OK: i32 = 0;
pub const RC_INVALID_URL: i32 = 1;
pub const RC_TRANSFER_ERROR: i32 = 2;
pub const RC_CLIENT_ERROR: i32 = 3;
pub const RC_FILE_ERROR: i32 = 4;
pub const RC_THREAD_ERROR: i32 = 5;
pub const RC_TIMEOUT: i32 = 6;

const BODY_CHUNK: usize = 16 * 1024;

const KNOWN_OPTIONS: &[&str] = &[
    "file_in",
    "file_out",
    "httpheader",
    "useragent",
    "followlocation",
    "maxredirs",
    "postfields",
    "customrequest",
    "connecttimeout_ms",
];

/// Client-wide settings derived from the manager configuration.
#[derive(Debug, Clone, Default)]
pub struct TransferSettings {
    pub user_agent: String,
    pub follow_location: bool,
    pub proxy: Option<String>,
    pub timeout: Option<Duration>,
}

impl TransferSettings {
    pub fn from_config(config: &HookConfig, timeout_ms: u64) -> Self {
        TransferSettings {
            user_agent: config.user_agent.clone(),
            follow_location: config.follow_location,
            proxy: config.proxy.clone(),
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        }
    }
}

struct TransferFailure {
    code: i32,
    message: String,
}

fn failure(code: i32, message: impl Into<String>) -> TransferFailure {
    TransferFailure {
        code,
        message: message.into(),
    }
}

/// Formats an error with its whole source chain.
fn describe(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Downloads `url`. With an output map, response metadata and the body land
/// in it (the body only when `file_out` is not set); without one, the body
/// goes to stdout and errors to stderr.
pub fn download(
    url: &str,
    options: &Options,
    mut output: Option<&mut OutputMap>,
    settings: &TransferSettings,
    cancel: &AtomicBool,
) -> i32 {
    match transfer(url, options, output.as_deref_mut(), settings, cancel) {
        Ok(()) => RC_OK,
        Err(err) => {
            match output {
                Some(map) => {
                    map.insert("error".to_string(), err.message);
                }
                None => {
                    let _ = writeln!(io::stderr(), "{}", err.message);
                }
            }
            err.code
        }
    }
}

fn option_flag(options: &Options, key: &str) -> Option<bool> {
    options.get(key).map(|value| {
        let value = value.trim();
        !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
    })
}

fn option_number(options: &Options, key: &str) -> Option<u64> {
    options.get(key).and_then(|value| value.trim().parse().ok())
}

fn build_client(options: &Options, settings: &TransferSettings) -> reqwest::Result<Client> {
    let user_agent = options
        .get("useragent")
        .cloned()
        .unwrap_or_else(|| settings.user_agent.clone());
    let follow = option_flag(options, "followlocation").unwrap_or(settings.follow_location);
    let policy = match (follow, option_number(options, "maxredirs")) {
        (false, _) => Policy::none(),
        (true, Some(max)) => Policy::limited(max as usize),
        (true, None) => Policy::default(),
    };

    let mut builder = Client::builder()
        .user_agent(user_agent)
        .redirect(policy)
        .timeout(settings.timeout);
    if let Some(ms) = option_number(options, "connecttimeout_ms").filter(|ms| *ms > 0) {
        builder = builder.connect_timeout(Duration::from_millis(ms));
    }
    // proxies come from the configuration only, never from the environment
    builder = match settings.proxy.as_deref().filter(|p| !p.is_empty()) {
        Some(proxy) => builder.proxy(Proxy::all(proxy)?),
        None => builder.no_proxy(),
    };
    builder.build()
}

fn request_method(options: &Options) -> Result<Method, TransferFailure> {
    if let Some(custom) = options.get("customrequest").filter(|m| !m.is_empty()) {
        return Method::from_bytes(custom.as_bytes())
            .map_err(|err| failure(RC_TRANSFER_ERROR, format!("invalid request \"{}\": {}", custom, err)));
    }
    if options.contains_key("postfields") {
        Ok(Method::POST)
    } else if options.contains_key("file_in") {
        Ok(Method::PUT)
    } else {
        Ok(Method::GET)
    }
}

fn open_file(path: &str, write: bool) -> Result<File, TransferFailure> {
    let opened = if write {
        File::create(path)
    } else {
        File::open(path)
    };
    opened.map_err(|err| failure(RC_FILE_ERROR, format!("file \"{}\" not found: {}", path, err)))
}

fn response_headers(response: &Response) -> String {
    let mut headers = format!("{:?} {}\r\n", response.version(), response.status());
    for (name, value) in response.headers() {
        headers.push_str(name.as_str());
        headers.push_str(": ");
        headers.push_str(&String::from_utf8_lossy(value.as_bytes()));
        headers.push_str("\r\n");
    }
    headers
}

fn transfer(
    url: &str,
    options: &Options,
    mut output: Option<&mut OutputMap>,
    settings: &TransferSettings,
    cancel: &AtomicBool,
) -> Result<(), TransferFailure> {
    for key in options.keys() {
        if !KNOWN_OPTIONS.contains(&key.as_str()) {
            debug!("url option \"{}\" ignored", key);
        }
    }

    let parsed = Url::parse(url)
        .map_err(|err| failure(RC_INVALID_URL, format!("invalid URL \"{}\": {}", url, err)))?;
    let client = build_client(options, settings)
        .map_err(|err| failure(RC_CLIENT_ERROR, format!("cannot create HTTP client: {}", describe(&err))))?;
    let method = request_method(options)?;

    let mut request = client.request(method, parsed);
    if let Some(lines) = options.get("httpheader") {
        for line in lines.lines() {
            match line.split_once(':') {
                Some((name, value)) => request = request.header(name.trim(), value.trim()),
                None if line.trim().is_empty() => {}
                None => debug!("malformed header line \"{}\" ignored", line),
            }
        }
    }
    if let Some(fields) = options.get("postfields") {
        request = request.body(fields.clone());
    } else if let Some(path) = options.get("file_in") {
        request = request.body(Body::from(open_file(path, false)?));
    }
    let mut file_out = match options.get("file_out") {
        Some(path) => Some(open_file(path, true)?),
        None => None,
    };

    let mut response = request
        .send()
        .map_err(|err| failure(RC_TRANSFER_ERROR, format!("transfer error: {}", describe(&err))))?;

    if let Some(map) = output.as_deref_mut() {
        map.insert(
            "response_code".to_string(),
            response.status().as_u16().to_string(),
        );
        map.insert("headers".to_string(), response_headers(&response));
    }

    let mut body = Vec::new();
    let mut chunk = vec![0u8; BODY_CHUNK];
    let stdout = io::stdout();
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(failure(RC_TRANSFER_ERROR, "transfer cancelled"));
        }
        let n = match response.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(failure(RC_TRANSFER_ERROR, format!("transfer error: {}", describe(&err))));
            }
        };
        let data = &chunk[..n];
        if let Some(file) = file_out.as_mut() {
            file.write_all(data)
                .map_err(|err| failure(RC_FILE_ERROR, format!("cannot write output file: {}", err)))?;
        } else if output.is_some() {
            body.extend_from_slice(data);
        } else {
            stdout
                .lock()
                .write_all(data)
                .map_err(|err| failure(RC_TRANSFER_ERROR, format!("cannot write output: {}", err)))?;
        }
    }

    if file_out.is_none() {
        if let Some(map) = output {
            map.insert("output".to_string(), String::from_utf8_lossy(&body).into_owned());
        }
    }
    Ok(())
}
