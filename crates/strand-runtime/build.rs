//! Build script for strand-runtime
//!
//! Produces `OUT_DIR/strand_merged_config.rs`, the compile-time defaults
//! behind `config::defaults`:
//! 1. Start with the library defaults below
//! 2. If `STRAND_CONFIG_RS` names a file, read its `pub const` lines
//! 3. Known names override the defaults, unknown names produce a warning
//!
//! A user file only lists what it wants to change:
//!
//! ```text
//! pub const THREADS: usize = 4;
//! pub const MAX_WAIT_MS: u64 = 500;
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

const USER_CONFIG_ENV: &str = "STRAND_CONFIG_RS";

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
    doc: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "THREADS",
        rust_type: "usize",
        default_value: "1",
        doc: "Worker threads, including the caller in inject mode",
    },
    ConfigParam {
        name: "USE_CALLER",
        rust_type: "bool",
        default_value: "true",
        doc: "Constructing thread becomes one of the workers",
    },
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "1024 * 1024",
        doc: "Fiber stack size in bytes",
    },
    ConfigParam {
        name: "PARK_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "100",
        doc: "Longest park of an idle worker without a reactor",
    },
    ConfigParam {
        name: "MAX_WAIT_MS",
        rust_type: "u64",
        default_value: "3000",
        doc: "Cap on a single epoll_wait",
    },
    ConfigParam {
        name: "EPOLL_BATCH",
        rust_type: "usize",
        default_value: "256",
        doc: "Readiness events drained per epoll_wait",
    },
    ConfigParam {
        name: "FD_TABLE_SIZE",
        rust_type: "usize",
        default_value: "64",
        doc: "Initial size of the per-descriptor context table",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("strand_merged_config.rs");

    let mut values: HashMap<&'static str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    let user_path = env::var(USER_CONFIG_ENV).ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                for unknown in merge_user_config(&content, &mut values) {
                    println!("cargo:warning=Unknown strand config parameter: {}", unknown);
                }
                println!("cargo:warning=Using custom strand config: {}", path);
            }
            Err(e) => {
                println!("cargo:warning=Failed to read {} ({}): {}", USER_CONFIG_ENV, path, e);
            }
        }
    }
    println!("cargo:rerun-if-env-changed={}", USER_CONFIG_ENV);

    let output = render(&values, user_path.as_deref());
    fs::write(&dest_path, output).expect("Failed to write merged config");
}

/// Apply every `pub const NAME: TYPE = VALUE;` line of `content`
///
/// Returns the names that are not configuration parameters.
fn merge_user_config(content: &str, values: &mut HashMap<&'static str, String>) -> Vec<String> {
    let mut unknown = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.starts_with("//") {
            continue;
        }
        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                values.insert(param.name, value);
            }
            None => unknown.push(name),
        }
    }
    unknown
}

fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?;
    let (name, rest) = rest.split_once(':')?;
    let (_ty, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    if value.is_empty() {
        return None;
    }
    Some((name.trim().to_string(), value.to_string()))
}

fn render(values: &HashMap<&'static str, String>, user_path: Option<&str>) -> String {
    let mut out = String::from("// Auto-generated by build.rs - do not edit\n");
    match user_path {
        Some(path) => out.push_str(&format!("// Library defaults merged with {}\n\n", path)),
        None => out.push_str("// Library defaults\n\n"),
    }
    for param in CONFIG_PARAMS {
        let value = values
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        out.push_str(&format!(
            "/// {}\npub const {}: {} = {};\n",
            param.doc, param.name, param.rust_type, value
        ));
    }
    out
}
