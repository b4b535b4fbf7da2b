//! Runtime interpreter discovery and version detection

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Output, Stdio};

use log::{debug, info};
use regex::Regex;
use tokio::process::Command;

/// Reported when the interpreter's version output cannot be parsed
pub const UNKNOWN_VERSION: &str = "unknown version";

/// A located interpreter executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    /// Candidate name that matched (e.g. `python3`)
    pub name: String,
    pub program: PathBuf,
}

impl Interpreter {
    /// Run the interpreter with `args`, capturing both output streams
    pub async fn run<I, S>(&self, args: I) -> std::io::Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
    }

    /// Combined stdout and stderr of the version query
    pub async fn version_output(&self, version_flag: &str) -> std::io::Result<String> {
        let output = self.run([version_flag]).await?;
        Ok(combined_output(&output))
    }
}

/// Probe candidates in priority order; the first one answering the version flag wins
pub async fn find_interpreter(candidates: &[String], version_flag: &str) -> Option<Interpreter> {
    for name in candidates {
        let program = match which::which(name) {
            Ok(path) => path,
            Err(e) => {
                debug!("Interpreter candidate {name} not found: {e}");
                continue;
            }
        };

        match Command::new(&program)
            .arg(version_flag)
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                info!("Using interpreter {name} at {}", program.display());
                return Some(Interpreter {
                    name: name.clone(),
                    program,
                });
            }
            Ok(output) => debug!("{name} {version_flag} exited with {}", output.status),
            Err(e) => debug!("{name} {version_flag} failed to run: {e}"),
        }
    }
    None
}

/// Extract the version captured by `pattern`, or the unknown-version sentinel
pub fn parse_version(output: &str, pattern: &Regex) -> String {
    pattern
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}

/// Older interpreters print their version on stderr
pub fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}
