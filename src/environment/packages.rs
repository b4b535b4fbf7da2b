//! Installed-package listing and bulk installation through the package manager

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;

use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::manifest::package_key;
use super::runtime::Interpreter;
use crate::error::{Result, SupervisorError};

/// Lines of installer stderr kept for the failure message
const STDERR_TAIL_LINES: usize = 20;

/// Parse `pip list --format=freeze` output into normalized package names
pub fn parse_installed(listing: &str) -> HashSet<String> {
    listing
        .lines()
        .map(|line| normalize_name(&package_key(line)))
        .filter(|name| !name.is_empty())
        .collect()
}

/// Runs of `-`, `_` and `.` are equivalent in package names (PEP 503)
pub fn normalize_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    let mut in_separator = false;
    for c in key.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                name.push('-');
            }
            in_separator = true;
        } else {
            name.push(c);
            in_separator = false;
        }
    }
    name
}

/// Query the interpreter's package manager for installed packages
pub async fn list_installed(interpreter: &Interpreter) -> Result<HashSet<String>> {
    let output = interpreter
        .run(["-m", "pip", "list", "--format=freeze"])
        .await?;
    if !output.status.success() {
        return Err(SupervisorError::Io(std::io::Error::other(format!(
            "pip list exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }
    Ok(parse_installed(&String::from_utf8_lossy(&output.stdout)))
}

pub fn is_installed(specifier: &str, installed: &HashSet<String>) -> bool {
    installed.contains(&normalize_name(&package_key(specifier)))
}

/// Split declared specifiers into (installed, missing), preserving manifest order
pub fn classify(declared: &[String], installed: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    declared
        .iter()
        .cloned()
        .partition(|spec| is_installed(spec, installed))
}

/// Bulk-install the manifest through `index_url`.
///
/// `on_output` is called for every stdout line so callers can report progress.
pub async fn install_requirements(
    interpreter: &Interpreter,
    manifest: &Path,
    index_url: &str,
    mut on_output: impl FnMut(&str),
) -> Result<()> {
    info!(
        "Installing dependencies from {} via {}",
        manifest.display(),
        index_url
    );

    let mut child = Command::new(&interpreter.program)
        .args(["-m", "pip", "install", "-i", index_url, "-r"])
        .arg(manifest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SupervisorError::DependencyInstallFailure(e.to_string()))?;

    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut tail = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                error!("[pip] {line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail.join("\n")
        })
    });

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("[pip] {line}");
            on_output(&line);
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| SupervisorError::DependencyInstallFailure(e.to_string()))?;
    let stderr_tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if status.success() {
        info!("Dependencies installed");
        Ok(())
    } else {
        let detail = stderr_tail.trim();
        Err(SupervisorError::DependencyInstallFailure(if detail.is_empty() {
            format!("pip install exited with {status}")
        } else {
            format!("pip install exited with {status}: {detail}")
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_case_insensitive_name() {
        let declared: Vec<String> = crate::environment::manifest::parse_manifest(
            "requests==2.0\n# comment\n\nnumpy\n",
        );
        let installed = parse_installed("requests==2.0\r\n");
        let (present, missing) = classify(&declared, &installed);
        assert_eq!(present, vec!["requests==2.0"]);
        assert_eq!(missing, vec!["numpy"]);
    }

    #[test]
    fn installed_listing_ignores_versions_and_case() {
        let installed = parse_installed("Flask==3.0.0\nPyYAML==6.0.1\n\n");
        assert!(installed.contains("flask"));
        assert!(installed.contains("pyyaml"));
        assert_eq!(installed.len(), 2);

        let declared = vec!["flask>=2".to_string(), "pyyaml".to_string()];
        let (present, missing) = classify(&declared, &installed);
        assert_eq!(present.len(), 2);
        assert!(missing.is_empty());
    }

    #[test]
    fn separators_are_interchangeable() {
        assert_eq!(normalize_name("flask_cors"), "flask-cors");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_name("a-_.b"), "a-b");

        let installed = parse_installed("Flask-Cors==4.0.0\nzope.interface==6.1\n");
        let declared = vec![
            "flask_cors".to_string(),
            "Zope_Interface>=6".to_string(),
            "ruamel.yaml".to_string(),
        ];
        let (present, missing) = classify(&declared, &installed);
        assert_eq!(present, vec!["flask_cors", "Zope_Interface>=6"]);
        assert_eq!(missing, vec!["ruamel.yaml"]);
    }
}
