//! Dependency manifest parsing
//!
//! One specifier per line, e.g. `requests==2.31.0` or `numpy>=1.26`. Blank
//! lines and `#` comments are skipped. Comparison against the installed
//! package listing uses the bare, lower-cased package name.

use std::path::Path;

use crate::error::{Result, SupervisorError};

/// Characters that start a version constraint suffix
const CONSTRAINT_CHARS: &[char] = &['=', '<', '>', '~'];

/// Parse manifest text into the declared specifiers, in file order
pub fn parse_manifest(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Comparison key for a specifier: name before any constraint, lower-cased
pub fn package_key(specifier: &str) -> String {
    specifier
        .split(CONSTRAINT_CHARS)
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// Read and parse the manifest file
pub async fn load_manifest(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SupervisorError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_manifest(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        let declared = parse_manifest("requests==2.0\n# comment\n\n   \nnumpy\n");
        assert_eq!(declared, vec!["requests==2.0", "numpy"]);
    }

    #[test]
    fn handles_crlf_and_indentation() {
        let declared = parse_manifest("  Flask>=3.0\r\n\t# pinned below\r\npandas~=2.1\r\n");
        assert_eq!(declared, vec!["Flask>=3.0", "pandas~=2.1"]);
    }

    #[test]
    fn key_strips_constraints_and_lowercases() {
        assert_eq!(package_key("requests==2.0"), "requests");
        assert_eq!(package_key("Flask>=3.0"), "flask");
        assert_eq!(package_key("pandas~=2.1"), "pandas");
        assert_eq!(package_key("urllib3<2"), "urllib3");
        assert_eq!(package_key("PyYAML"), "pyyaml");
        assert_eq!(package_key("numpy >= 1.26"), "numpy");
    }

    #[tokio::test]
    async fn missing_manifest_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        let err = load_manifest(&path).await.unwrap_err();
        match err {
            SupervisorError::Manifest { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }
}
