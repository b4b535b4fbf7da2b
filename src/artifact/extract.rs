//! Archive unpacking for archive-form artifacts
//!
//! Zip and gzip-compressed tar are accepted; the format comes from the
//! leading magic bytes, not the file name.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::info;
use tar::Archive;

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn detect(header: &[u8]) -> Option<Self> {
        match header {
            [b'P', b'K', 0x03, 0x04, ..] | [b'P', b'K', 0x05, 0x06, ..] => Some(Self::Zip),
            [0x1f, 0x8b, ..] => Some(Self::TarGz),
            _ => None,
        }
    }
}

fn sniff(path: &Path) -> Result<ArchiveFormat> {
    let mut header = [0u8; 4];
    let mut file = std::fs::File::open(path)?;
    let read = file.read(&mut header)?;
    ArchiveFormat::detect(&header[..read]).ok_or_else(|| {
        SupervisorError::ExtractionFailure(format!(
            "{} is neither a zip nor a gzip archive",
            path.display()
        ))
    })
}

fn unpack(archive: &Path, dest: &Path) -> Result<ArchiveFormat> {
    let format = sniff(archive)?;
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(archive)?;
    match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| SupervisorError::ExtractionFailure(format!("invalid zip: {e}")))?;
            zip.extract(dest)
                .map_err(|e| SupervisorError::ExtractionFailure(format!("zip extraction: {e}")))?;
        }
        ArchiveFormat::TarGz => {
            let mut tar = Archive::new(GzDecoder::new(file));
            tar.unpack(dest)
                .map_err(|e| SupervisorError::ExtractionFailure(format!("tar extraction: {e}")))?;
        }
    }
    Ok(format)
}

/// Unpack `archive` into `dest` on the blocking pool
pub async fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let archive_path = archive.to_path_buf();
    let dest_path = dest.to_path_buf();
    let format = tokio::task::spawn_blocking(move || unpack(&archive_path, &dest_path))
        .await
        .map_err(|e| SupervisorError::ExtractionFailure(format!("extraction task failed: {e}")))??;
    info!("Extracted {format:?} archive into {}", dest.display());
    Ok(())
}

/// Fail with the first required entry absent under `root`
pub async fn verify_entries(root: &Path, required: &[String]) -> Result<()> {
    for entry in required {
        let path: PathBuf = root.join(entry);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(SupervisorError::ExtractionFailure(format!(
                "archive is missing expected entry '{entry}'"
            )));
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn detects_formats_by_magic() {
        assert_eq!(ArchiveFormat::detect(b"PK\x03\x04rest"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect(&[0x1f, 0x8b, 8, 0]), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(b"MZ\x90\x00"), None);
        assert_eq!(ArchiveFormat::detect(b""), None);
    }

    #[tokio::test]
    async fn extracts_zip_and_checks_structure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.bin");
        write_zip(
            &archive,
            &[("app/", b""), ("app/app.py", b"print('hi')"), ("static/index.html", b"<html/>")],
        );
        let dest = dir.path().join("out");
        extract_archive(&archive, &dest).await.unwrap();
        assert_eq!(std::fs::read(dest.join("app/app.py")).unwrap(), b"print('hi')");
        verify_entries(&dest, &["app".into(), "static".into()]).await.unwrap();
    }

    #[tokio::test]
    async fn extracts_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.bin");
        write_tar_gz(&archive, &[("app/app.py", b"x = 1")]);
        let dest = dir.path().join("out");
        extract_archive(&archive, &dest).await.unwrap();
        assert_eq!(std::fs::read(dest.join("app/app.py")).unwrap(), b"x = 1");

        let err = verify_entries(&dest, &["app".into(), "static".into()]).await.unwrap_err();
        assert!(err.to_string().contains("static"), "{err}");
    }

    #[tokio::test]
    async fn rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.bin");
        std::fs::write(&archive, b"not an archive").unwrap();
        let err = extract_archive(&archive, &dir.path().join("out")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ExtractionFailure(_)));
    }
}
