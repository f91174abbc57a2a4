//! Caddy binary installation
//!
//! Downloads the official release archive for this platform into a temp
//! file and extracts just the `caddy` executable next to the managed
//! Caddyfile.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CADDY_VERSION: &str = "2.10.2";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("no Caddy release for {os}/{arch}")]
    UnsupportedPlatform { os: &'static str, arch: &'static str },
    #[error("download from {url} failed: {message}")]
    Download { url: String, message: String },
    #[error("unrecognized archive format")]
    UnknownArchive,
    #[error("archive does not contain {0}")]
    BinaryMissing(String),
    #[error("archive is corrupt: {0}")]
    Corrupt(String),
    #[error("failed to write Caddy binary: {0}")]
    Io(#[from] std::io::Error),
}

/// Release archive URL for the current platform
pub fn release_url() -> Result<String, InstallError> {
    release_url_for(std::env::consts::OS, std::env::consts::ARCH)
}

fn release_url_for(os: &'static str, arch: &'static str) -> Result<String, InstallError> {
    let (platform, ext) = match os {
        "windows" => ("windows", "zip"),
        "linux" => ("linux", "tar.gz"),
        "macos" => ("mac", "tar.gz"),
        _ => return Err(InstallError::UnsupportedPlatform { os, arch }),
    };
    let arch_name = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        _ => return Err(InstallError::UnsupportedPlatform { os, arch }),
    };

    Ok(format!(
        "https://github.com/caddyserver/caddy/releases/download/v{v}/caddy_{v}_{p}_{a}.{e}",
        v = CADDY_VERSION,
        p = platform,
        a = arch_name,
        e = ext
    ))
}

/// Make sure the Caddy binary exists at `binary`, downloading it if needed.
/// Returns true when a download happened.
pub async fn ensure_installed(binary: &Path, url: Option<&str>) -> Result<bool, InstallError> {
    if binary.is_file() {
        debug!(path = %binary.display(), "Caddy binary present");
        return Ok(false);
    }

    let url = match url {
        Some(url) => url.to_string(),
        None => release_url()?,
    };
    info!(url = %url, dest = %binary.display(), "Downloading Caddy");

    let dir = binary
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let staged = download(&url, dir).await?;
    let file_name = binary
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| crate::config::CADDY_BINARY_NAME.to_string());

    let dest = binary.to_path_buf();
    tokio::task::spawn_blocking(move || {
        // `staged` is deleted when this closure returns
        let archive = staged.reopen()?;
        install_from_reader(archive, &file_name, &dest)
    })
    .await
    .map_err(|e| InstallError::Io(std::io::Error::other(e)))??;

    info!(path = %binary.display(), version = CADDY_VERSION, "Caddy installed");
    Ok(true)
}

/// Stream `url` into a temp file inside `dir`
async fn download(url: &str, dir: &Path) -> Result<tempfile::NamedTempFile, InstallError> {
    let download_err = |message: String| InstallError::Download {
        url: url.to_string(),
        message,
    };

    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| download_err(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| download_err(e.to_string()))?;
    if !response.status().is_success() {
        return Err(download_err(format!("HTTP {}", response.status())));
    }

    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    let mut total = 0usize;
    while let Some(chunk) = response.chunk().await.map_err(|e| download_err(e.to_string()))? {
        staged.write_all(&chunk)?;
        total += chunk.len();
    }
    staged.flush()?;

    debug!(bytes = total, path = %staged.path().display(), "Caddy archive downloaded");
    Ok(staged)
}

/// Extract the entry named `file_name` from an in-memory zip or tar.gz archive into `dest`
pub fn install_from_archive(archive: &[u8], file_name: &str, dest: &Path) -> Result<PathBuf, InstallError> {
    install_from_reader(Cursor::new(archive), file_name, dest)
}

/// Extract the entry named `file_name` from a zip or tar.gz archive into `dest`.
/// The archive kind is detected from its magic bytes.
pub fn install_from_reader<R: Read + Seek>(
    mut archive: R,
    file_name: &str,
    dest: &Path,
) -> Result<PathBuf, InstallError> {
    let mut magic = Vec::with_capacity(ZIP_MAGIC.len());
    archive.by_ref().take(ZIP_MAGIC.len() as u64).read_to_end(&mut magic)?;
    archive.seek(SeekFrom::Start(0))?;

    let contents = if magic.starts_with(&ZIP_MAGIC) {
        extract_from_zip(archive, file_name)?
    } else if magic.starts_with(&GZIP_MAGIC) {
        extract_from_tarball(archive, file_name)?
    } else {
        return Err(InstallError::UnknownArchive);
    };

    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&contents)?;
    tmp.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755))?;
    }

    tmp.persist(dest).map_err(|e| InstallError::Io(e.error))?;
    Ok(dest.to_path_buf())
}

fn entry_matches(path: &Path, file_name: &str) -> bool {
    path.file_name().map(|n| n == file_name).unwrap_or(false)
}

fn extract_from_zip<R: Read + Seek>(data: R, file_name: &str) -> Result<Vec<u8>, InstallError> {
    let mut archive = zip::ZipArchive::new(data).map_err(|e| InstallError::Corrupt(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| InstallError::Corrupt(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let Some(path) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        if entry_matches(&path, file_name) {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }

    Err(InstallError::BinaryMissing(file_name.to_string()))
}

fn extract_from_tarball<R: Read>(data: R, file_name: &str) -> Result<Vec<u8>, InstallError> {
    let gz = flate2::read::GzDecoder::new(data);
    let mut archive = tar::Archive::new(gz);

    let entries = archive.entries().map_err(|e| InstallError::Corrupt(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| InstallError::Corrupt(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(|e| InstallError::Corrupt(e.to_string()))?.into_owned();
        if entry_matches(&path, file_name) {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }

    Err(InstallError::BinaryMissing(file_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;

    const BINARY: &[u8] = b"#!/bin/sh\necho caddy\n";

    fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn tar_gz_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_release_urls() {
        assert_eq!(
            release_url_for("linux", "x86_64").unwrap(),
            "https://github.com/caddyserver/caddy/releases/download/v2.10.2/caddy_2.10.2_linux_amd64.tar.gz"
        );
        assert!(release_url_for("windows", "x86_64").unwrap().ends_with("_windows_amd64.zip"));
        assert!(release_url_for("macos", "aarch64").unwrap().ends_with("_mac_arm64.tar.gz"));
        assert!(matches!(
            release_url_for("solaris", "x86_64"),
            Err(InstallError::UnsupportedPlatform { .. })
        ));
    }

    #[test]
    fn test_install_from_zip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("bin").join("caddy.exe");
        let archive = zip_archive(&[("LICENSE", b"license"), ("caddy.exe", BINARY)]);

        install_from_archive(&archive, "caddy.exe", &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), BINARY);
    }

    #[test]
    fn test_install_from_tarball() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("caddy");
        let archive = tar_gz_archive(&[("README.md", b"readme"), ("caddy", BINARY)]);

        install_from_archive(&archive, "caddy", &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), BINARY);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_install_from_staged_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("caddy");

        let mut staged = tempfile::NamedTempFile::new_in(tmp.path()).unwrap();
        staged
            .write_all(&tar_gz_archive(&[("caddy", BINARY)]))
            .unwrap();

        install_from_reader(staged.reopen().unwrap(), "caddy", &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), BINARY);
    }

    #[test]
    fn test_install_rejects_archive_without_binary() {
        let tmp = tempfile::TempDir::new().unwrap();
        let archive = tar_gz_archive(&[("README.md", b"readme")]);

        let err = install_from_archive(&archive, "caddy", &tmp.path().join("caddy")).unwrap_err();
        assert!(matches!(err, InstallError::BinaryMissing(_)));
        assert!(!tmp.path().join("caddy").exists());
    }

    #[test]
    fn test_install_rejects_unknown_format() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = install_from_archive(b"not an archive", "caddy", &tmp.path().join("caddy")).unwrap_err();
        assert!(matches!(err, InstallError::UnknownArchive));
    }

    #[tokio::test]
    async fn test_existing_binary_skips_download() {
        let tmp = tempfile::TempDir::new().unwrap();
        let binary = tmp.path().join("caddy");
        std::fs::write(&binary, BINARY).unwrap();

        // unreachable URL proves no request is made
        let downloaded = ensure_installed(&binary, Some("http://127.0.0.1:1/caddy.tar.gz"))
            .await
            .unwrap();
        assert!(!downloaded);
    }
}
