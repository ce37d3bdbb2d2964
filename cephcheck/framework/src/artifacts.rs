// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fetching tools and images the harness needs on the local machine:
//! kubectl, the Go toolchain and libvirt base images.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use anyhow::{bail, Context};
use camino::Utf8Path;
use ring::digest::{Digest, SHA256};
use tracing::info;

const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct Downloader {
    timeout: Duration,
    backoff: backoff::ExponentialBackoff,
}

impl Default for Downloader {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            backoff: backoff::ExponentialBackoff {
                max_elapsed_time: Some(Duration::from_secs(300)),
                ..Default::default()
            },
        }
    }
}

impl Downloader {
    pub fn new(timeout: Duration, backoff: backoff::ExponentialBackoff) -> Self {
        Self { timeout, backoff }
    }

    /// Downloads `uri` into memory, retrying transport failures and error
    /// statuses with exponential backoff.
    pub fn fetch(&self, uri: &str) -> anyhow::Result<bytes::Bytes> {
        info!(timeout = ?self.timeout, "Downloading '{uri}'");
        let client = reqwest::blocking::ClientBuilder::new()
            .timeout(self.timeout)
            .build()?;
        let try_download = || {
            let request = client
                .get(uri)
                .build()
                // The same request would fail the same way on every retry.
                .map_err(|e| backoff::Error::permanent(e.into()))?;

            let response = client
                .execute(request)
                .map_err(|e| backoff::Error::transient(e.into()))?;
            if !response.status().is_success() {
                let err = anyhow::anyhow!(
                    "Downloading {uri} returned HTTP error {}",
                    response.status()
                );
                return Err(backoff::Error::transient(err));
            }
            Ok(response)
        };

        let log_retry = |error, wait| {
            info!(%error, "Downloading '{uri}' failed, trying again in {wait:?}...");
        };

        let bytes =
            backoff::retry_notify(self.backoff.clone(), try_download, log_retry)
                .map_err(|e| match e {
                    backoff::Error::Permanent(e) => e,
                    backoff::Error::Transient { err, .. } => err,
                })
                .with_context(|| format!("Failed to download '{uri}'"))?
                .bytes()?;

        Ok(bytes)
    }

    pub fn fetch_text(&self, uri: &str) -> anyhow::Result<String> {
        let bytes = self.fetch(uri)?;
        String::from_utf8(bytes.to_vec())
            .with_context(|| format!("'{uri}' did not return UTF-8 text"))
    }

    /// Downloads `uri` to `dest`, optionally checking its SHA-256 digest and
    /// marking it executable. A file already present at `dest` is kept if
    /// its digest matches (or no digest is given).
    pub fn fetch_to_file(
        &self,
        uri: &str,
        dest: &Utf8Path,
        sha256: Option<&str>,
        executable: bool,
    ) -> anyhow::Result<()> {
        if dest.exists() {
            match sha256 {
                None => {
                    info!(%dest, "Using existing download");
                    return Ok(());
                }
                Some(digest) if hash_equals(dest, digest).is_ok() => {
                    info!(%dest, "Existing download matches expected digest");
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let bytes = self.fetch(uri)?;
        let mut file = File::create(dest)
            .with_context(|| format!("creating download target {dest}"))?;
        file.write_all(&bytes)?;
        drop(file);

        if let Some(digest) = sha256 {
            hash_equals(dest, digest)?;
        }

        if executable {
            let mut perms = std::fs::metadata(dest)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(dest, perms)?;
        }

        Ok(())
    }

    /// Downloads a gzipped tarball and unpacks it under `dest_dir`.
    pub fn fetch_and_unpack(
        &self,
        uri: &str,
        dest_dir: &Utf8Path,
    ) -> anyhow::Result<()> {
        let bytes = self.fetch(uri)?;
        unpack_tar_gz(&bytes[..], dest_dir)
            .with_context(|| format!("unpacking '{uri}' into {dest_dir}"))
    }
}

/// Unpacks a gzipped tar stream under `dest_dir`.
pub fn unpack_tar_gz<R: Read>(reader: R, dest_dir: &Utf8Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    let gz = flate2::read::GzDecoder::new(reader);
    let mut archive = tar::Archive::new(gz);
    archive.set_preserve_permissions(true);
    archive.unpack(dest_dir)?;
    Ok(())
}

fn sha256_digest(file: &mut File) -> anyhow::Result<Digest> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);
    let mut context = ring::digest::Context::new(&SHA256);
    let mut buffer = [0; 8192];

    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        context.update(&buffer[..count]);
    }

    Ok(context.finish())
}

pub fn hash_equals(path: &Utf8Path, expected_digest: &str) -> anyhow::Result<()> {
    let mut file = File::open(path)?;
    let digest = hex::encode(sha256_digest(&mut file)?.as_ref());
    if !digest.eq_ignore_ascii_case(expected_digest) {
        bail!("Digest of {} was {}, expected {}", path, digest, expected_digest);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use flate2::{write::GzEncoder, Compression};

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn digest_check() {
        let (_guard, dir) = tempdir();
        let path = dir.join("blob");
        std::fs::write(&path, b"abc").unwrap();

        // SHA-256("abc")
        let expected =
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        hash_equals(&path, expected).unwrap();
        hash_equals(&path, &expected.to_uppercase()).unwrap();
        assert!(hash_equals(&path, &expected.replace('b', "c")).is_err());
    }

    #[test]
    fn tarballs_unpack_with_modes() {
        let (_guard, dir) = tempdir();

        let mut builder = tar::Builder::new(GzEncoder::new(
            Vec::new(),
            Compression::default(),
        ));
        let body = b"#!/bin/sh\necho go\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "go/bin/go", &body[..]).unwrap();
        let gz = builder.into_inner().unwrap().finish().unwrap();

        unpack_tar_gz(&gz[..], &dir).unwrap();
        let unpacked = dir.join("go/bin/go");
        assert_eq!(std::fs::read(&unpacked).unwrap(), body);
        let mode = std::fs::metadata(&unpacked).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn existing_files_are_reused_without_downloading() {
        let (_guard, dir) = tempdir();
        let dest = dir.join("kubectl");
        std::fs::write(&dest, b"abc").unwrap();

        // The URI is unroutable, so any attempt to download would fail.
        let downloader = Downloader::new(
            Duration::from_millis(10),
            backoff::ExponentialBackoff {
                max_elapsed_time: Some(Duration::ZERO),
                ..Default::default()
            },
        );
        downloader
            .fetch_to_file("http://invalid.invalid/kubectl", &dest, None, false)
            .unwrap();
        downloader
            .fetch_to_file(
                "http://invalid.invalid/kubectl",
                &dest,
                Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"),
                false,
            )
            .unwrap();
    }
}
