use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::error::DtsError;

/// A file produced by unpacking a transferred archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFile {
    pub archive_id: String,
    pub member: String,
    /// Location relative to the destination endpoint root.
    pub path: String,
    pub bytes: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedMember {
    pub member: String,
    pub path: Utf8PathBuf,
    pub bytes: u64,
    pub hash: String,
}

/// Unpacks `members` (all entries when empty) of a zip archive into `target_dir`.
pub fn extract_zip_members(
    zip_path: &Utf8Path,
    members: &[String],
    target_dir: &Utf8Path,
) -> Result<Vec<UnpackedMember>, DtsError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| DtsError::Extraction(format!("open zip {zip_path}: {err}")))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| DtsError::Extraction(err.to_string()))?;

    let wanted: BTreeSet<&str> = members.iter().map(String::as_str).collect();
    let mut found = BTreeSet::new();
    let mut unpacked = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| DtsError::Extraction(err.to_string()))?;
        let name = entry.name().to_string();
        if !wanted.is_empty() && !wanted.contains(name.as_str()) {
            continue;
        }
        let relative = entry.enclosed_name().ok_or_else(|| {
            DtsError::Extraction("zip entry path traversal detected".to_string())
        })?;
        let relative = Utf8PathBuf::from_path_buf(relative)
            .map_err(|_| DtsError::Extraction(format!("non-utf8 zip entry {name}")))?;
        let entry_path = target_dir.join(relative);
        found.insert(name.clone());

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(|err| DtsError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| DtsError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| DtsError::Filesystem(err.to_string()))?;
        let (bytes, hash) = copy_hashing(&mut entry, &mut outfile)
            .map_err(|err| DtsError::Extraction(format!("{name}: {err}")))?;
        unpacked.push(UnpackedMember {
            member: name,
            path: entry_path,
            bytes,
            hash,
        });
    }

    let missing: Vec<&str> = wanted
        .iter()
        .copied()
        .filter(|name| !found.contains(*name))
        .collect();
    if !missing.is_empty() {
        return Err(DtsError::Extraction(format!(
            "{zip_path} has no member(s) {}",
            missing.join(", ")
        )));
    }
    Ok(unpacked)
}

/// Decompresses a single-file gzip archive next to itself, dropping the `.gz` suffix.
pub fn gunzip_file(gz_path: &Utf8Path) -> Result<UnpackedMember, DtsError> {
    let stem = gz_path
        .file_stem()
        .ok_or_else(|| DtsError::Extraction(format!("invalid gzip path {gz_path}")))?;
    let target = gz_path.with_file_name(stem);
    let file = fs::File::open(gz_path)
        .map_err(|err| DtsError::Extraction(format!("open gzip {gz_path}: {err}")))?;
    let mut decoder = GzDecoder::new(file);
    let mut outfile =
        fs::File::create(&target).map_err(|err| DtsError::Filesystem(err.to_string()))?;
    let (bytes, hash) = copy_hashing(&mut decoder, &mut outfile)
        .map_err(|err| DtsError::Extraction(format!("{gz_path}: {err}")))?;
    Ok(UnpackedMember {
        member: stem.to_string(),
        path: target,
        bytes,
        hash,
    })
}

/// Size and hex SHA-256 of a file.
pub fn sha256_file(path: &Utf8Path) -> Result<(u64, String), DtsError> {
    let mut file = fs::File::open(path)
        .map_err(|err| DtsError::Filesystem(format!("open {path}: {err}")))?;
    copy_hashing(&mut file, &mut io::sink()).map_err(|err| DtsError::Filesystem(err.to_string()))
}

fn copy_hashing(reader: &mut dyn Read, writer: &mut dyn Write) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        writer.write_all(&buffer[..read])?;
        total += read as u64;
    }
    writer.flush()?;
    Ok((total, format!("{:x}", hasher.finalize())))
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), DtsError> {
    let parent = path
        .parent()
        .ok_or_else(|| DtsError::Filesystem(format!("invalid destination path {path}")))?;
    fs::create_dir_all(parent).map_err(|err| DtsError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".dts-write")
        .tempfile_in(parent)
        .map_err(|err| DtsError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| DtsError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| DtsError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| DtsError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), DtsError> {
    let parent = dest
        .parent()
        .ok_or_else(|| DtsError::Filesystem(format!("invalid destination path {dest}")))?;
    fs::create_dir_all(parent).map_err(|err| DtsError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".dts-copy")
        .tempfile_in(parent)
        .map_err(|err| DtsError::Filesystem(err.to_string()))?;
    fs::copy(source, temp.path())
        .map_err(|err| DtsError::Filesystem(format!("copy {source}: {err}")))?;
    temp.persist(dest)
        .map_err(|err| DtsError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Creates `dir` if needed and proves it accepts new files.
pub fn ensure_writable_dir(dir: &Utf8Path) -> Result<(), DtsError> {
    let unwritable = |reason: String| DtsError::DirectoryUnwritable {
        path: dir.to_string(),
        reason,
    };
    fs::create_dir_all(dir).map_err(|err| unwritable(err.to_string()))?;
    tempfile::Builder::new()
        .prefix(".dts-probe")
        .tempfile_in(dir)
        .map_err(|err| unwritable(err.to_string()))?;
    Ok(())
}
