//! Digest hashing, reproducible tar/gzip archiving, and safe path handling.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest as _, Sha256};
use tar::Builder as TarBuilder;

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 4096;

/// SHA-256 hex digest of a file's contents, streamed in 4 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 hex digest of an in-memory byte slice.
#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Lazily read `file` in chunks of up to `chunk_size` bytes. The iterator is
/// finite and not restartable — it consumes `file`.
pub fn read_in_chunks(
    mut file: impl Read + 'static,
    chunk_size: usize,
) -> impl Iterator<Item = Result<Vec<u8>>> {
    std::iter::from_fn(move || {
        let mut buf = vec![0u8; chunk_size];
        match file.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(buf))
            }
            Err(e) => Some(Err(Error::Io(e))),
        }
    })
}

/// Build a deterministic gzip-compressed tar archive of `source_dir` into a
/// freshly-created temporary file, returning its path.
///
/// Determinism: entry mtimes, uid, and gid are zeroed, and directory entries are
/// visited in sorted order, so archiving the same tree twice yields byte-identical
/// output — required so re-pushing an unchanged directory layer reuses its digest.
pub fn make_targz(source_dir: &Path) -> Result<PathBuf> {
    let dest = tempfile_path("tar.gz")?;
    let file = File::create(&dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = TarBuilder::new(encoder);

    let arcname = source_dir
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    append_dir_deterministic(&mut builder, source_dir, &arcname)?;
    builder.into_inner()?.finish()?;
    Ok(dest)
}

fn append_dir_deterministic(
    builder: &mut TarBuilder<GzEncoder<File>>,
    dir: &Path,
    arcname: &Path,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder.append_data(&mut header, arcname, std::io::empty())?;

    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        let name = arcname.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            append_dir_deterministic(builder, &path, &name)?;
        } else {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(entry.metadata()?.len());
            header.set_mode(file_mode(&entry.metadata()?));
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();
            let data = File::open(&path)?;
            builder.append_data(&mut header, &name, data)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// Extract a `.tar.gz` archive into `outdir`, rejecting any entry whose
/// destination path would escape `outdir`.
pub fn extract_targz(archive: &Path, outdir: &Path) -> Result<()> {
    fs::create_dir_all(outdir)?;
    let file = File::open(archive)?;
    let decoder = GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);

    for entry in tar.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let dest = sanitize_path(outdir, &outdir.join(&entry_path))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }
    Ok(())
}

/// Resolve `candidate` and ensure the result is equal to or below `base`,
/// canonicalizing through symlinks and `..` components.
///
/// `base` itself is not required to exist; only as much of `candidate` as already
/// exists on disk is canonicalized — the rest is resolved lexically so this also
/// works for paths about to be created (extraction, pull).
pub fn sanitize_path(base: &Path, candidate: &Path) -> Result<PathBuf> {
    let base_abs = lexically_normalize(base);
    let candidate_abs = lexically_normalize(candidate);

    if candidate_abs.starts_with(&base_abs) {
        Ok(candidate_abs)
    } else {
        Err(Error::path_traversal(
            base.display().to_string(),
            candidate.display().to_string(),
        ))
    }
}

fn lexically_normalize(path: &Path) -> PathBuf {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };

    let mut out = PathBuf::new();
    for component in abs.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Parsed `path[:media_type]` reference, as used for a manifest config argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAndMediaType {
    /// The filesystem path.
    pub path: String,
    /// The media type, if one was given after a second `:`.
    pub media_type: Option<String>,
}

/// Parse `path[:media_type]`, handling Windows drive letters (`C:\foo:media/type`)
/// by requiring a second `:` as the media-type separator.
#[must_use]
pub fn split_path_and_content(s: &str) -> PathAndMediaType {
    let is_drive_letter = s.len() >= 2
        && s.as_bytes()[1] == b':'
        && s.as_bytes()[0].is_ascii_alphabetic();

    let search_from = if is_drive_letter { 2 } else { 0 };
    match s[search_from..].find(':') {
        Some(idx) => {
            let split_at = search_from + idx;
            PathAndMediaType {
                path: s[..split_at].to_string(),
                media_type: Some(s[split_at + 1..].to_string()),
            }
        }
        None => PathAndMediaType {
            path: s.to_string(),
            media_type: None,
        },
    }
}

fn tempfile_path(suffix: &str) -> Result<PathBuf> {
    let named = tempfile::Builder::new()
        .prefix("oras-")
        .suffix(&format!(".{suffix}"))
        .tempfile()?;
    Ok(named.into_temp_path().keep().map_err(|e| Error::Io(e.error))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn sha256_of_known_string_matches() {
        assert_eq!(
            sha256_bytes(b"hello\n"),
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn make_targz_is_deterministic() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"one").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"two").unwrap();

        let first = make_targz(dir.path()).unwrap();
        let second = make_targz(dir.path()).unwrap();
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
        fs::remove_file(first).unwrap();
        fs::remove_file(second).unwrap();
    }

    #[test]
    fn extract_targz_roundtrips_contents() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("hello.txt"), b"hello\n").unwrap();
        let archive = make_targz(src.path()).unwrap();

        let outdir = TempDir::new().unwrap();
        extract_targz(&archive, outdir.path()).unwrap();

        let extracted = outdir
            .path()
            .join(src.path().file_name().unwrap())
            .join("hello.txt");
        assert_eq!(fs::read(extracted).unwrap(), b"hello\n");
        fs::remove_file(archive).unwrap();
    }

    #[test]
    fn sanitize_path_rejects_parent_escape() {
        let base = TempDir::new().unwrap();
        let escaping = base.path().join("..");
        let err = sanitize_path(base.path(), &escaping).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
    }

    #[test]
    fn sanitize_path_accepts_nested_path() {
        let base = TempDir::new().unwrap();
        let nested = base.path().join("a/b/c.txt");
        let resolved = sanitize_path(base.path(), &nested).unwrap();
        assert!(resolved.starts_with(base.path()));
    }

    #[test]
    fn split_path_and_content_without_media_type() {
        let parsed = split_path_and_content("config.json");
        assert_eq!(parsed.path, "config.json");
        assert_eq!(parsed.media_type, None);
    }

    #[test]
    fn split_path_and_content_with_media_type() {
        let parsed = split_path_and_content("config.json:application/vnd.oci.image.config.v1+json");
        assert_eq!(parsed.path, "config.json");
        assert_eq!(
            parsed.media_type.as_deref(),
            Some("application/vnd.oci.image.config.v1+json")
        );
    }

    #[test]
    fn split_path_and_content_with_windows_drive_letter() {
        let parsed = split_path_and_content(r"C:\foo\config.json:media/type");
        assert_eq!(parsed.path, r"C:\foo\config.json");
        assert_eq!(parsed.media_type.as_deref(), Some("media/type"));
    }

    #[test]
    fn read_in_chunks_yields_all_bytes_in_order() {
        let data = vec![1u8, 2, 3, 4, 5, 6, 7];
        let cursor = Cursor::new(data.clone());
        let chunks: Vec<Vec<u8>> = read_in_chunks(cursor, 3)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let flattened: Vec<u8> = chunks.into_iter().flatten().collect();
        assert_eq!(flattened, data);
    }
}
