//! Functions to stream archives into a [`DirectoryBuilder`].

use std::io::{Read, Seek, SeekFrom};

use tempfile::SpooledTempFile;

use crate::{run_task, BuildContext, BuildError, DirectoryBuilder};

/// MIME type of an uncompressed tar archive.
pub const TAR: &str = "application/x-tar";

/// MIME type of a gzip compressed tar archive.
pub const GZIP_TAR: &str = "application/x-compressed-tar";

/// MIME type of a bzip2 compressed tar archive.
pub const BZIP2_TAR: &str = "application/x-bzip-compressed-tar";

/// MIME type of a zstd compressed tar archive.
pub const ZSTD_TAR: &str = "application/x-zstd-compressed-tar";

/// MIME type of a zip archive.
pub const ZIP: &str = "application/zip";

/// Zip archives need random access, they are buffered in memory up to this size and in a
/// temporary file beyond it.
const ZIP_SPOOL_LIMIT: usize = 5 * 1024 * 1024;

/// Unix permission bits for executable files (user, group, and other execute bits).
const EXECUTABLE_MODE_BITS: u32 = 0o111;

/// Controls which part of an archive is extracted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Only extract this sub-directory of the archive. Its content ends up at the root of the
    /// builder and entries outside of it are skipped.
    pub extract: Option<String>,
}

/// Guesses the MIME type of an archive from its file name.
pub fn mime_type_from_path(path: &str) -> Option<&'static str> {
    let lower = path.to_ascii_lowercase();
    [
        (".tar.gz", GZIP_TAR),
        (".tgz", GZIP_TAR),
        (".tar.bz2", BZIP2_TAR),
        (".tbz2", BZIP2_TAR),
        (".tbz", BZIP2_TAR),
        (".tar.zst", ZSTD_TAR),
        (".tzst", ZSTD_TAR),
        (".tar", TAR),
        (".zip", ZIP),
        (".jar", ZIP),
    ]
    .into_iter()
    .find_map(|(suffix, mime_type)| lower.ends_with(suffix).then_some(mime_type))
}

/// Extracts the archive read from `reader` into `builder`.
pub fn extract(
    mime_type: &str,
    reader: impl Read,
    builder: &mut dyn DirectoryBuilder,
    options: &ExtractOptions,
    context: &BuildContext<'_>,
) -> Result<(), BuildError> {
    let extract = options.extract.as_deref();
    run_task(context.handler, &format!("Extracting {mime_type}"), None, |_| {
        match mime_type {
            TAR => extract_tar(tar::Archive::new(reader), builder, extract, context),
            GZIP_TAR => extract_tar(
                tar::Archive::new(flate2::read::GzDecoder::new(reader)),
                builder,
                extract,
                context,
            ),
            BZIP2_TAR => extract_tar(
                tar::Archive::new(bzip2::read::BzDecoder::new(reader)),
                builder,
                extract,
                context,
            ),
            ZSTD_TAR => {
                let decoder = zstd::stream::read::Decoder::new(reader)
                    .map_err(|e| BuildError::IoError("initialize zstd decoder".to_string(), e))?;
                extract_tar(tar::Archive::new(decoder), builder, extract, context)
            }
            ZIP => extract_zip(reader, builder, extract, context),
            other => Err(BuildError::UnsupportedArchive(other.to_string())),
        }
    })
}

/// Resolves the path of an archive entry relative to the extracted sub-directory. Returns `None`
/// for entries outside of it and for the sub-directory itself.
fn relative_path(raw: &str, extract: Option<&str>) -> Result<Option<String>, BuildError> {
    let mut components = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => return Err(BuildError::PathTraversal(raw.to_string())),
            name => components.push(name),
        }
    }

    let prefix: Vec<&str> = extract
        .unwrap_or_default()
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if components.len() <= prefix.len() || components[..prefix.len()] != prefix[..] {
        return Ok(None);
    }
    Ok(Some(components[prefix.len()..].join("/")))
}

fn utf8(bytes: &[u8]) -> Result<&str, BuildError> {
    std::str::from_utf8(bytes)
        .map_err(|_| BuildError::InvalidPath(String::from_utf8_lossy(bytes).into_owned()))
}

/// Converts a raw mtime value, handling zero values the same way `tar` does.
fn mtime_from_raw(mtime: u64) -> i64 {
    if mtime == 0 {
        1
    } else {
        mtime as i64
    }
}

fn extract_tar<R: Read>(
    mut archive: tar::Archive<R>,
    builder: &mut dyn DirectoryBuilder,
    extract: Option<&str>,
    context: &BuildContext<'_>,
) -> Result<(), BuildError> {
    let read_error = |e| BuildError::IoError("read tar archive".to_string(), e);

    for entry in archive.entries().map_err(read_error)? {
        context.check_cancelled()?;
        let mut entry = entry.map_err(read_error)?;
        let raw_path = utf8(&entry.path_bytes())?.to_string();
        let Some(path) = relative_path(&raw_path, extract)? else {
            continue;
        };

        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = header.mode().map_err(read_error)?;
        let mtime = mtime_from_raw(header.mtime().map_err(read_error)?);
        let link_name = entry
            .link_name_bytes()
            .map(|name| utf8(&name).map(str::to_string))
            .transpose()?;

        if entry_type.is_dir() {
            builder.add_directory(&path)?;
        } else if entry_type.is_symlink() {
            let target = link_name.ok_or_else(|| BuildError::InvalidPath(raw_path.clone()))?;
            builder.add_symlink(&path, &target)?;
        } else if entry_type.is_hard_link() {
            let target = link_name.ok_or_else(|| BuildError::InvalidPath(raw_path.clone()))?;
            match relative_path(&target, extract)? {
                Some(existing) => {
                    builder.add_hardlink(&path, &existing, mode & EXECUTABLE_MODE_BITS != 0)?;
                }
                None => tracing::debug!("skipping hardlink '{raw_path}' to '{target}'"),
            }
        } else if entry_type.is_file() || entry_type == tar::EntryType::Continuous {
            builder.add_file(&path, &mut entry, mtime, mode & EXECUTABLE_MODE_BITS != 0)?;
        } else {
            tracing::debug!("skipping tar entry '{raw_path}' of type {entry_type:?}");
        }
    }

    Ok(())
}

fn extract_zip(
    mut reader: impl Read,
    builder: &mut dyn DirectoryBuilder,
    extract: Option<&str>,
    context: &BuildContext<'_>,
) -> Result<(), BuildError> {
    let mut temp_file = SpooledTempFile::new(ZIP_SPOOL_LIMIT);
    std::io::copy(&mut reader, &mut temp_file)
        .map_err(|e| BuildError::IoError("buffer zip archive".to_string(), e))?;
    temp_file
        .seek(SeekFrom::Start(0))
        .map_err(|e| BuildError::IoError("buffer zip archive".to_string(), e))?;
    let mut archive = zip::ZipArchive::new(temp_file)?;

    for index in 0..archive.len() {
        context.check_cancelled()?;
        let mut file = archive.by_index(index)?;
        let raw_path = file.name().to_string();
        let Some(path) = relative_path(&raw_path, extract)? else {
            continue;
        };

        let mode = file.unix_mode().unwrap_or(0);
        if file.is_dir() {
            builder.add_directory(&path)?;
        } else if mode & 0o170000 == 0o120000 {
            let mut target = String::new();
            file.read_to_string(&mut target)
                .map_err(|e| BuildError::IoError(format!("read '{raw_path}'"), e))?;
            builder.add_symlink(&path, &target)?;
        } else {
            let mtime = file
                .last_modified()
                .map(|dt| {
                    unix_time(
                        i64::from(dt.year()),
                        i64::from(dt.month()),
                        i64::from(dt.day()),
                    ) + i64::from(dt.hour()) * 3600
                        + i64::from(dt.minute()) * 60
                        + i64::from(dt.second())
                })
                .unwrap_or(1);
            builder.add_file(&path, &mut file, mtime, mode & EXECUTABLE_MODE_BITS != 0)?;
        }
    }

    Ok(())
}

/// Seconds since the Unix epoch at midnight of a proleptic Gregorian date. Zip timestamps carry
/// no time zone, they are interpreted as UTC.
fn unix_time(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let year_of_era = year - era * 400;
    let day_of_year = (153 * (month + if month > 2 { -3 } else { 9 }) + 2) / 5 + day - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    (era * 146097 + day_of_era - 719468) * 86400
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CancellationToken, SilentTaskHandler, StagingBuilder};
    use assert_matches::assert_matches;
    use larder_manifest::{ManifestFile, ManifestFormat, ManifestNode};
    use rstest::rstest;
    use std::io::{Cursor, Write};

    fn tar_archive() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_path("pkg-1.0/").unwrap();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(1577836800);
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_path("pkg-1.0/hello.txt").unwrap();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_mtime(1577836800);
        header.set_cksum();
        builder.append(&header, b"hi" as &[u8]).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_path("pkg-1.0/bin/run").unwrap();
        header.set_size(3);
        header.set_mode(0o755);
        header.set_mtime(0);
        header.set_cksum();
        builder.append(&header, b"run" as &[u8]).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_path("pkg-1.0/latest").unwrap();
        header.set_link_name("bin/run").unwrap();
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Link);
        header.set_path("pkg-1.0/again.txt").unwrap();
        header.set_link_name("pkg-1.0/hello.txt").unwrap();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();

        builder.into_inner().unwrap()
    }

    fn extract_into(
        dir: &std::path::Path,
        mime_type: &str,
        data: Vec<u8>,
        extract: Option<&str>,
    ) -> Result<StagingBuilder, BuildError> {
        let handler = SilentTaskHandler::new();
        let context = BuildContext::new(&handler);
        let mut staging =
            StagingBuilder::new(dir, ManifestFormat::Sha256, CancellationToken::new());
        super::extract(
            mime_type,
            Cursor::new(data),
            &mut staging,
            &ExtractOptions {
                extract: extract.map(str::to_string),
            },
            &context,
        )?;
        Ok(staging)
    }

    #[test]
    fn test_extract_tar_with_sub_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = extract_into(dir.path(), TAR, tar_archive(), Some("pkg-1.0"))
            .unwrap()
            .into_manifest();

        assert_matches!(
            manifest.get("hello.txt"),
            Some(ManifestNode::File(ManifestFile {
                mtime: 1577836800,
                size: 2,
                executable: false,
                ..
            }))
        );
        assert_matches!(
            manifest.get("bin/run"),
            Some(ManifestNode::File(ManifestFile {
                mtime: 1,
                executable: true,
                ..
            }))
        );
        assert_matches!(manifest.get("latest"), Some(ManifestNode::Symlink(_)));
        assert_eq!(manifest.get("again.txt"), manifest.get("hello.txt"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("again.txt")).unwrap(),
            "hi"
        );
    }

    #[test]
    fn test_extract_tar_without_sub_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = extract_into(dir.path(), TAR, tar_archive(), None)
            .unwrap()
            .into_manifest();
        assert!(manifest.get("pkg-1.0/hello.txt").is_some());
        assert!(manifest.get("hello.txt").is_none());
    }

    #[rstest]
    #[case(GZIP_TAR)]
    #[case(BZIP2_TAR)]
    #[case(ZSTD_TAR)]
    fn test_compressed_tar(#[case] mime_type: &str) {
        let raw = tar_archive();
        let compressed = match mime_type {
            GZIP_TAR => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&raw).unwrap();
                encoder.finish().unwrap()
            }
            BZIP2_TAR => {
                let mut encoder =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
                encoder.write_all(&raw).unwrap();
                encoder.finish().unwrap()
            }
            _ => zstd::stream::encode_all(Cursor::new(raw), 0).unwrap(),
        };

        let plain_dir = tempfile::tempdir().unwrap();
        let plain = extract_into(plain_dir.path(), TAR, tar_archive(), Some("pkg-1.0"))
            .unwrap()
            .into_manifest();
        let dir = tempfile::tempdir().unwrap();
        let manifest = extract_into(dir.path(), mime_type, compressed, Some("pkg-1.0"))
            .unwrap()
            .into_manifest();
        assert_eq!(manifest, plain);
    }

    #[test]
    fn test_extract_zip() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .last_modified_time(zip::DateTime::from_date_and_time(2020, 1, 1, 0, 0, 0).unwrap());
        writer.add_directory("top/", options).unwrap();
        writer.start_file("top/hello.txt", options).unwrap();
        writer.write_all(b"hi").unwrap();
        writer
            .start_file("top/run.sh", options.unix_permissions(0o755))
            .unwrap();
        writer.write_all(b"#!/bin/sh\n").unwrap();
        let data = writer.finish().unwrap().into_inner();

        let dir = tempfile::tempdir().unwrap();
        let manifest = extract_into(dir.path(), ZIP, data, Some("top"))
            .unwrap()
            .into_manifest();
        assert_eq!(
            manifest.get("hello.txt"),
            Some(&ManifestNode::File(ManifestFile {
                digest: "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"
                    .to_string(),
                mtime: 1577836800,
                size: 2,
                executable: false,
            }))
        );
        assert_matches!(
            manifest.get("run.sh"),
            Some(ManifestNode::File(ManifestFile {
                executable: true,
                ..
            }))
        );
    }

    #[test]
    fn test_unsupported_archive() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            extract_into(dir.path(), "application/x-rar", Vec::new(), None),
            Err(BuildError::UnsupportedArchive(_))
        );
    }

    #[rstest]
    #[case("a/b/c", None, Some("a/b/c"))]
    #[case("./a/b", Some("a"), Some("b"))]
    #[case("a", Some("a"), None)]
    #[case("other/b", Some("a"), None)]
    #[case("ab/c", Some("a"), None)]
    fn test_relative_path(
        #[case] raw: &str,
        #[case] extract: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(relative_path(raw, extract).unwrap().as_deref(), expected);
    }

    #[test]
    fn test_path_traversal() {
        assert_matches!(
            relative_path("a/../../etc/passwd", None),
            Err(BuildError::PathTraversal(_))
        );
    }

    #[rstest]
    #[case("foo-1.0.tar.gz", Some(GZIP_TAR))]
    #[case("FOO.TGZ", Some(GZIP_TAR))]
    #[case("foo.tar.bz2", Some(BZIP2_TAR))]
    #[case("foo.tar.zst", Some(ZSTD_TAR))]
    #[case("foo.tar", Some(TAR))]
    #[case("foo.zip", Some(ZIP))]
    #[case("foo.exe", None)]
    fn test_mime_type_from_path(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(mime_type_from_path(path), expected);
    }

    #[test]
    fn test_unix_time() {
        assert_eq!(unix_time(1970, 1, 1), 0);
        assert_eq!(unix_time(2020, 1, 1), 1577836800);
        assert_eq!(unix_time(2000, 3, 1), 951868800);
    }
}
