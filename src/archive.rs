//! Workspace archiving for checkpoints.
//!
//! Two implementations of `Archiver`:
//! - `TarGzArchiver`: in-process tar + gzip (`tar`, `flate2`)
//! - `CommandArchiver`: the external `tar` tool, exit code zero is success
//!
//! Entry names are always relative to the workspace root, so an archive made
//! from a subdirectory still extracts into the right place. Excluded paths are
//! root-relative too and drop the whole subtree.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use crate::error::ArchiveError;

/// File name of the checkpoint archive inside its staging directory.
pub const ARCHIVE_FILE_NAME: &str = "checkpoint.tar.gz";

/// Gzip level used for checkpoints: fast, low ratio.
pub const DEFAULT_ARCHIVE_LEVEL: u32 = 3;

/// Compress/extract contract used by the checkpoint manager.
///
/// Implementations block; callers run them on the blocking pool.
pub trait Archiver: Send + Sync {
    /// Archive `root/include` (or all of `root`) into `archive`, leaving out
    /// every root-relative path in `exclude`.
    fn compress(
        &self,
        root: &Path,
        include: Option<&Path>,
        exclude: &[PathBuf],
        archive: &Path,
    ) -> Result<(), ArchiveError>;

    /// Extract `archive` into `dest`, overwriting existing files.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ArchiveError>;
}

/// Which archiver a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchiverKind {
    #[default]
    Native,
    Command,
}

pub fn archiver_for(kind: ArchiverKind, level: u32) -> Box<dyn Archiver> {
    match kind {
        ArchiverKind::Native => Box::new(TarGzArchiver::new(level)),
        ArchiverKind::Command => Box::new(CommandArchiver::new(level)),
    }
}

fn source_dir(root: &Path, include: Option<&Path>) -> Result<PathBuf, ArchiveError> {
    let source = match include {
        Some(sub) => root.join(sub),
        None => root.to_path_buf(),
    };
    if !source.is_dir() {
        return Err(ArchiveError::SourceMissing(source.display().to_string()));
    }
    Ok(source)
}

fn is_excluded(relative: &Path, exclude: &[PathBuf]) -> bool {
    exclude.iter().any(|ex| relative.starts_with(ex))
}

/// In-process tar.gz archiver.
#[derive(Debug, Clone, Copy)]
pub struct TarGzArchiver {
    level: u32,
}

impl TarGzArchiver {
    pub fn new(level: u32) -> Self {
        TarGzArchiver {
            level: level.min(9),
        }
    }
}

impl Default for TarGzArchiver {
    fn default() -> Self {
        TarGzArchiver::new(DEFAULT_ARCHIVE_LEVEL)
    }
}

impl Archiver for TarGzArchiver {
    fn compress(
        &self,
        root: &Path,
        include: Option<&Path>,
        exclude: &[PathBuf],
        archive: &Path,
    ) -> Result<(), ArchiveError> {
        let source = source_dir(root, include)?;
        let file = BufWriter::new(File::create(archive)?);
        let encoder = GzEncoder::new(file, Compression::new(self.level));
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut entries = 0usize;
        let walker = WalkDir::new(&source)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| match e.path().strip_prefix(root) {
                Ok(rel) => !is_excluded(rel, exclude),
                Err(_) => true,
            });
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            let name = match entry.path().strip_prefix(root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                _ => continue,
            };
            if entry.file_type().is_dir() {
                builder.append_dir(&name, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), &name)?;
            }
            entries += 1;
        }

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        std::io::Write::flush(&mut writer)?;
        log::info!(
            "[Archive] Wrote {} entries from {} to {}",
            entries,
            source.display(),
            archive.display()
        );
        Ok(())
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
        let file = BufReader::new(File::open(archive)?);
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        tar.set_preserve_permissions(true);
        tar.set_preserve_mtime(true);
        tar.set_overwrite(true);
        std::fs::create_dir_all(dest)?;
        tar.unpack(dest)?;
        log::info!("[Archive] Extracted {} into {}", archive.display(), dest.display());
        Ok(())
    }
}

/// Archiver backed by the external `tar` command.
#[derive(Debug, Clone)]
pub struct CommandArchiver {
    program: String,
    level: u32,
}

impl CommandArchiver {
    pub fn new(level: u32) -> Self {
        CommandArchiver {
            program: "tar".to_string(),
            level: level.min(9),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn compress_args(
        &self,
        root: &Path,
        include: Option<&Path>,
        exclude: &[PathBuf],
        archive: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            "-f".to_string(),
            archive.display().to_string(),
            "-I".to_string(),
            format!("gzip -{}", self.level),
        ];
        if !exclude.is_empty() {
            // Member names start with "./" when the whole root is archived
            let member_prefix = if include.is_none() { "./" } else { "" };
            args.push("--anchored".to_string());
            args.extend(
                exclude
                    .iter()
                    .map(|ex| format!("--exclude={}{}", member_prefix, ex.display())),
            );
        }
        args.extend([
            "-C".to_string(),
            root.display().to_string(),
            include.map_or_else(|| ".".to_string(), |p| p.display().to_string()),
        ]);
        args
    }

    fn extract_args(&self, archive: &Path, dest: &Path) -> Vec<String> {
        vec![
            "-x".to_string(),
            "-z".to_string(),
            "-f".to_string(),
            archive.display().to_string(),
            "-C".to_string(),
            dest.display().to_string(),
        ]
    }

    fn run(&self, args: &[String]) -> Result<(), ArchiveError> {
        log::info!("[Archive] Running: {} {}", self.program, args.join(" "));
        let status = Command::new(&self.program)
            .args(args)
            .status()
            .map_err(|source| ArchiveError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(ArchiveError::CommandFailed {
                program: self.program.clone(),
                code: status.code(),
            })
        }
    }
}

impl Archiver for CommandArchiver {
    fn compress(
        &self,
        root: &Path,
        include: Option<&Path>,
        exclude: &[PathBuf],
        archive: &Path,
    ) -> Result<(), ArchiveError> {
        source_dir(root, include)?;
        self.run(&self.compress_args(root, include, exclude, archive))
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
        std::fs::create_dir_all(dest)?;
        self.run(&self.extract_args(archive, dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        std::fs::create_dir_all(root.join("src/out/Default/obj")).unwrap();
        std::fs::create_dir_all(root.join("src/empty")).unwrap();
        std::fs::write(root.join("src/out/Default/obj/a.o"), b"object a").unwrap();
        std::fs::write(root.join("src/out/Default/build.ninja"), b"rule cc").unwrap();
        std::fs::write(root.join("top.txt"), b"top level").unwrap();
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                (rel, std::fs::read(e.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_native_round_trip_whole_root() {
        let src = TempDir::new().expect("Failed to create temp directory");
        populate(src.path());
        let staging = TempDir::new().unwrap();
        let archive = staging.path().join(ARCHIVE_FILE_NAME);

        let archiver = TarGzArchiver::default();
        archiver.compress(src.path(), None, &[], &archive).unwrap();

        let dest = TempDir::new().unwrap();
        archiver.extract(&archive, dest.path()).unwrap();
        assert_eq!(snapshot(src.path()), snapshot(dest.path()));
        assert!(dest.path().join("src/empty").is_dir());
    }

    #[test]
    fn test_native_subdirectory_keeps_root_relative_names() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let staging = TempDir::new().unwrap();
        let archive = staging.path().join(ARCHIVE_FILE_NAME);

        let archiver = TarGzArchiver::default();
        archiver.compress(src.path(), Some(Path::new("src")), &[], &archive).unwrap();

        let dest = TempDir::new().unwrap();
        archiver.extract(&archive, dest.path()).unwrap();
        assert!(dest.path().join("src/out/Default/obj/a.o").is_file());
        assert!(!dest.path().join("top.txt").exists());
    }

    #[test]
    fn test_native_extract_overwrites_stale_files() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let staging = TempDir::new().unwrap();
        let archive = staging.path().join(ARCHIVE_FILE_NAME);
        TarGzArchiver::default().compress(src.path(), None, &[], &archive).unwrap();

        let dest = TempDir::new().unwrap();
        std::fs::write(dest.path().join("top.txt"), b"stale").unwrap();
        TarGzArchiver::default().extract(&archive, dest.path()).unwrap();
        assert_eq!(std::fs::read(dest.path().join("top.txt")).unwrap(), b"top level");
    }

    #[test]
    fn test_native_excluded_subtrees_are_left_out() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        std::fs::create_dir_all(src.path().join("logs/full")).unwrap();
        std::fs::write(src.path().join("logs/full/run_full.log"), b"log line").unwrap();
        std::fs::create_dir_all(src.path().join("logsbook")).unwrap();
        std::fs::write(src.path().join("logsbook/keep.txt"), b"keep").unwrap();
        let staging = TempDir::new().unwrap();
        let archive = staging.path().join(ARCHIVE_FILE_NAME);

        let archiver = TarGzArchiver::default();
        archiver
            .compress(src.path(), None, &[PathBuf::from("logs"), PathBuf::from("src/empty")], &archive)
            .unwrap();

        let dest = TempDir::new().unwrap();
        archiver.extract(&archive, dest.path()).unwrap();
        assert!(!dest.path().join("logs").exists());
        assert!(!dest.path().join("src/empty").exists());
        assert!(dest.path().join("logsbook/keep.txt").is_file());
        assert!(dest.path().join("src/out/Default/obj/a.o").is_file());
    }

    #[test]
    fn test_missing_source_is_reported() {
        let src = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let result = TarGzArchiver::default().compress(
            src.path(),
            Some(Path::new("does-not-exist")),
            &[],
            &staging.path().join(ARCHIVE_FILE_NAME),
        );
        assert!(matches!(result, Err(ArchiveError::SourceMissing(_))));
    }

    #[test]
    fn test_corrupt_archive_fails_extraction() {
        let staging = TempDir::new().unwrap();
        let archive = staging.path().join(ARCHIVE_FILE_NAME);
        std::fs::write(&archive, b"definitely not gzip").unwrap();
        let dest = TempDir::new().unwrap();
        assert!(TarGzArchiver::default().extract(&archive, dest.path()).is_err());
    }

    #[test]
    fn test_command_archiver_args() {
        let archiver = CommandArchiver::new(3);
        let args = archiver.compress_args(Path::new("/w"), Some(Path::new("src")), &[], Path::new("/s/c.tar.gz"));
        assert_eq!(args, vec!["-c", "-f", "/s/c.tar.gz", "-I", "gzip -3", "-C", "/w", "src"]);
        let args = archiver.compress_args(Path::new("/w"), None, &[PathBuf::from("logs")], Path::new("/s/c.tar.gz"));
        assert_eq!(
            args,
            vec!["-c", "-f", "/s/c.tar.gz", "-I", "gzip -3", "--anchored", "--exclude=./logs", "-C", "/w", "."]
        );
        let args = archiver.extract_args(Path::new("/s/c.tar.gz"), Path::new("/w"));
        assert_eq!(args, vec!["-x", "-z", "-f", "/s/c.tar.gz", "-C", "/w"]);
    }

    #[test]
    fn test_command_archiver_missing_program() {
        let src = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let archiver = CommandArchiver::new(3).with_program("buildrelay-no-such-tar");
        let result = archiver.compress(src.path(), None, &[], &staging.path().join(ARCHIVE_FILE_NAME));
        assert!(matches!(result, Err(ArchiveError::Spawn { .. })));
    }

    #[test]
    fn test_command_archiver_nonzero_exit() {
        let staging = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        // `false` ignores its arguments and exits 1
        let archiver = CommandArchiver::new(3).with_program("false");
        if Command::new("false").status().is_err() {
            return;
        }
        let result = archiver.extract(&staging.path().join(ARCHIVE_FILE_NAME), dest.path());
        assert!(matches!(result, Err(ArchiveError::CommandFailed { code: Some(1), .. })));
    }
}
