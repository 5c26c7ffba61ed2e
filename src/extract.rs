//! Archive extraction via the system's external extractors.
//!
//! Formats are dispatched on extension: `unzip` (.zip), `unrar` (.rar),
//! `7z` (.7z). The archive's entry listing is screened before anything is
//! written, so an entry that would escape the destination fails the whole
//! extraction up front.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::errors::ExtractError;

type Result<T> = std::result::Result<T, ExtractError>;

#[derive(Debug, Clone)]
pub struct ExtractResult {
    /// Name of the archive's single top-level directory.
    pub top_level_name: String,
    /// Files materialised beneath it.
    pub total_files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Zip,
    Rar,
    SevenZ,
}

impl Format {
    fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "zip" => Ok(Self::Zip),
            "rar" => Ok(Self::Rar),
            "7z" => Ok(Self::SevenZ),
            _ => Err(ExtractError::UnsupportedFormat { extension }),
        }
    }
}

pub struct ArchiveExtractor;

impl ArchiveExtractor {
    /// Materialise `archive` into `dest` and resolve its top-level directory.
    pub async fn extract(archive: &Path, dest: &Path) -> Result<ExtractResult> {
        let format = Format::from_path(archive)?;

        let entries = list_entries(format, archive).await?;
        screen_entries(&entries)?;

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| ExtractError::Corrupt {
                message: format!("cannot create destination: {}", e),
            })?;
        run_extractor(format, archive, dest).await?;

        let top_level = resolve_top_level(dest)?;
        let total_files = count_files(&top_level);
        debug!(
            archive = %archive.display(),
            top_level = %top_level.display(),
            total_files,
            "archive extracted"
        );
        Ok(ExtractResult {
            top_level_name: top_level
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            total_files,
        })
    }
}

async fn run_tool(tool: &str, args: &[&str]) -> Result<std::process::Output> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|e| ExtractError::ToolUnavailable {
            tool: tool.to_string(),
            message: e.to_string(),
        })?;
    Ok(output)
}

async fn list_entries(format: Format, archive: &Path) -> Result<Vec<String>> {
    let archive_str = archive.to_string_lossy().to_string();
    let (tool, args): (&str, Vec<&str>) = match format {
        Format::Zip => ("unzip", vec!["-Z1", archive_str.as_str()]),
        Format::Rar => ("unrar", vec!["lb", archive_str.as_str()]),
        Format::SevenZ => ("7z", vec!["l", "-ba", "-slt", archive_str.as_str()]),
    };
    let output = run_tool(tool, &args).await?;
    if !output.status.success() {
        return Err(ExtractError::Corrupt {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let entries = match format {
        Format::SevenZ => stdout
            .lines()
            .filter_map(|line| line.strip_prefix("Path = "))
            .map(str::to_string)
            .collect(),
        _ => stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
    };
    Ok(entries)
}

/// Reject entries that would land outside the destination.
fn screen_entries(entries: &[String]) -> Result<()> {
    for entry in entries {
        let path = Path::new(entry);
        if path.is_absolute() {
            return Err(ExtractError::PathTraversal {
                entry: entry.clone(),
            });
        }
        for component in path.components() {
            if matches!(component, std::path::Component::ParentDir) {
                return Err(ExtractError::PathTraversal {
                    entry: entry.clone(),
                });
            }
        }
    }
    Ok(())
}

async fn run_extractor(format: Format, archive: &Path, dest: &Path) -> Result<()> {
    let archive_str = archive.to_string_lossy().to_string();
    let dest_str = dest.to_string_lossy().to_string();
    let output = match format {
        Format::Zip => {
            run_tool(
                "unzip",
                &["-o", archive_str.as_str(), "-d", dest_str.as_str()],
            )
            .await?
        }
        Format::Rar => {
            // unrar requires the trailing separator to treat it as a directory.
            let dest_slash = format!("{}/", dest_str);
            run_tool(
                "unrar",
                &["x", "-o+", archive_str.as_str(), dest_slash.as_str()],
            )
            .await?
        }
        Format::SevenZ => {
            let dest_flag = format!("-o{}", dest_str);
            run_tool("7z", &["x", archive_str.as_str(), dest_flag.as_str(), "-y"]).await?
        }
    };
    if !output.status.success() {
        return Err(ExtractError::Corrupt {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Junk the archivers of the usual desktop platforms sprinkle around.
fn is_junk(name: &str) -> bool {
    matches!(name, "__MACOSX" | ".DS_Store" | "Thumbs.db")
}

/// The extraction must yield exactly one top-level directory.
fn resolve_top_level(dest: &Path) -> Result<PathBuf> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dest).map_err(|e| ExtractError::Corrupt {
        message: e.to_string(),
    })?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_junk(&name) {
            continue;
        }
        if entry.path().is_dir() {
            dirs.push(entry.path());
        } else {
            files.push(name);
        }
    }

    match (dirs.len(), files.len()) {
        (1, 0) => Ok(dirs.remove(0)),
        (0, _) => Err(ExtractError::NoTopLevel),
        _ => {
            let mut entries: Vec<String> = dirs
                .iter()
                .filter_map(|d| d.file_name().map(|n| n.to_string_lossy().to_string()))
                .collect();
            entries.extend(files);
            entries.sort();
            Err(ExtractError::MultipleTopLevel { entries })
        }
    }
}

fn count_files(root: &Path) -> usize {
    let mut count = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    count += 1;
                }
            }
        }
    }
    count
}
