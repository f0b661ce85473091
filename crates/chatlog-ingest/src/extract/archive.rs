use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::LimitsConfig;
use crate::error::{ExtractError, IngestError, LimitKind};
use crate::sanitize;
use crate::worker::CancellationToken;

use super::classify::{classify, FileKind};
use super::path::{normalize_entry_name, resolve_within, to_storage_path};

/// Caps enforced while unpacking one archive.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionLimits {
    pub max_total_bytes: u64,
    pub max_entry_count: u64,
}

impl From<&LimitsConfig> for ExtractionLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_total_bytes: limits.max_extraction_bytes,
            max_entry_count: limits.max_entry_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntry {
    /// `/`-separated, relative to the destination directory.
    pub relative_path: String,
    pub byte_size: u64,
    pub kind: FileKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub files: Vec<ExtractedEntry>,
    pub skipped: Vec<SkippedEntry>,
    pub total_bytes: u64,
}

impl ExtractionReport {
    pub fn candidates(&self) -> impl Iterator<Item = &ExtractedEntry> {
        self.files
            .iter()
            .filter(|f| f.kind == FileKind::CandidateExport)
    }
}

/// Unpacks untrusted zip archives into a quarantine directory.
pub struct ArchiveExtractor {
    limits: ExtractionLimits,
}

impl ArchiveExtractor {
    pub fn new(limits: ExtractionLimits) -> Self {
        Self { limits }
    }

    /// Extracts every safe entry of `archive` below `destination`.
    ///
    /// Unsafe or unreadable entries are skipped and reported. Exceeding a limit
    /// aborts with [`IngestError::LimitExceeded`]; files already written stay on
    /// disk. `on_progress` receives `(entries_done, entries_total)`.
    pub fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<ExtractionReport, IngestError> {
        let file = File::open(archive).map_err(|e| IngestError::io(archive, e))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| {
            IngestError::validation(format!(
                "Unreadable archive '{}': {}",
                sanitize::redact_path(archive),
                e
            ))
        })?;

        let entry_total = zip.len() as u64;
        if entry_total == 0 {
            return Err(IngestError::validation("Archive contains no entries"));
        }

        std::fs::create_dir_all(destination).map_err(|e| IngestError::io(destination, e))?;

        let mut report = ExtractionReport::default();
        let mut accepted: u64 = 0;
        let mut file_entries: u64 = 0;
        let mut unsafe_entries: u64 = 0;
        let mut seen: HashSet<String> = HashSet::new();

        for index in 0..zip.len() {
            cancel.check()?;
            on_progress(index as u64, entry_total);

            let mut entry = match zip.by_index(index) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(index, "Skipping unreadable archive entry: {}", e);
                    report.skipped.push(SkippedEntry {
                        name: format!("#{}", index),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let name = entry.name().to_string();
            if entry.is_dir() {
                continue;
            }
            file_entries += 1;

            let target = match self.safe_target(destination, &name, entry.is_symlink()) {
                Ok(target) => target,
                Err(e) => {
                    warn!("Skipping archive entry: {}", e);
                    unsafe_entries += 1;
                    report.skipped.push(SkippedEntry {
                        name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let relative_path = to_storage_path(&target.relative);
            if seen.contains(&relative_path) {
                warn!(
                    file = %sanitize::redact_path(&target.relative),
                    "Skipping archive entry that repeats an extracted path"
                );
                report.skipped.push(SkippedEntry {
                    name,
                    reason: format!("duplicate of '{}'", relative_path),
                });
                continue;
            }

            let declared = entry.size();
            accepted += 1;
            self.check_limits(accepted, report.total_bytes.saturating_add(declared))?;

            let budget = self.limits.max_total_bytes - report.total_bytes;
            let written = match write_entry(&mut entry, &target.absolute, budget, &name) {
                Ok(written) => written,
                Err(e) => {
                    warn!("Skipping archive entry: {}", e);
                    accepted -= 1;
                    report.skipped.push(SkippedEntry {
                        name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if written > budget {
                return Err(IngestError::LimitExceeded {
                    limit: LimitKind::ExtractionBytes,
                    actual: report.total_bytes + written,
                    max: self.limits.max_total_bytes,
                });
            }

            report.total_bytes += written;
            let kind = classify(&target.relative);
            debug!(
                file = %sanitize::redact_path(&target.relative),
                bytes = written,
                kind = %kind,
                "Extracted entry"
            );
            seen.insert(relative_path.clone());
            report.files.push(ExtractedEntry {
                relative_path,
                byte_size: written,
                kind,
            });
        }

        on_progress(entry_total, entry_total);

        if file_entries == 1 && unsafe_entries == 1 {
            return Err(IngestError::validation(
                "The archive's only entry has an unsafe path",
            ));
        }

        info!(
            files = report.files.len(),
            skipped = report.skipped.len(),
            bytes = report.total_bytes,
            "Archive extracted"
        );

        Ok(report)
    }

    fn safe_target(
        &self,
        destination: &Path,
        name: &str,
        is_symlink: bool,
    ) -> Result<Target, ExtractError> {
        if is_symlink {
            return Err(ExtractError::UnsafePath {
                entry: name.to_string(),
                reason: "symbolic link entry",
            });
        }
        let relative = normalize_entry_name(name)?;
        let absolute = resolve_within(destination, &relative, name)?;
        Ok(Target { relative, absolute })
    }

    fn check_limits(&self, count: u64, bytes: u64) -> Result<(), IngestError> {
        if count > self.limits.max_entry_count {
            return Err(IngestError::LimitExceeded {
                limit: LimitKind::EntryCount,
                actual: count,
                max: self.limits.max_entry_count,
            });
        }
        if bytes > self.limits.max_total_bytes {
            return Err(IngestError::LimitExceeded {
                limit: LimitKind::ExtractionBytes,
                actual: bytes,
                max: self.limits.max_total_bytes,
            });
        }
        Ok(())
    }
}

struct Target {
    relative: PathBuf,
    absolute: PathBuf,
}

/// Copies at most `budget + 1` bytes of `entry` to `target`.
///
/// Any failure is scoped to this entry; a partially written file is removed.
fn write_entry(
    entry: &mut impl Read,
    target: &Path,
    budget: u64,
    name: &str,
) -> Result<u64, ExtractError> {
    let create_failed = |source: io::Error| ExtractError::CreateTarget {
        entry: name.to_string(),
        source,
    };
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(create_failed)?;
    }
    let mut out = File::create(target).map_err(create_failed)?;

    let mut limited = entry.take(budget.saturating_add(1));
    match io::copy(&mut limited, &mut out) {
        Ok(written) => Ok(written),
        Err(e) => {
            drop(out);
            let _ = std::fs::remove_file(target);
            Err(ExtractError::ReadEntry {
                entry: name.to_string(),
                source: e,
            })
        }
    }
}
