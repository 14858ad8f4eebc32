use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::blobs::BlobStore;
use super::error::{CacheError, Result};
use super::index::{self, MetadataIndex};

/// Rows examined per query while scanning file references
const SCAN_CHUNK: usize = 100;

/// Scan the index and the file system for inconsistencies and optionally
/// repair them: rows pointing at missing blob files (fix: drop the row),
/// blob files referenced by no row (fix: remove the file), drifted
/// count/size totals (fix: recompute), and empty partition directories
/// (fix: remove).
///
/// A failed database integrity check without `fix` is surfaced as
/// `Corruption`; with `fix` the findings are recorded and a VACUUM is
/// attempted before the remaining scans run.
pub(crate) fn run(
    index: &MetadataIndex,
    blobs: &BlobStore,
    dir: &Path,
    fix: bool,
) -> Result<Vec<String>> {
    let conn = index.lock();
    let mut issues = Vec::new();

    let integrity = index::integrity_check(&conn)?;
    let intact = integrity.len() == 1 && integrity[0] == "ok";
    if !intact {
        if !fix {
            return Err(CacheError::Corruption(integrity.join("; ")));
        }
        for message in integrity {
            warn!(%message, "integrity check failed");
            issues.push(format!("integrity: {message}"));
        }
    }
    if fix {
        conn.execute_batch("VACUUM")?;
    }

    // Rows against the file system.
    let mut referenced: HashSet<String> = HashSet::new();
    let mut cursor = 0i64;
    loop {
        let rows = index::file_rows_after(&conn, cursor, SCAN_CHUNK)?;
        if rows.is_empty() {
            break;
        }
        for (rowid, filename) in rows {
            cursor = rowid;
            referenced.insert(filename.clone());
            if !blobs.path(&filename).exists() {
                warn!(file = %filename, "blob file missing for live row");
                issues.push(format!("missing blob file: {filename}"));
                if fix {
                    index::delete_rowid(&conn, rowid)?;
                }
            }
        }
    }

    // Trigger-maintained totals against the table.
    let counted = index::read_counter(&conn, index::COUNT)?;
    let actual = index::row_count(&conn)?;
    if counted != actual {
        warn!(counted, actual, "entry count drifted");
        issues.push(format!("count drift: settings {counted} != rows {actual}"));
        if fix {
            index::set_counter(&conn, index::COUNT, actual)?;
        }
    }

    let sized = index::read_counter(&conn, index::SIZE)?;
    let summed = index::sum_size(&conn)?;
    if sized != summed {
        warn!(sized, summed, "size total drifted");
        issues.push(format!("size drift: settings {sized} != sum {summed}"));
        if fix {
            index::set_counter(&conn, index::SIZE, summed)?;
        }
    }

    // The file system against the rows. Blob files live two partition
    // levels deep; files at the directory root are the database itself.
    let (files, mut dirs) = walk_subdirs(dir)?;
    for path in files {
        let relative = match path.strip_prefix(dir) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => continue,
        };
        if !referenced.contains(&relative) {
            warn!(file = %relative, "unreferenced blob file");
            issues.push(format!("unreferenced file: {relative}"));
            if fix {
                fs::remove_file(&path)?;
            }
        }
    }

    // Deepest directories first so emptied parents follow their children.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for path in dirs {
        if fs::read_dir(&path)?.next().is_none() {
            issues.push(format!("empty directory: {}", path.display()));
            if fix {
                fs::remove_dir(&path)?;
            }
        }
    }

    Ok(issues)
}

/// Collect all files and directories below the cache root, skipping
/// root-level files (the database and its journals)
fn walk_subdirs(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut stack: Vec<PathBuf> = Vec::new();

    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            stack.push(path);
        }
    }
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
        dirs.push(current);
    }
    Ok((files, dirs))
}
