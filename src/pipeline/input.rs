//! Input discovery: find pre-rendered page images and build WorkUnits.
//!
//! Two layouts are accepted:
//!
//! ```text
//! input/                        input/manual/
//! ├── manual/                   ├── page_0001.jpg
//! │   ├── page_0001.jpg         └── page_0002.jpg
//! │   └── page_0002.jpg
//! └── report/
//!     └── page_0001.png
//! ```
//!
//! A directory holding page files directly is one document named after the
//! directory; otherwise each sub-directory with page files is a document.
//! Page numbers come from the file name, never from listing order.

use crate::error::BatchError;
use crate::model::WorkUnit;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

static RE_PAGE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^page_(\d{1,4})\.(png|jpe?g|webp)$").unwrap());

/// Page number encoded in a page image file name, if it is one.
pub fn page_number(file_name: &str) -> Option<u32> {
    let caps = RE_PAGE_FILE.captures(file_name)?;
    let n: u32 = caps.get(1)?.as_str().parse().ok()?;
    (n > 0).then_some(n)
}

/// Page images of one directory, keyed by page number.
fn scan_pages(dir: &Path) -> Result<BTreeMap<u32, PathBuf>, BatchError> {
    let entries = std::fs::read_dir(dir).map_err(|_| BatchError::InputNotFound {
        path: dir.to_path_buf(),
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut pages: BTreeMap<u32, PathBuf> = BTreeMap::new();
    for path in paths {
        let Some(n) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(page_number)
        else {
            continue;
        };
        if let Some(first) = pages.get(&n) {
            warn!(
                "Duplicate page {} in {}: keeping {}, ignoring {}",
                n,
                dir.display(),
                first.display(),
                path.display()
            );
            continue;
        }
        pages.insert(n, path);
    }
    Ok(pages)
}

fn dir_name(dir: &Path) -> Option<String> {
    dir.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

fn units_for(document_id: &str, dir: &Path, pages: BTreeMap<u32, PathBuf>) -> Result<Vec<WorkUnit>, BatchError> {
    pages
        .into_iter()
        .map(|(n, path)| WorkUnit::new(document_id, n, path, dir))
        .collect()
}

/// Discover all work units under `input_dir`, ordered by document then page.
pub fn discover(input_dir: &Path) -> Result<Vec<WorkUnit>, BatchError> {
    if !input_dir.is_dir() {
        return Err(BatchError::InputNotFound {
            path: input_dir.to_path_buf(),
        });
    }

    let direct = scan_pages(input_dir)?;
    let mut units = Vec::new();

    if !direct.is_empty() {
        let doc = dir_name(input_dir).unwrap_or_else(|| "document".to_string());
        units = units_for(&doc, input_dir, direct)?;
    } else {
        let mut subdirs: Vec<PathBuf> = std::fs::read_dir(input_dir)
            .map_err(|_| BatchError::InputNotFound {
                path: input_dir.to_path_buf(),
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        subdirs.sort();

        for dir in subdirs {
            let Some(doc) = dir_name(&dir) else { continue };
            let pages = scan_pages(&dir)?;
            if pages.is_empty() {
                debug!("Skipping {}: no page images", dir.display());
                continue;
            }
            units.extend(units_for(&doc, &dir, pages)?);
        }
    }

    if units.is_empty() {
        return Err(BatchError::NoWorkUnits {
            path: input_dir.to_path_buf(),
        });
    }

    let docs = units
        .iter()
        .map(|u| u.document_id.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    info!(
        "Discovered {} page(s) across {} document(s) in {}",
        units.len(),
        docs,
        input_dir.display()
    );
    Ok(units)
}
