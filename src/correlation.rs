//! Correlation ids and the mapping from remote results back to pages.
//!
//! Every request line carries a `custom_id` of the form
//! `{document_id}_page_{page_number:04d}`. The remote service echoes it back
//! untouched, which is what lets results be reassembled per document.
//!
//! ## Two-tier lookup
//!
//! [`CorrelationResolver`] consults its tiers in a fixed order:
//!
//! 1. [`MappingSource::Durable`]: the [`CorrelationMap`] persisted with the
//!    job group at submission time.
//! 2. [`MappingSource::Convention`]: [`NamingConvention`] parses the id
//!    itself. This tier needs no stored state, so a lost or truncated job
//!    record never prevents retrieval.

use crate::error::BatchError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Highest page number the four-digit convention can express.
pub const MAX_PAGE_NUMBER: u32 = 9999;

static RE_CORRELATION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?s)(.+)_page_(\d{4})$").unwrap());

/// Build the correlation id for one page.
pub fn format_id(document_id: &str, page_number: u32) -> Result<String, BatchError> {
    if document_id.is_empty() {
        return Err(BatchError::InvalidCorrelationId {
            id: format!("_page_{page_number:04}"),
            reason: "document id is empty".into(),
        });
    }
    if page_number == 0 || page_number > MAX_PAGE_NUMBER {
        return Err(BatchError::InvalidCorrelationId {
            id: format!("{document_id}_page_{page_number}"),
            reason: format!("page number must be 1–{MAX_PAGE_NUMBER}"),
        });
    }
    Ok(format!("{document_id}_page_{page_number:04}"))
}

/// Split a correlation id into `(document_id, page_number)`.
///
/// The document id is everything before the **last** `_page_` marker, so
/// document names that themselves contain `_page_` still parse.
pub fn parse_id(id: &str) -> Option<(String, u32)> {
    let caps = RE_CORRELATION_ID.captures(id)?;
    let page: u32 = caps.get(2)?.as_str().parse().ok()?;
    if page == 0 {
        return None;
    }
    Some((caps.get(1)?.as_str().to_string(), page))
}

/// Where a page came from and where its working files live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub document_id: String,
    pub page_number: u32,
    pub working_dir: PathBuf,
}

/// Durable `correlation_id → MappingEntry` table stored with the job group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationMap(BTreeMap<String, MappingEntry>);

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry; returns `false` if the id was already present.
    pub fn insert(&mut self, correlation_id: impl Into<String>, entry: MappingEntry) -> bool {
        use std::collections::btree_map::Entry;
        match self.0.entry(correlation_id.into()) {
            Entry::Vacant(v) => {
                v.insert(entry);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, correlation_id: &str) -> Option<&MappingEntry> {
        self.0.get(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MappingEntry)> {
        self.0.iter()
    }

    /// Distinct working directories referenced by the map.
    pub fn working_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.0.values().map(|e| e.working_dir.clone()).collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

/// One tier of the resolver.
pub trait MappingLookup {
    fn lookup(&self, correlation_id: &str) -> Option<MappingEntry>;
}

impl MappingLookup for CorrelationMap {
    fn lookup(&self, correlation_id: &str) -> Option<MappingEntry> {
        self.get(correlation_id).cloned()
    }
}

/// The pure-function tier: parse the id and derive the working directory
/// as `{working_root}/{document_id}`.
#[derive(Debug, Clone)]
pub struct NamingConvention {
    working_root: PathBuf,
}

impl NamingConvention {
    pub fn new(working_root: impl AsRef<Path>) -> Self {
        Self {
            working_root: working_root.as_ref().to_path_buf(),
        }
    }
}

impl MappingLookup for NamingConvention {
    fn lookup(&self, correlation_id: &str) -> Option<MappingEntry> {
        let (document_id, page_number) = parse_id(correlation_id)?;
        Some(MappingEntry {
            working_dir: self.working_root.join(&document_id),
            document_id,
            page_number,
        })
    }
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingSource {
    Durable,
    Convention,
}

/// A resolved lookup and the tier that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMapping {
    pub entry: MappingEntry,
    pub source: MappingSource,
}

/// Ordered lookup over the durable map, then the naming convention.
pub struct CorrelationResolver<'a> {
    durable: Option<&'a CorrelationMap>,
    convention: NamingConvention,
}

impl<'a> CorrelationResolver<'a> {
    pub fn new(durable: Option<&'a CorrelationMap>, convention: NamingConvention) -> Self {
        Self {
            durable,
            convention,
        }
    }

    fn tiers(&self) -> [(MappingSource, Option<&dyn MappingLookup>); 2] {
        [
            (
                MappingSource::Durable,
                self.durable.map(|m| m as &dyn MappingLookup),
            ),
            (
                MappingSource::Convention,
                Some(&self.convention as &dyn MappingLookup),
            ),
        ]
    }

    pub fn resolve(&self, correlation_id: &str) -> Option<ResolvedMapping> {
        self.tiers().into_iter().find_map(|(source, tier)| {
            tier.and_then(|t| t.lookup(correlation_id))
                .map(|entry| ResolvedMapping { entry, source })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_pads_to_four_digits() {
        assert_eq!(format_id("manual", 7).unwrap(), "manual_page_0007");
        assert_eq!(format_id("manual", 9999).unwrap(), "manual_page_9999");
    }

    #[test]
    fn format_rejects_out_of_range_pages() {
        assert!(format_id("manual", 0).is_err());
        assert!(format_id("manual", 10_000).is_err());
        assert!(format_id("", 1).is_err());
    }

    #[test]
    fn every_page_round_trips() {
        for page in 1..=MAX_PAGE_NUMBER {
            let id = format_id("doc-A", page).unwrap();
            let (doc, p) = parse_id(&id).expect("parse");
            assert_eq!(format_id(&doc, p).unwrap(), id);
        }
    }

    #[test]
    fn document_ids_containing_the_marker_parse() {
        let id = format_id("scan_page_archive", 12).unwrap();
        assert_eq!(parse_id(&id), Some(("scan_page_archive".to_string(), 12)));
    }

    #[test]
    fn non_conforming_ids_do_not_parse() {
        assert_eq!(parse_id("doc_page_12"), None);
        assert_eq!(parse_id("doc_page_0000"), None);
        assert_eq!(parse_id("_page_0001"), None);
        assert_eq!(parse_id("doc-0001"), None);
        assert_eq!(parse_id("doc_page_00012"), None);
    }

    #[test]
    fn durable_tier_wins_over_convention() {
        let mut map = CorrelationMap::new();
        map.insert(
            "report_page_0003",
            MappingEntry {
                document_id: "Quarterly Report".into(),
                page_number: 3,
                working_dir: PathBuf::from("/work/custom"),
            },
        );
        let resolver = CorrelationResolver::new(Some(&map), NamingConvention::new("/work"));

        let hit = resolver.resolve("report_page_0003").unwrap();
        assert_eq!(hit.source, MappingSource::Durable);
        assert_eq!(hit.entry.document_id, "Quarterly Report");

        let fallback = resolver.resolve("report_page_0004").unwrap();
        assert_eq!(fallback.source, MappingSource::Convention);
        assert_eq!(fallback.entry.document_id, "report");
        assert_eq!(fallback.entry.page_number, 4);
        assert_eq!(fallback.entry.working_dir, PathBuf::from("/work/report"));
    }

    #[test]
    fn resolver_without_durable_map_uses_convention() {
        let resolver = CorrelationResolver::new(None, NamingConvention::new("tmp"));
        let hit = resolver.resolve("a_page_0001").unwrap();
        assert_eq!(hit.source, MappingSource::Convention);
        assert!(resolver.resolve("garbage").is_none());
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut map = CorrelationMap::new();
        let entry = MappingEntry {
            document_id: "a".into(),
            page_number: 1,
            working_dir: PathBuf::from("w"),
        };
        assert!(map.insert("a_page_0001", entry.clone()));
        assert!(!map.insert("a_page_0001", entry));
        assert_eq!(map.len(), 1);
    }
}
