//! Archive composer.
//!
//! Turns a caller-supplied flat list of [`ArchiveEntry`] into one zip stream
//! written straight to a sink. Entries are read one at a time through the
//! vault (decrypting when needed) or the remote agent, so at most one entry
//! is in flight.
//!
//! ## Lifecycle
//!
//! `Building` ends in `Success` once the central directory is written and the
//! sink flushed, or in `Aborted` on the first error. An aborted archive may
//! already have sent bytes downstream; those cannot be taken back. The
//! completion callback only runs on `Success`.

use crate::error::{ArchiveError, VaultError};
use crate::streaming::CHUNK_SIZE;
use crate::vault::Vault;
use async_zip::base::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use futures::io::AsyncWriteExt as _;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

pub const CONTENT_TYPE: &str = "application/zip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// Where an entry's bytes live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryLocation {
    /// The configured storage backend; `storage_key` is a blob key
    #[default]
    Vault,
    /// A custom drive behind the remote agent; `storage_key` is the agent path
    Agent,
}

/// One node of the flattened folder tree.
///
/// When a manifest leaves `encrypted` out, vault files are taken as
/// encrypted (every blob the vault writes is) and agent files as plain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "EntryRecord")]
pub struct ArchiveEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: EntryKind,
    pub storage_key: Option<String>,
    pub encrypted: bool,
    pub location: EntryLocation,
}

/// Wire form of [`ArchiveEntry`] with the optional fields still optional.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRecord {
    id: String,
    #[serde(default)]
    parent_id: Option<String>,
    name: String,
    kind: EntryKind,
    #[serde(default)]
    storage_key: Option<String>,
    #[serde(default)]
    encrypted: Option<bool>,
    #[serde(default)]
    location: EntryLocation,
}

impl From<EntryRecord> for ArchiveEntry {
    fn from(record: EntryRecord) -> Self {
        let encrypted = record.encrypted.unwrap_or(
            record.kind == EntryKind::File && record.location == EntryLocation::Vault,
        );
        Self {
            id: record.id,
            parent_id: record.parent_id,
            name: record.name,
            kind: record.kind,
            storage_key: record.storage_key,
            encrypted,
            location: record.location,
        }
    }
}

impl ArchiveEntry {
    pub fn file(id: &str, parent_id: &str, name: &str, storage_key: &str) -> Self {
        Self {
            id: id.to_string(),
            parent_id: Some(parent_id.to_string()),
            name: name.to_string(),
            kind: EntryKind::File,
            storage_key: Some(storage_key.to_string()),
            encrypted: true,
            location: EntryLocation::Vault,
        }
    }

    pub fn folder(id: &str, parent_id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            parent_id: Some(parent_id.to_string()),
            name: name.to_string(),
            kind: EntryKind::Folder,
            storage_key: None,
            encrypted: false,
            location: EntryLocation::Vault,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArchiveRoots {
    /// Everything below one node, paths relative to it
    Single(String),
    /// Independent selections; files land at the top level, folders under
    /// their own name
    Bulk(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    Building,
    Success,
    Aborted,
}

/// A file or empty folder placed at `path` inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry<'a> {
    pub path: String,
    pub entry: &'a ArchiveEntry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub folders: usize,
    /// Uncompressed bytes added
    pub bytes: u64,
}

/// Lay out the archive: which entries go in, and at which path, in order.
///
/// A root that is a file yields that file. Siblings sharing a name are kept
/// apart as `name (1).ext`, `name (2).ext`, ...
pub fn plan<'a>(
    entries: &'a [ArchiveEntry],
    roots: &ArchiveRoots,
) -> Result<Vec<PlannedEntry<'a>>, ArchiveError> {
    let mut planner = Planner {
        tree: Tree::new(entries),
        visited: HashSet::new(),
        used: HashSet::new(),
        out: Vec::new(),
    };

    match roots {
        ArchiveRoots::Single(root) => match planner.tree.by_id.get(root.as_str()).copied() {
            Some(entry) if entry.kind == EntryKind::File => planner.place("", entry),
            Some(entry) => {
                planner.visited.insert(entry.id.as_str());
                planner.walk(root, "");
            }
            None if planner.tree.children.contains_key(root.as_str()) => planner.walk(root, ""),
            None => return Err(ArchiveError::UnknownRoot(root.clone())),
        },
        ArchiveRoots::Bulk(ids) => {
            for id in ids {
                let entry = planner
                    .tree
                    .by_id
                    .get(id.as_str())
                    .copied()
                    .ok_or_else(|| ArchiveError::UnknownRoot(id.clone()))?;
                planner.place("", entry);
            }
        }
    }
    Ok(planner.out)
}

struct Tree<'a> {
    by_id: HashMap<&'a str, &'a ArchiveEntry>,
    children: HashMap<&'a str, Vec<&'a ArchiveEntry>>,
}

impl<'a> Tree<'a> {
    fn new(entries: &'a [ArchiveEntry]) -> Self {
        let mut by_id = HashMap::new();
        let mut children: HashMap<&str, Vec<&ArchiveEntry>> = HashMap::new();
        for entry in entries {
            by_id.insert(entry.id.as_str(), entry);
            if let Some(parent) = entry.parent_id.as_deref() {
                children.entry(parent).or_default().push(entry);
            }
        }
        Self { by_id, children }
    }

    fn has_children(&self, id: &str) -> bool {
        self.children.get(id).is_some_and(|c| !c.is_empty())
    }
}

struct Planner<'a> {
    tree: Tree<'a>,
    visited: HashSet<&'a str>,
    /// Archive paths handed out so far, folders without the trailing `/`
    used: HashSet<String>,
    out: Vec<PlannedEntry<'a>>,
}

impl<'a> Planner<'a> {
    fn walk(&mut self, node: &str, base: &str) {
        let Some(children) = self.tree.children.get(node).cloned() else {
            return;
        };
        for child in children {
            self.place(base, child);
        }
    }

    /// Put `entry` under `base`, recursing into folders.
    fn place(&mut self, base: &str, entry: &'a ArchiveEntry) {
        if entry.kind == EntryKind::Folder && !self.visited.insert(entry.id.as_str()) {
            warn!(id = %entry.id, "folder cycle in archive entries, skipping");
            return;
        }
        let path = self.claim(base, &safe_name(&entry.name), entry.kind);
        match entry.kind {
            EntryKind::File => self.out.push(PlannedEntry { path, entry }),
            EntryKind::Folder if self.tree.has_children(&entry.id) => self.walk(&entry.id, &path),
            EntryKind::Folder => self.out.push(PlannedEntry {
                path: format!("{}/", path),
                entry,
            }),
        }
    }

    fn claim(&mut self, base: &str, name: &str, kind: EntryKind) -> String {
        let mut path = join_path(base, name);
        let mut n = 1;
        while !self.used.insert(path.clone()) {
            path = join_path(base, &numbered(name, n, kind));
            n += 1;
        }
        path
    }
}

/// `report.pdf` -> `report (2).pdf`; folders and dotfiles keep the whole name.
fn numbered(name: &str, n: usize, kind: EntryKind) -> String {
    let split = match kind {
        EntryKind::File => name.rfind('.').filter(|&i| i > 0),
        EntryKind::Folder => None,
    };
    match split {
        Some(i) => format!("{} ({}){}", &name[..i], n, &name[i..]),
        None => format!("{} ({})", name, n),
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// Names become single path segments; separators and dot-segments cannot
/// move an entry elsewhere in the archive.
fn safe_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// `Content-Disposition` value suggesting `filename` for the download.
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::new();
    for byte in filename.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}

pub struct ArchiveComposer {
    vault: Vault,
}

impl ArchiveComposer {
    pub fn new(vault: Vault) -> Self {
        Self { vault }
    }

    /// Stream the archive for `roots` into `sink`. `on_complete` runs after
    /// the archive is fully written, never after a failure.
    pub async fn compose<W, F>(
        &self,
        entries: &[ArchiveEntry],
        roots: &ArchiveRoots,
        sink: W,
        on_complete: F,
    ) -> Result<ArchiveSummary, ArchiveError>
    where
        W: AsyncWrite + Unpin,
        F: FnOnce(&ArchiveSummary),
    {
        let mut state = ArchiveState::Building;
        debug!(state = ?state, entries = entries.len(), "composing archive");

        match self.build(entries, roots, sink).await {
            Ok(summary) => {
                state = ArchiveState::Success;
                info!(
                    state = ?state,
                    files = summary.files,
                    folders = summary.folders,
                    bytes = summary.bytes,
                    "archive complete"
                );
                on_complete(&summary);
                Ok(summary)
            }
            Err(e) => {
                state = ArchiveState::Aborted;
                error!(state = ?state, error = %e, "archive aborted");
                Err(e)
            }
        }
    }

    async fn build<W>(
        &self,
        entries: &[ArchiveEntry],
        roots: &ArchiveRoots,
        sink: W,
    ) -> Result<ArchiveSummary, ArchiveError>
    where
        W: AsyncWrite + Unpin,
    {
        let planned = plan(entries, roots)?;
        let mut zip = ZipFileWriter::with_tokio(sink);
        let mut summary = ArchiveSummary::default();
        let mut buf = vec![0u8; CHUNK_SIZE];

        for item in &planned {
            if item.entry.kind == EntryKind::Folder {
                let dir = ZipEntryBuilder::new(item.path.clone().into(), Compression::Stored);
                zip.write_entry_whole(dir, &[])
                    .await
                    .map_err(ArchiveError::container)?;
                summary.folders += 1;
                continue;
            }

            let mut reader = self
                .vault
                .open_entry(item.entry)
                .await
                .map_err(|e| entry_failure(&item.path, e))?;

            let builder = ZipEntryBuilder::new(item.path.clone().into(), Compression::Deflate);
            let mut writer = zip
                .write_entry_stream(builder)
                .await
                .map_err(ArchiveError::container)?;

            let mut added = 0u64;
            loop {
                let n = reader
                    .read(&mut buf)
                    .await
                    .map_err(|e| entry_failure(&item.path, e.into()))?;
                if n == 0 {
                    break;
                }
                writer
                    .write_all(&buf[..n])
                    .await
                    .map_err(ArchiveError::container)?;
                added += n as u64;
            }
            writer.close().await.map_err(ArchiveError::container)?;

            debug!(path = %item.path, bytes = added, "archive entry added");
            summary.files += 1;
            summary.bytes += added;
        }

        let mut sink = zip
            .close()
            .await
            .map_err(ArchiveError::container)?
            .into_inner();
        sink.flush().await.map_err(ArchiveError::container)?;
        Ok(summary)
    }
}

fn entry_failure(path: &str, err: VaultError) -> ArchiveError {
    if err.is_agent_unavailable() {
        ArchiveError::AgentUnavailable {
            entry: path.to_string(),
            reason: err.to_string(),
        }
    } else {
        ArchiveError::entry_read(path, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry::file("f1", "root", "a.txt", "blobs/f1"),
            ArchiveEntry::folder("d1", "root", "sub"),
            ArchiveEntry::file("f2", "d1", "b.txt", "blobs/f2"),
        ]
    }

    fn paths(planned: &[PlannedEntry<'_>]) -> Vec<String> {
        planned.iter().map(|p| p.path.clone()).collect()
    }

    #[test]
    fn single_root_builds_relative_paths() {
        let entries = scenario();
        let planned = plan(&entries, &ArchiveRoots::Single("root".into())).expect("plan");
        assert_eq!(paths(&planned), vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn bulk_roots_place_folders_under_their_name() {
        let mut entries = scenario();
        entries.push(ArchiveEntry::folder("d2", "root", "empty"));
        let planned = plan(
            &entries,
            &ArchiveRoots::Bulk(vec!["d1".into(), "f1".into(), "d2".into()]),
        )
        .expect("plan");
        assert_eq!(paths(&planned), vec!["sub/b.txt", "a.txt", "empty/"]);
    }

    #[test]
    fn unknown_roots_are_rejected() {
        let entries = scenario();
        assert!(matches!(
            plan(&entries, &ArchiveRoots::Single("nope".into())),
            Err(ArchiveError::UnknownRoot(_))
        ));
        assert!(matches!(
            plan(&entries, &ArchiveRoots::Bulk(vec!["f1".into(), "nope".into()])),
            Err(ArchiveError::UnknownRoot(id)) if id == "nope"
        ));
    }

    #[test]
    fn cycles_terminate() {
        let entries = vec![
            ArchiveEntry::folder("a", "b", "a"),
            ArchiveEntry::folder("b", "a", "b"),
            ArchiveEntry::file("f", "b", "f.txt", "k"),
        ];
        let planned = plan(&entries, &ArchiveRoots::Single("a".into())).expect("plan");
        assert_eq!(paths(&planned), vec!["b/f.txt"]);
    }

    #[test]
    fn hostile_names_stay_single_segments() {
        let entries = vec![
            ArchiveEntry::file("f1", "root", "../../etc/passwd", "k1"),
            ArchiveEntry::file("f2", "root", "..", "k2"),
        ];
        let planned = plan(&entries, &ArchiveRoots::Single("root".into())).expect("plan");
        assert_eq!(paths(&planned), vec![".._.._etc_passwd", "_"]);
    }

    #[test]
    fn roots_deserialize_from_string_or_list() {
        let single: ArchiveRoots = serde_json::from_str(r#""root""#).expect("single");
        assert_eq!(single, ArchiveRoots::Single("root".into()));
        let bulk: ArchiveRoots = serde_json::from_str(r#"["a","b"]"#).expect("bulk");
        assert_eq!(bulk, ArchiveRoots::Bulk(vec!["a".into(), "b".into()]));

    }

    #[test]
    fn manifest_entries_default_encryption_by_location() {
        let entries: Vec<ArchiveEntry> = serde_json::from_str(
            r#"[
                {"id":"f1","parentId":"root","name":"a.txt","kind":"file","storageKey":"k"},
                {"id":"f2","parentId":"root","name":"b.txt","kind":"file","storageKey":"/mnt/b.txt","location":"agent"},
                {"id":"f3","parentId":"root","name":"c.txt","kind":"file","storageKey":"plain/c","encrypted":false},
                {"id":"d1","parentId":"root","name":"sub","kind":"folder"}
            ]"#,
        )
        .expect("entries");

        assert_eq!(entries[0], ArchiveEntry::file("f1", "root", "a.txt", "k"));
        assert_eq!(entries[1].location, EntryLocation::Agent);
        assert!(!entries[1].encrypted);
        assert!(!entries[2].encrypted);
        assert_eq!(entries[3], ArchiveEntry::folder("d1", "root", "sub"));

        let json = serde_json::to_string(&entries[0]).expect("serialize");
        assert!(json.contains(r#""encrypted":true"#));
        let back: ArchiveEntry = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, entries[0]);
    }

    #[test]
    fn single_file_root_yields_that_file() {
        let entries = scenario();
        let planned = plan(&entries, &ArchiveRoots::Single("f2".into())).expect("plan");
        assert_eq!(paths(&planned), vec!["b.txt"]);
        assert_eq!(planned[0].entry.id, "f2");
    }

    #[test]
    fn sibling_name_clashes_are_numbered() {
        let entries = vec![
            ArchiveEntry::file("f1", "root", "report.pdf", "k1"),
            ArchiveEntry::file("f2", "root", "report.pdf", "k2"),
            ArchiveEntry::file("f3", "root", "report.pdf", "k3"),
            ArchiveEntry::folder("d1", "root", "docs"),
            ArchiveEntry::folder("d2", "root", "docs"),
            ArchiveEntry::file("f4", "d1", "x", "k4"),
            ArchiveEntry::file("f5", "d2", "x", "k5"),
            ArchiveEntry::file("f6", "root", ".env", "k6"),
            ArchiveEntry::file("f7", "root", ".env", "k7"),
        ];
        let planned = plan(&entries, &ArchiveRoots::Single("root".into())).expect("plan");
        assert_eq!(
            paths(&planned),
            vec![
                "report.pdf",
                "report (1).pdf",
                "report (2).pdf",
                "docs/x",
                "docs (1)/x",
                ".env",
                ".env (1)",
            ]
        );

        let bulk = plan(&entries, &ArchiveRoots::Bulk(vec!["f1".into(), "f2".into()])).expect("bulk");
        assert_eq!(paths(&bulk), vec!["report.pdf", "report (1).pdf"]);
    }

    #[test]
    fn disposition_carries_both_filename_forms() {
        assert_eq!(
            content_disposition("report 2024.zip"),
            "attachment; filename=\"report 2024.zip\"; filename*=UTF-8''report%202024.zip"
        );
        assert!(content_disposition("rés\"umé.zip").starts_with("attachment; filename=\"r_s_um_.zip\""));
    }
}
