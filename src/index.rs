//! On-disk vector index: two artifacts kept in lockstep.
//!
//! - `vectors.bin` — a 12-byte header (magic, format version, dimension)
//!   followed by packed little-endian `f32` rows. A row's position is its
//!   slot.
//! - `meta.jsonl` — tagged JSON lines: one `header` line (format version,
//!   embedding model, creation time), then `doc` and `entry` lines. Every
//!   entry records the slot of its vector.
//!
//! The pair is consistent when the entry count equals the vector row count
//! and entry slots are exactly `0..n`. Writes are ordered so that any crash
//! leaves a state [`VectorIndex::open`] can repair:
//!
//! - flush appends vectors first, metadata second. A crash in between
//!   leaves trailing vector rows no entry references; repair discards them.
//! - delete rewrites metadata first (survivors keep their old slots), then
//!   compacts the vector file in ascending slot order, then renumbers the
//!   metadata. A crash after step one leaves in-range sparse slots (compact
//!   and drop the unreferenced rows); after step two the counts match but
//!   slots run past the file (the rows are already compacted, so slot rank
//!   is the row position); a torn trailing JSONL line is dropped.
//!
//! Structural damage repair cannot resolve (bad magic, a format version or
//! embedding model this build does not understand) is surfaced as an error
//! telling the operator to re-ingest with `--force`.
//!
//! Inserts stage in memory; `search` sees only rows committed by the last
//! completed `flush`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{Document, IndexEntry};

const VECTOR_MAGIC: &[u8; 4] = b"QRYV";
const FORMAT_VERSION: u32 = 1;
const VECTOR_HEADER_LEN: u64 = 12;

pub const VECTORS_FILE: &str = "vectors.bin";
pub const META_FILE: &str = "meta.jsonl";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{path} is not a vector index artifact; re-ingest with --force")]
    BadMagic { path: PathBuf },
    #[error("index format version {found} is not supported (expected {FORMAT_VERSION}); re-ingest with --force")]
    Version { found: u32 },
    #[error("index was built with embedding model '{indexed}' but the config now says '{configured}'; re-ingest with --force")]
    ModelChanged { indexed: String, configured: String },
    #[error("vector dimension {got} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// What the startup repair pass had to do, if anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Vector rows no entry referenced, discarded.
    pub orphaned_vectors: usize,
    /// Entries whose slot pointed past the vector file, dropped.
    pub orphaned_entries: usize,
    /// Metadata lines that did not parse (torn trailing write), dropped.
    pub dropped_lines: usize,
    /// Trailing bytes shorter than one vector row, truncated.
    pub truncated_tail_bytes: usize,
    /// Documents left with no entries after the above, dropped.
    pub dropped_documents: usize,
    /// Slots were not `0..n` and had to be reassigned.
    pub renumbered: bool,
}

impl RepairReport {
    fn was_needed(&self) -> bool {
        *self != RepairReport::default()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct MetaHeader {
    version: u32,
    model: String,
    created_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum MetaLine {
    Header(MetaHeader),
    Doc(Document),
    Entry(IndexEntry),
}

/// A search hit: L2 distance plus the entry it belongs to.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub distance: f32,
    pub entry: IndexEntry,
}

#[derive(Debug)]
pub struct VectorIndex {
    dir: PathBuf,
    header: MetaHeader,
    /// 0 until the first vector pins it.
    dims: usize,
    /// Dimension recorded in the vector file header on disk.
    disk_dims: usize,
    documents: Vec<Document>,
    entries: Vec<IndexEntry>,
    /// Committed rows, packed; row i serves entry slot i.
    vectors: Vec<f32>,
    staged_documents: Vec<Document>,
    staged_entries: Vec<IndexEntry>,
    staged_vectors: Vec<f32>,
    repair: Option<RepairReport>,
}

impl VectorIndex {
    /// Open the index in `dir`, creating an empty pair if none exists and
    /// repairing a torn pair if a previous run crashed mid-write.
    pub fn open(dir: &Path, model: &str) -> Result<Self, IndexError> {
        fs::create_dir_all(dir)?;
        let vectors_path = dir.join(VECTORS_FILE);
        let meta_path = dir.join(META_FILE);

        if !vectors_path.exists() && !meta_path.exists() {
            let index = Self::create(dir, model)?;
            return Ok(index);
        }
        if !meta_path.exists() {
            // Vectors without any metadata are all orphans.
            warn!(path = %vectors_path.display(), "index metadata missing; resetting vector file");
            fs::remove_file(&vectors_path)?;
            return Self::create(dir, model);
        }

        let (disk_dims, mut vectors, truncated_tail_bytes) = if vectors_path.exists() {
            read_vectors(&vectors_path)?
        } else {
            warn!(path = %meta_path.display(), "vector file missing; entries will be dropped");
            (0, Vec::new(), 0)
        };

        let (header, mut documents, mut entries, dropped_lines) = read_meta(&meta_path)?;
        if header.version != FORMAT_VERSION {
            return Err(IndexError::Version {
                found: header.version,
            });
        }
        if header.model != model {
            return Err(IndexError::ModelChanged {
                indexed: header.model,
                configured: model.to_string(),
            });
        }

        let dims = disk_dims;
        let vec_count = if dims > 0 { vectors.len() / dims } else { 0 };
        let mut report = RepairReport {
            dropped_lines,
            truncated_tail_bytes,
            ..Default::default()
        };

        entries.sort_by_key(|e| e.slot);
        let in_range = entries.iter().all(|e| (e.slot as usize) < vec_count);
        let identity = in_range
            && entries.len() == vec_count
            && entries.iter().enumerate().all(|(i, e)| e.slot as usize == i);

        if !identity {
            report.renumbered = true;
            if !in_range && entries.len() == vec_count {
                // Delete crashed after the vector rewrite: rows are already
                // compacted, slot rank is the row position.
                debug!(entries = entries.len(), "index slots out of range with matching counts; renumbering");
            } else {
                if !in_range {
                    let before = entries.len();
                    entries.retain(|e| (e.slot as usize) < vec_count);
                    report.orphaned_entries = before - entries.len();
                }
                // Keep only referenced rows, in ascending slot order.
                let mut compacted = Vec::with_capacity(entries.len() * dims);
                for entry in &entries {
                    let at = entry.slot as usize * dims;
                    compacted.extend_from_slice(&vectors[at..at + dims]);
                }
                report.orphaned_vectors = vec_count - entries.len();
                vectors = compacted;
            }
            for (i, entry) in entries.iter_mut().enumerate() {
                entry.slot = i as u32;
            }
            let before = documents.len();
            documents.retain(|d| entries.iter().any(|e| e.document_id == d.id));
            report.dropped_documents = before - documents.len();
        }

        let mut index = Self {
            dir: dir.to_path_buf(),
            header,
            dims,
            disk_dims: dims,
            documents,
            entries,
            vectors,
            staged_documents: Vec::new(),
            staged_entries: Vec::new(),
            staged_vectors: Vec::new(),
            repair: None,
        };

        if report.was_needed() {
            info!(
                orphaned_vectors = report.orphaned_vectors,
                orphaned_entries = report.orphaned_entries,
                dropped_lines = report.dropped_lines,
                dropped_documents = report.dropped_documents,
                "repaired index artifacts"
            );
            index.rewrite_pair()?;
            index.repair = Some(report);
        }

        Ok(index)
    }

    fn create(dir: &Path, model: &str) -> Result<Self, IndexError> {
        let header = MetaHeader {
            version: FORMAT_VERSION,
            model: model.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let index = Self {
            dir: dir.to_path_buf(),
            header,
            dims: 0,
            disk_dims: 0,
            documents: Vec::new(),
            entries: Vec::new(),
            vectors: Vec::new(),
            staged_documents: Vec::new(),
            staged_entries: Vec::new(),
            staged_vectors: Vec::new(),
            repair: None,
        };
        index.rewrite_pair()?;
        Ok(index)
    }

    /// Delete both artifacts and start over, keeping the configured model.
    /// Discards staged rows too.
    pub fn rebuild(&mut self) -> Result<(), IndexError> {
        let vectors_path = self.dir.join(VECTORS_FILE);
        let meta_path = self.dir.join(META_FILE);
        if vectors_path.exists() {
            fs::remove_file(&vectors_path)?;
        }
        if meta_path.exists() {
            fs::remove_file(&meta_path)?;
        }
        let fresh = Self::create(&self.dir, &self.header.model)?;
        *self = fresh;
        Ok(())
    }

    /// Stage a document and its rows. Slots are assigned here; nothing is
    /// durable or visible until [`flush`](Self::flush).
    pub fn insert(
        &mut self,
        document: Document,
        rows: Vec<(IndexEntry, Vec<f32>)>,
    ) -> Result<(), IndexError> {
        for (_, vector) in &rows {
            if self.dims == 0 {
                self.dims = vector.len();
            } else if vector.len() != self.dims {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dims,
                    got: vector.len(),
                });
            }
        }
        let mut next = (self.entries.len() + self.staged_entries.len()) as u32;
        for (mut entry, vector) in rows {
            entry.slot = next;
            next += 1;
            self.staged_entries.push(entry);
            self.staged_vectors.extend_from_slice(&vector);
        }
        self.staged_documents.push(document);
        Ok(())
    }

    /// Make staged rows durable and visible: vector rows are appended before
    /// their metadata lines, so a crash in between leaves only trailing
    /// orphan rows for the next open to discard.
    pub fn flush(&mut self) -> Result<(), IndexError> {
        if self.staged_entries.is_empty() && self.staged_documents.is_empty() {
            return Ok(());
        }

        let vectors_path = self.dir.join(VECTORS_FILE);
        let mut file = OpenOptions::new().write(true).open(&vectors_path)?;
        if self.disk_dims != self.dims {
            file.seek(SeekFrom::Start(8))?;
            file.write_all(&(self.dims as u32).to_le_bytes())?;
            self.disk_dims = self.dims;
        }
        file.seek(SeekFrom::End(0))?;
        {
            let mut writer = BufWriter::new(&file);
            for value in &self.staged_vectors {
                writer.write_all(&value.to_le_bytes())?;
            }
            writer.flush()?;
        }
        file.sync_all()?;

        let file = OpenOptions::new()
            .append(true)
            .open(self.dir.join(META_FILE))?;
        {
            let mut writer = BufWriter::new(&file);
            for doc in &self.staged_documents {
                let line = serde_json::to_string(&MetaLine::Doc(doc.clone()))?;
                writeln!(writer, "{}", line)?;
            }
            for entry in &self.staged_entries {
                let line = serde_json::to_string(&MetaLine::Entry(entry.clone()))?;
                writeln!(writer, "{}", line)?;
            }
            writer.flush()?;
        }
        file.sync_all()?;

        self.documents.append(&mut self.staged_documents);
        self.entries.append(&mut self.staged_entries);
        self.vectors.append(&mut self.staged_vectors);
        Ok(())
    }

    /// Remove a document's rows from the committed state. Ordered so any
    /// crash leaves a repairable pair: metadata without the doomed rows
    /// first, compacted vectors second, renumbered metadata last.
    pub fn delete_by_document(&mut self, document_id: &str) -> Result<usize, IndexError> {
        let doomed = self
            .entries
            .iter()
            .filter(|e| e.document_id == document_id)
            .count();
        if doomed == 0 && !self.documents.iter().any(|d| d.id == document_id) {
            return Ok(0);
        }

        self.documents.retain(|d| d.id != document_id);
        self.entries.retain(|e| e.document_id != document_id);
        self.write_meta()?;

        let dims = self.dims;
        let mut compacted = Vec::with_capacity(self.entries.len() * dims);
        for entry in &self.entries {
            let at = entry.slot as usize * dims;
            compacted.extend_from_slice(&self.vectors[at..at + dims]);
        }
        self.vectors = compacted;
        self.write_vectors()?;

        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.slot = i as u32;
        }
        self.write_meta()?;

        // Staged rows land after the survivors, so their slots shift too.
        let base = self.entries.len() as u32;
        for (i, entry) in self.staged_entries.iter_mut().enumerate() {
            entry.slot = base + i as u32;
        }
        Ok(doomed)
    }

    /// Up to `k` committed entries by ascending L2 distance, slot order on
    /// ties. Staged rows are not visible.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredEntry>, IndexError> {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                got: query.len(),
            });
        }

        let mut ranked: Vec<(f32, usize)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let at = entry.slot as usize * self.dims;
                let row = &self.vectors[at..at + self.dims];
                (l2_distance(query, row), i)
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(self.entries[a.1].slot.cmp(&self.entries[b.1].slot))
        });
        ranked.truncate(k);
        Ok(ranked
            .into_iter()
            .map(|(distance, i)| ScoredEntry {
                distance,
                entry: self.entries[i].clone(),
            })
            .collect())
    }

    pub fn model(&self) -> &str {
        &self.header.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn find_document(&self, id: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == id)
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn repair_report(&self) -> Option<&RepairReport> {
        self.repair.as_ref()
    }

    /// On-disk byte sizes of (vectors.bin, meta.jsonl).
    pub fn artifact_sizes(&self) -> (u64, u64) {
        let size = |name: &str| {
            fs::metadata(self.dir.join(name))
                .map(|m| m.len())
                .unwrap_or(0)
        };
        (size(VECTORS_FILE), size(META_FILE))
    }

    fn rewrite_pair(&self) -> Result<(), IndexError> {
        self.write_meta()?;
        self.write_vectors()?;
        Ok(())
    }

    /// Full rewrite via tmp + rename, the committed state only.
    fn write_meta(&self) -> Result<(), IndexError> {
        let path = self.dir.join(META_FILE);
        let tmp = path.with_extension("jsonl.tmp");
        let file = File::create(&tmp)?;
        {
            let mut writer = BufWriter::new(&file);
            let line = serde_json::to_string(&MetaLine::Header(self.header.clone()))?;
            writeln!(writer, "{}", line)?;
            for doc in &self.documents {
                let line = serde_json::to_string(&MetaLine::Doc(doc.clone()))?;
                writeln!(writer, "{}", line)?;
            }
            for entry in &self.entries {
                let line = serde_json::to_string(&MetaLine::Entry(entry.clone()))?;
                writeln!(writer, "{}", line)?;
            }
            writer.flush()?;
        }
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn write_vectors(&self) -> Result<(), IndexError> {
        let path = self.dir.join(VECTORS_FILE);
        let tmp = path.with_extension("bin.tmp");
        let file = File::create(&tmp)?;
        {
            let mut writer = BufWriter::new(&file);
            writer.write_all(VECTOR_MAGIC)?;
            writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
            writer.write_all(&(self.dims as u32).to_le_bytes())?;
            for value in &self.vectors {
                writer.write_all(&value.to_le_bytes())?;
            }
            writer.flush()?;
        }
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Returns (dims, packed rows, truncated tail bytes). A tail shorter than
/// one row is a torn append and is ignored.
fn read_vectors(path: &Path) -> Result<(usize, Vec<f32>, usize), IndexError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; VECTOR_HEADER_LEN as usize];
    if file.read_exact(&mut header).is_err() {
        return Err(IndexError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    if &header[0..4] != VECTOR_MAGIC {
        return Err(IndexError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FORMAT_VERSION {
        return Err(IndexError::Version { found: version });
    }
    let dims = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;

    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    if dims == 0 {
        // Nothing was ever flushed; any payload bytes are torn garbage.
        return Ok((0, Vec::new(), payload.len()));
    }

    let row_bytes = dims * 4;
    let tail = payload.len() % row_bytes;
    let whole = payload.len() - tail;
    if tail > 0 {
        warn!(bytes = tail, "ignoring torn tail of vector file");
    }

    let mut vectors = Vec::with_capacity(whole / 4);
    for chunk in payload[..whole].chunks_exact(4) {
        vectors.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok((dims, vectors, tail))
}

/// Returns (header, docs, entries, dropped line count). Only a torn line is
/// tolerated; a missing or foreign header line is structural damage.
fn read_meta(path: &Path) -> Result<(MetaHeader, Vec<Document>, Vec<IndexEntry>, usize), IndexError>
{
    let reader = BufReader::new(File::open(path)?);
    let mut header: Option<MetaHeader> = None;
    let mut documents = Vec::new();
    let mut entries = Vec::new();
    let mut dropped = 0usize;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MetaLine>(&line) {
            Ok(MetaLine::Header(h)) => {
                if header.is_none() {
                    header = Some(h);
                }
            }
            Ok(MetaLine::Doc(d)) => documents.push(d),
            Ok(MetaLine::Entry(e)) => entries.push(e),
            Err(e) => {
                warn!(error = %e, "dropping unparseable index metadata line");
                dropped += 1;
            }
        }
    }

    let header = header.ok_or_else(|| IndexError::BadMagic {
        path: path.to_path_buf(),
    })?;
    Ok((header, documents, entries, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn doc(id: &str, chunks: u32) -> Document {
        Document {
            id: id.to_string(),
            path: format!("/corpus/{}.txt", id),
            title: id.to_string(),
            content_hash: format!("hash-{}", id),
            method: crate::models::ExtractionMethod::Direct,
            page_count: 1,
            chunk_count: chunks,
            ingested_at: Utc::now(),
        }
    }

    fn entry(doc_id: &str, index: u32) -> IndexEntry {
        IndexEntry {
            slot: 0,
            document_id: doc_id.to_string(),
            chunk_id: format!("{}:{}", doc_id, index),
            chunk_index: index,
            page_first: 1,
            page_last: 1,
            start: 0,
            end: 10,
            text: format!("text of {} chunk {}", doc_id, index),
        }
    }

    fn insert_doc(index: &mut VectorIndex, id: &str, vectors: &[Vec<f32>]) {
        let rows: Vec<(IndexEntry, Vec<f32>)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (entry(id, i as u32), v.clone()))
            .collect();
        index.insert(doc(id, vectors.len() as u32), rows).unwrap();
    }

    #[test]
    fn fresh_index_is_empty() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(dir.path(), "hash").unwrap();
        assert_eq!(index.entry_count(), 0);
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
        assert!(index.repair_report().is_none());
    }

    #[test]
    fn search_orders_by_distance() {
        let dir = TempDir::new().unwrap();
        let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
        insert_doc(
            &mut index,
            "a",
            &[vec![0.0, 0.0], vec![1.0, 0.0], vec![5.0, 5.0]],
        );
        index.flush().unwrap();

        let hits = index.search(&[0.9, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.chunk_id, "a:1");
        assert_eq!(hits[1].entry.chunk_id, "a:0");
        assert!(hits[0].distance < hits[1].distance);
    }

    #[test]
    fn equal_distances_break_ties_by_slot() {
        let dir = TempDir::new().unwrap();
        let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
        insert_doc(&mut index, "a", &[vec![1.0, 0.0], vec![0.0, 1.0]]);
        index.flush().unwrap();

        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].entry.slot, 0);
        assert_eq!(hits[1].entry.slot, 1);
    }

    #[test]
    fn staged_rows_are_invisible_until_flush() {
        let dir = TempDir::new().unwrap();
        let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
        insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);

        assert_eq!(index.entry_count(), 0);
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());

        index.flush().unwrap();
        assert_eq!(index.entry_count(), 1);
        assert_eq!(index.search(&[1.0, 0.0], 5).unwrap().len(), 1);
    }

    #[test]
    fn reopen_sees_flushed_state() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
            insert_doc(&mut index, "a", &[vec![1.0, 2.0], vec![3.0, 4.0]]);
            index.flush().unwrap();
            insert_doc(&mut index, "b", &[vec![5.0, 6.0]]);
            // b is never flushed.
        }
        let index = VectorIndex::open(dir.path(), "hash").unwrap();
        assert_eq!(index.document_count(), 1);
        assert_eq!(index.entry_count(), 2);
        assert!(index.repair_report().is_none());
    }

    #[test]
    fn delete_compacts_and_renumbers() {
        let dir = TempDir::new().unwrap();
        let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
        insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
        insert_doc(&mut index, "b", &[vec![0.0, 1.0], vec![0.0, 2.0]]);
        insert_doc(&mut index, "c", &[vec![9.0, 9.0]]);
        index.flush().unwrap();

        let removed = index.delete_by_document("b").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.entry_count(), 2);
        assert_eq!(index.document_count(), 2);

        // Survivors keep their relative order under dense slots.
        let hits = index.search(&[1.0, 0.0], 10).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.chunk_id.as_str()).collect();
        assert!(ids.contains(&"a:0"));
        assert!(ids.contains(&"c:0"));

        let reopened = VectorIndex::open(dir.path(), "hash").unwrap();
        assert_eq!(reopened.entry_count(), 2);
        assert!(reopened.repair_report().is_none());
    }

    #[test]
    fn delete_of_unknown_document_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
        insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
        index.flush().unwrap();
        assert_eq!(index.delete_by_document("nope").unwrap(), 0);
        assert_eq!(index.entry_count(), 1);
    }

    #[test]
    fn trailing_orphan_vectors_are_discarded() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
            insert_doc(&mut index, "a", &[vec![1.0, 0.0], vec![0.0, 1.0]]);
            index.flush().unwrap();
        }
        // Simulate a crash between the vector append and the metadata
        // append: rows with no entries.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(VECTORS_FILE))
            .unwrap();
        for v in [7.0f32, 7.0, 8.0, 8.0] {
            file.write_all(&v.to_le_bytes()).unwrap();
        }
        drop(file);

        let index = VectorIndex::open(dir.path(), "hash").unwrap();
        assert_eq!(index.entry_count(), 2);
        let report = index.repair_report().unwrap();
        assert_eq!(report.orphaned_vectors, 2);

        // The pair is consistent again on disk.
        let reopened = VectorIndex::open(dir.path(), "hash").unwrap();
        assert!(reopened.repair_report().is_none());
    }

    #[test]
    fn crash_after_metadata_delete_is_repaired() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
            insert_doc(&mut index, "a", &[vec![1.0, 0.0], vec![2.0, 0.0]]);
            insert_doc(&mut index, "b", &[vec![0.0, 3.0]]);
            index.flush().unwrap();
        }
        // Simulate a delete of b that crashed after the metadata rewrite:
        // survivors keep old slots, the vector file still has all rows.
        let meta_path = dir.path().join(META_FILE);
        let kept: String = fs::read_to_string(&meta_path)
            .unwrap()
            .lines()
            .filter(|l| !l.contains("\"b\""))
            .map(|l| format!("{}\n", l))
            .collect();
        fs::write(&meta_path, kept).unwrap();

        let index = VectorIndex::open(dir.path(), "hash").unwrap();
        assert_eq!(index.entry_count(), 2);
        assert_eq!(index.document_count(), 1);
        assert_eq!(index.repair_report().unwrap().orphaned_vectors, 1);

        // a's vectors survived intact.
        let hits = index.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].entry.chunk_id, "a:0");
        assert!(hits[0].distance < 1e-6);
    }

    #[test]
    fn crash_before_renumber_is_resolved_by_rank() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
            insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
            insert_doc(&mut index, "b", &[vec![0.0, 2.0], vec![0.0, 3.0]]);
            index.flush().unwrap();
            // Delete a, then put the metadata back to its pre-renumber form:
            // slots 1 and 2 against a 2-row compacted file.
            index.delete_by_document("a").unwrap();
        }
        let meta_path = dir.path().join(META_FILE);
        let shifted: String = fs::read_to_string(&meta_path)
            .unwrap()
            .lines()
            .map(|l| {
                l.replace("\"slot\":1", "\"slot\":2")
                    .replace("\"slot\":0", "\"slot\":1")
            })
            .map(|l| format!("{}\n", l))
            .collect();
        fs::write(&meta_path, shifted).unwrap();

        let index = VectorIndex::open(dir.path(), "hash").unwrap();
        assert_eq!(index.entry_count(), 2);
        // No rows were lost; slot rank mapped b:0 to row 0.
        let hits = index.search(&[0.0, 2.0], 1).unwrap();
        assert_eq!(hits[0].entry.chunk_id, "b:0");
        assert!(hits[0].distance < 1e-6);
    }

    #[test]
    fn torn_trailing_metadata_line_is_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
            insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
            index.flush().unwrap();
        }
        let meta_path = dir.path().join(META_FILE);
        let mut file = OpenOptions::new().append(true).open(&meta_path).unwrap();
        file.write_all(b"{\"kind\":\"entry\",\"slot\":9,\"docu").unwrap();
        drop(file);

        let index = VectorIndex::open(dir.path(), "hash").unwrap();
        assert_eq!(index.entry_count(), 1);
        assert_eq!(index.repair_report().unwrap().dropped_lines, 1);
    }

    #[test]
    fn torn_vector_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
            insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
            index.flush().unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(VECTORS_FILE))
            .unwrap();
        file.write_all(&[0xAB, 0xCD, 0xEF]).unwrap();
        drop(file);

        let index = VectorIndex::open(dir.path(), "hash").unwrap();
        assert_eq!(index.entry_count(), 1);
        assert_eq!(index.repair_report().unwrap().truncated_tail_bytes, 3);
        assert_eq!(index.search(&[1.0, 0.0], 1).unwrap().len(), 1);
    }

    #[test]
    fn bad_magic_is_structural() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
            insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
            index.flush().unwrap();
        }
        fs::write(dir.path().join(VECTORS_FILE), b"oops").unwrap();
        let err = VectorIndex::open(dir.path(), "hash").unwrap_err();
        assert!(matches!(err, IndexError::BadMagic { .. }));
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn model_change_is_surfaced() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = VectorIndex::open(dir.path(), "nomic-embed-text").unwrap();
            insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
            index.flush().unwrap();
        }
        let err = VectorIndex::open(dir.path(), "all-minilm").unwrap_err();
        assert!(matches!(err, IndexError::ModelChanged { .. }));
    }

    #[test]
    fn rebuild_resets_the_pair() {
        let dir = TempDir::new().unwrap();
        let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
        insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
        index.flush().unwrap();

        index.rebuild().unwrap();
        assert_eq!(index.entry_count(), 0);
        assert_eq!(index.dims(), 0);

        let reopened = VectorIndex::open(dir.path(), "hash").unwrap();
        assert_eq!(reopened.entry_count(), 0);
    }

    #[test]
    fn mismatched_insert_dimension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
        insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
        let err = index
            .insert(doc("b", 1), vec![(entry("b", 0), vec![1.0, 2.0, 3.0])])
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
    }

    #[test]
    fn mismatched_query_dimension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
        insert_doc(&mut index, "a", &[vec![1.0, 0.0]]);
        index.flush().unwrap();
        let err = index.search(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
    }

    proptest! {
        /// Entries and vector rows stay 1:1 through arbitrary interleavings
        /// of insert, delete and flush, and the flushed pair reopens clean.
        #[test]
        fn prop_pair_stays_lockstep_after_any_sequence(
            ops in prop::collection::vec((0u8..3, 0usize..3, 1usize..4), 1..14),
        ) {
            let dir = TempDir::new().unwrap();
            let mut index = VectorIndex::open(dir.path(), "hash").unwrap();
            let ids = ["a", "b", "c"];
            let mut staged = [false; 3];
            for (op, pick, rows) in ops {
                match op {
                    0 => {
                        // Re-ingestion shape: drop the committed rows, then
                        // stage replacements. A still-staged document is
                        // flushed first, as the engine would have done.
                        if staged[pick] {
                            index.flush().unwrap();
                            staged = [false; 3];
                        }
                        index.delete_by_document(ids[pick]).unwrap();
                        let vectors: Vec<Vec<f32>> =
                            (0..rows).map(|r| vec![r as f32, pick as f32]).collect();
                        insert_doc(&mut index, ids[pick], &vectors);
                        staged[pick] = true;
                    }
                    1 => {
                        index.delete_by_document(ids[pick]).unwrap();
                    }
                    _ => {
                        index.flush().unwrap();
                        staged = [false; 3];
                    }
                }
            }
            index.flush().unwrap();

            let probe = vec![0.0; index.dims()];
            let hits = index.search(&probe, index.entry_count() + 1).unwrap();
            prop_assert_eq!(hits.len(), index.entry_count());

            let (vector_bytes, _) = index.artifact_sizes();
            prop_assert_eq!(
                vector_bytes,
                VECTOR_HEADER_LEN + (index.entry_count() * index.dims() * 4) as u64
            );

            let reopened = VectorIndex::open(dir.path(), "hash").unwrap();
            prop_assert!(reopened.repair_report().is_none());
            prop_assert_eq!(reopened.entry_count(), index.entry_count());
            prop_assert_eq!(reopened.document_count(), index.document_count());
        }
    }
}
