//! Builds the static feed database from crawler output.
//!
//! Input is a directory of `YYYY-MM-DD_AI_enhanced_Chinese.jsonl` files, one
//! raw record per line. Records are reduced to their newest arXiv version,
//! grouped into month files, and accompanied by the manifest, the search
//! index and the category index.

use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::DataConfig;
use crate::error::{BuildError, FeedError};
use crate::manifest::Manifest;
use crate::paper::{MonthKey, Paper, split_versioned_id};
use crate::persistence;
use crate::search::SearchIndex;

/// Suffix of the crawler files the builder reads.
pub const INPUT_SUFFIX: &str = "_AI_enhanced_Chinese.jsonl";

/// Terms found in fewer papers than this are left out of the written index.
pub const DEFAULT_MIN_FREQUENCY: usize = 3;

const UNTITLED: &str = "无标题";

/// One crawler record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub pdf_link: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    pub summary: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub comments: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub updated: Option<String>,
    /// First publication date.
    pub date: Option<String>,
    #[serde(rename = "AI")]
    pub ai: Option<RawAi>,
}

/// AI-generated enrichment attached to a crawler record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAi {
    pub title_translation: Option<String>,
    pub translation: Option<String>,
    /// Comma-separated; anything other than a string yields no keywords.
    pub keywords: Option<serde_json::Value>,
    pub tldr: Option<String>,
    pub comments: Option<String>,
    pub motivation: Option<String>,
    pub method: Option<String>,
    pub result: Option<String>,
    pub conclusion: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Per-file ingest counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub superseded: usize,
    pub skipped: usize,
}

/// Accumulates records, keeping the newest version of each paper.
#[derive(Debug, Default)]
pub struct DatabaseBuilder {
    papers: HashMap<String, (u32, Paper)>,
    skipped: usize,
    files: usize,
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paper_count(&self) -> usize {
        self.papers.len()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Ingest every input file in `dir`, in file name order. Files without a
    /// leading date are skipped with a warning.
    pub fn ingest_dir(&mut self, dir: &Path) -> Result<IngestReport, FeedError> {
        let mut inputs: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(INPUT_SUFFIX))
            })
            .collect();
        if inputs.is_empty() {
            return Err(BuildError::NoInputs {
                dir: dir.to_path_buf(),
            }
            .into());
        }
        inputs.sort();
        info!(files = inputs.len(), dir = %dir.display(), "Ingesting crawler output");

        let mut total = IngestReport::default();
        for path in &inputs {
            match self.ingest_file(path) {
                Ok(report) => {
                    total.accepted += report.accepted;
                    total.superseded += report.superseded;
                    total.skipped += report.skipped;
                }
                Err(FeedError::Build(e @ BuildError::UndatedFile { .. })) => {
                    warn!(error = %e, "Skipping input file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Ingest one input file; its date comes from the file name.
    pub fn ingest_file(&mut self, path: &Path) -> Result<IngestReport, FeedError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let file_date = name
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .ok_or(BuildError::UndatedFile { name: name.clone() })?;

        let content = std::fs::read_to_string(path)?;
        let report = self.ingest_str(&file_date.format("%Y-%m-%d").to_string(), &content);
        self.files += 1;
        debug!(file = %name, accepted = report.accepted, skipped = report.skipped, "Ingested file");
        Ok(report)
    }

    /// Ingest NDJSON `content` listed on `file_date`.
    pub fn ingest_str(&mut self, file_date: &str, content: &str) -> IngestReport {
        let mut report = IngestReport::default();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let outcome = serde_json::from_str::<RawRecord>(line)
                .map_err(|_| ())
                .and_then(|raw| self.ingest_record(file_date, raw).ok_or(()));
            match outcome {
                Ok(true) => report.accepted += 1,
                Ok(false) => report.superseded += 1,
                Err(()) => {
                    report.skipped += 1;
                    self.skipped += 1;
                }
            }
        }
        report
    }

    /// Add one record. Returns `Some(false)` when an equal or newer version
    /// is already present, `None` when the record has no usable id.
    pub fn ingest_record(&mut self, file_date: &str, raw: RawRecord) -> Option<bool> {
        let full_id = raw.id.clone()?;
        let (base_id, version) = split_versioned_id(&full_id)?;
        if let Some((existing, _)) = self.papers.get(base_id) {
            if *existing >= version {
                return Some(false);
            }
        }
        let base_id = base_id.to_string();
        let paper = shape_paper(&base_id, &full_id, file_date, raw);
        self.papers.insert(base_id, (version, paper));
        Some(true)
    }

    /// Assemble month files and indexes.
    pub fn build(self, min_frequency: usize) -> Result<Database, BuildError> {
        if self.papers.is_empty() {
            return Err(BuildError::Empty {
                skipped: self.skipped,
            });
        }

        let mut months: BTreeMap<MonthKey, Vec<Paper>> = BTreeMap::new();
        let mut index = SearchIndex::new();
        let mut categories: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (_, (_, paper)) in self.papers {
            let Some(month) = paper.month_key_or_date() else {
                warn!(id = %paper.id, "Paper has no month, dropping");
                continue;
            };
            index.insert(&paper);
            for category in &paper.categories {
                categories
                    .entry(category.clone())
                    .or_default()
                    .insert(paper.id.clone());
            }
            months.entry(month).or_default().push(paper);
        }

        for papers in months.values_mut() {
            papers.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));
        }
        let total: usize = months.values().map(Vec::len).sum();
        let manifest = Manifest::new(
            months.keys().cloned(),
            total,
            Some(chrono::Local::now().date_naive()),
        );

        Ok(Database {
            months,
            manifest,
            search_index: index.to_filtered(min_frequency),
            category_index: categories
                .into_iter()
                .map(|(category, ids)| (category, ids.into_iter().collect()))
                .collect(),
            skipped: self.skipped,
        })
    }
}

fn shape_paper(base_id: &str, full_id: &str, file_date: &str, raw: RawRecord) -> Paper {
    let ai = raw.ai.unwrap_or_default();
    let keywords = match ai.keywords {
        Some(serde_json::Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    Paper {
        id: base_id.to_string(),
        full_id: Some(full_id.to_string()),
        title: raw.title.unwrap_or_else(|| UNTITLED.to_string()),
        date: Some(file_date.to_string()),
        url: Some(
            raw.url
                .unwrap_or_else(|| format!("http://arxiv.org/abs/{full_id}")),
        ),
        pdf_url: Some(
            raw.pdf_link
                .unwrap_or_else(|| format!("http://arxiv.org/pdf/{full_id}")),
        ),
        authors: raw.authors.join(", "),
        abstract_text: raw.summary.or(raw.abstract_text).unwrap_or_default(),
        comment: non_empty(raw.comments),
        categories: raw.categories,
        updated: Some(raw.updated.unwrap_or_else(|| file_date.to_string())),
        first_published: Some(raw.date.unwrap_or_else(|| file_date.to_string())),
        zh_title: non_empty(ai.title_translation),
        translation: non_empty(ai.translation),
        keywords,
        tldr: non_empty(ai.tldr),
        ai_comments: non_empty(ai.comments),
        motivation: non_empty(ai.motivation),
        method: non_empty(ai.method),
        results: non_empty(ai.result),
        conclusion: non_empty(ai.conclusion),
    }
}

/// The complete output of a build.
#[derive(Debug, Clone)]
pub struct Database {
    /// Papers per month, newest first within a month.
    pub months: BTreeMap<MonthKey, Vec<Paper>>,
    pub manifest: Manifest,
    pub search_index: BTreeMap<String, Vec<String>>,
    pub category_index: BTreeMap<String, Vec<String>>,
    pub skipped: usize,
}

/// Paths written by [`Database::write`].
#[derive(Debug, Clone, Default)]
pub struct WrittenFiles {
    pub month_files: Vec<PathBuf>,
    pub manifest: PathBuf,
    pub search_index: PathBuf,
    pub category_index: PathBuf,
}

impl Database {
    /// Write every file under `root`, laid out as `data` describes.
    ///
    /// Month files whose path ends in `.jsonl` are written one record per
    /// line, others as a JSON array. Both indexes sit next to the manifest.
    pub fn write(&self, root: &Path, data: &DataConfig) -> Result<WrittenFiles, FeedError> {
        let mut written = WrittenFiles::default();
        for (month, papers) in &self.months {
            let path = root.join(data.month_path(month));
            if path.extension().is_some_and(|e| e == "jsonl") {
                persistence::write_ndjson(&path, papers)?;
            } else {
                persistence::write_json(&path, papers, true)?;
            }
            written.month_files.push(path);
        }

        written.manifest = root.join(&data.manifest_path);
        persistence::write_json(&written.manifest, &self.manifest, true)?;

        let index_dir = written
            .manifest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        written.search_index = index_dir.join("search_index.json");
        persistence::write_json(&written.search_index, &self.search_index, false)?;
        written.category_index = index_dir.join("category_index.json");
        persistence::write_json(&written.category_index, &self.category_index, false)?;

        info!(
            months = self.months.len(),
            papers = self.manifest.total_paper_count,
            terms = self.search_index.len(),
            categories = self.category_index.len(),
            "Wrote feed database"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndjson;
    use tempfile::TempDir;

    fn record(id: &str, title: &str) -> String {
        serde_json::json!({
            "id": id,
            "title": title,
            "authors": ["Ada Lovelace", "Alan Turing"],
            "summary": "Transformers for sparse graphs.",
            "categories": ["cs.LG"],
            "AI": {
                "title_translation": "图上的变换器",
                "keywords": "graphs, transformers, ",
                "tldr": "更快。",
                "result": "It works."
            }
        })
        .to_string()
    }

    #[test]
    fn test_record_shaping() {
        let mut builder = DatabaseBuilder::new();
        let report = builder.ingest_str("2025-07-26", &record("2507.00001v1", "Graph Transformers"));
        assert_eq!(report.accepted, 1);

        let db = builder.build(1).unwrap();
        let paper = &db.months[&MonthKey::parse("2025-07").unwrap()][0];
        assert_eq!(paper.id, "2507.00001");
        assert_eq!(paper.full_id.as_deref(), Some("2507.00001v1"));
        assert_eq!(paper.authors, "Ada Lovelace, Alan Turing");
        assert_eq!(paper.abstract_text, "Transformers for sparse graphs.");
        assert_eq!(paper.keywords, vec!["graphs", "transformers"]);
        assert_eq!(paper.results.as_deref(), Some("It works."));
        assert_eq!(paper.url.as_deref(), Some("http://arxiv.org/abs/2507.00001v1"));
        assert_eq!(paper.first_published.as_deref(), Some("2025-07-26"));
        assert_eq!(paper.comment, None);
    }

    #[test]
    fn test_highest_version_wins() {
        let mut builder = DatabaseBuilder::new();
        builder.ingest_str("2025-07-01", &record("2507.00001v2", "Second"));
        let report = builder.ingest_str(
            "2025-07-02",
            &format!("{}\n{}", record("2507.00001v1", "First"), record("2507.00001v3", "Third")),
        );
        assert_eq!(report.accepted, 1);
        assert_eq!(report.superseded, 1);
        assert_eq!(builder.paper_count(), 1);

        let db = builder.build(1).unwrap();
        let paper = &db.months.values().next().unwrap()[0];
        assert_eq!(paper.title, "Third");
        assert_eq!(paper.date.as_deref(), Some("2025-07-02"));
    }

    #[test]
    fn test_malformed_lines_and_ids_are_skipped() {
        let mut builder = DatabaseBuilder::new();
        let content = format!(
            "{}\nnot json\n{{\"title\":\"no id\"}}\n{{\"id\":\"cs/0701001\"}}\n\n",
            record("2507.00001", "Ok")
        );
        let report = builder.ingest_str("2025-07-01", &content);
        assert_eq!(report, IngestReport { accepted: 1, superseded: 0, skipped: 3 });
        assert_eq!(builder.skipped(), 3);
    }

    #[test]
    fn test_empty_build_fails() {
        let mut builder = DatabaseBuilder::new();
        builder.ingest_str("2025-07-01", "garbage\n");
        assert!(matches!(builder.build(3), Err(BuildError::Empty { skipped: 1 })));
    }

    #[test]
    fn test_ingest_dir_and_write() {
        let input = TempDir::new().unwrap();
        std::fs::write(
            input.path().join("2025-06-30_AI_enhanced_Chinese.jsonl"),
            format!("{}\n{}\n", record("2506.00001", "June A"), record("2506.00002", "June B")),
        )
        .unwrap();
        std::fs::write(
            input.path().join("2025-07-01_AI_enhanced_Chinese.jsonl"),
            record("2507.00001", "July"),
        )
        .unwrap();
        std::fs::write(input.path().join("notes_AI_enhanced_Chinese.jsonl"), "x").unwrap();
        std::fs::write(input.path().join("README.md"), "ignored").unwrap();

        let mut builder = DatabaseBuilder::new();
        let report = builder.ingest_dir(input.path()).unwrap();
        assert_eq!(report.accepted, 3);

        let db = builder.build(2).unwrap();
        assert_eq!(db.manifest.total_paper_count, 3);
        assert_eq!(db.manifest.latest().unwrap().as_str(), "2025-07");
        assert_eq!(db.category_index["cs.LG"].len(), 3);
        assert!(db.search_index.contains_key("transformers"));

        let out = TempDir::new().unwrap();
        let written = db.write(out.path(), &DataConfig::default()).unwrap();
        assert_eq!(written.month_files.len(), 2);

        let june = std::fs::read(out.path().join("data/2025-06.jsonl")).unwrap();
        let decoded = ndjson::decode_all::<Paper>(&june).unwrap();
        assert_eq!(decoded.records.len(), 2);

        let manifest: Manifest = persistence::read_json(&written.manifest).unwrap().unwrap();
        assert_eq!(manifest.available_months.len(), 2);
        assert!(out.path().join("data/search_index.json").exists());
        assert!(out.path().join("data/category_index.json").exists());
    }

    #[test]
    fn test_ingest_dir_without_inputs() {
        let dir = TempDir::new().unwrap();
        let err = DatabaseBuilder::new().ingest_dir(dir.path()).unwrap_err();
        assert!(matches!(err, FeedError::Build(BuildError::NoInputs { .. })));
    }
}
