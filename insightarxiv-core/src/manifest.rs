//! The month catalog (`index.json`) that drives which data files to fetch.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::DataConfig;
use crate::error::LoadError;
use crate::paper::MonthKey;
use crate::source::{DataSource, FetchRequest};

/// List of available month buckets, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub available_months: Vec<MonthKey>,
    #[serde(default)]
    pub total_paper_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<NaiveDate>,
}

impl Manifest {
    /// Build a manifest, ordering months newest first and dropping duplicates.
    pub fn new(
        months: impl IntoIterator<Item = MonthKey>,
        total_paper_count: usize,
        last_updated: Option<NaiveDate>,
    ) -> Self {
        let mut available_months: Vec<MonthKey> = months.into_iter().collect();
        available_months.sort_unstable_by(|a, b| b.cmp(a));
        available_months.dedup();
        Self {
            available_months,
            total_paper_count,
            last_updated,
        }
    }

    /// The `count` newest months.
    pub fn recent(&self, count: usize) -> &[MonthKey] {
        &self.available_months[..count.min(self.available_months.len())]
    }

    pub fn latest(&self) -> Option<&MonthKey> {
        self.available_months.first()
    }

    pub fn contains(&self, month: &MonthKey) -> bool {
        self.available_months.contains(month)
    }

    /// Position of `month` in newest-first order.
    pub fn index_of(&self, month: &MonthKey) -> Option<usize> {
        self.available_months.iter().position(|m| m == month)
    }
}

/// Fetch and decode the manifest from `source`.
pub async fn fetch_manifest(
    source: &dyn DataSource,
    data: &DataConfig,
) -> Result<Manifest, LoadError> {
    let url = data.manifest_path.clone();
    let response = source
        .fetch(FetchRequest::get(&url).with_header("Accept", "application/json"))
        .await?;
    if !response.is_success() {
        return Err(LoadError::HttpStatus {
            url,
            status: response.status,
        });
    }
    let body = response.bytes().await?;
    let manifest: Manifest = serde_json::from_slice(&body).map_err(|e| LoadError::Parse {
        url: url.clone(),
        message: e.to_string(),
    })?;
    tracing::debug!(
        months = manifest.available_months.len(),
        papers = manifest.total_paper_count,
        "Fetched manifest"
    );
    Ok(Manifest::new(
        manifest.available_months,
        manifest.total_paper_count,
        manifest.last_updated,
    ))
}
