use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub mod content;
pub mod size;

/// The four artifact kinds produced by the crawling jobs, keyed by
/// file-name suffix. Unknown suffixes classify to `None` and are
/// skipped by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Info,
    FileManager,
    Logbook,
    Runtable,
}

impl ArtifactKind {
    const SUFFIXES: [(&'static str, ArtifactKind); 4] = [
        (".info.json", ArtifactKind::Info),
        (".file_manager.csv", ArtifactKind::FileManager),
        (".logbook.csv", ArtifactKind::Logbook),
        (".runtable.json", ArtifactKind::Runtable),
    ];

    /// Classifies a path by its longest matching known suffix.
    pub fn classify(path: &Path) -> Option<ArtifactKind> {
        let name = path.file_name()?.to_str()?;
        Self::SUFFIXES
            .iter()
            .filter(|(suffix, _)| name.ends_with(suffix))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, kind)| *kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Info => "info",
            ArtifactKind::FileManager => "file_manager",
            ArtifactKind::Logbook => "logbook",
            ArtifactKind::Runtable => "runtable",
        }
    }
}

/// Every artifact names its experiment in the file-name prefix up to
/// the first `.`.
pub fn experiment_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let prefix = name.split('.').next()?;
    if prefix.is_empty() {
        return None;
    }
    Some(prefix.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub experiment_id: String,
    pub name: Option<String>,
    pub instrument: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub pi: Option<String>,
    pub pi_email: Option<String>,
    pub leader_account: Option<String>,
    pub description: Option<String>,
    pub slack_channels: Option<String>,
    pub analysis_queues: Option<String>,
    pub urawi_proposal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTab {
    pub name: String,
    pub content: Value,
}

/// One data-taking run. `file_manager` creates the row without timing
/// or event data, `runtable` may add event counts; no current source
/// supplies timing, which is a known gap rather than a defect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_number: i64,
    pub experiment_id: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub n_events: Option<i64>,
    pub n_damaged: Option<i64>,
}

impl RunRecord {
    /// A run known only by identity, as file_manager reports it.
    pub fn bare(run_number: i64, experiment_id: impl Into<String>) -> Self {
        Self {
            run_number,
            experiment_id: experiment_id.into(),
            start_time: None,
            end_time: None,
            n_events: None,
            n_damaged: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorRecord {
    pub experiment_id: String,
    pub run_number: i64,
    pub detector_name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogbookRecord {
    pub experiment_id: String,
    pub run_number: i64,
    pub timestamp: String,
    pub content: String,
    pub tags: String,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataProductionRecord {
    pub experiment_id: String,
    pub run_number: i64,
    pub n_events: Option<i64>,
    pub n_damaged: Option<i64>,
    pub n_dropped: Option<i64>,
    pub prod_start: Option<String>,
    pub prod_end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManagerRecord {
    pub experiment_id: String,
    pub run_number: i64,
    pub number_of_files: i64,
    pub total_size_bytes: i64,
}
