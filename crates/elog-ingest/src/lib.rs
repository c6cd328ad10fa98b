use elog_core::{
    content::parse_main_content, experiment_id_from_path, size::parse_size, ArtifactKind,
    DataProductionRecord, DetectorRecord, ExperimentRecord, ExperimentTab, FileManagerRecord,
    LogbookRecord, RunRecord,
};
use elog_storage::{ExperimentStore, ReconcileMode, Reconciler, StorageError};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("unrecognized artifact suffix: {0}")]
    UnknownArtifact(PathBuf),
    #[error("cannot derive an experiment id from {0}")]
    MissingExperimentId(PathBuf),
    #[error("bad record in {file}: {message}")]
    BadRecord { file: PathBuf, message: String },
}

/// Row counts for one processed artifact (or, absorbed, for a whole
/// batch).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub experiments: usize,
    pub tabs: usize,
    pub runs: usize,
    pub logbook_entries: usize,
    pub dropped_logbook_entries: usize,
    pub detectors: usize,
    pub data_productions: usize,
    pub file_manager_rows: usize,
    pub skipped_records: usize,
    pub total_size_bytes: u64,
}

impl IngestReport {
    pub fn absorb(&mut self, other: &IngestReport) {
        self.experiments += other.experiments;
        self.tabs += other.tabs;
        self.runs += other.runs;
        self.logbook_entries += other.logbook_entries;
        self.dropped_logbook_entries += other.dropped_logbook_entries;
        self.detectors += other.detectors;
        self.data_productions += other.data_productions;
        self.file_manager_rows += other.file_manager_rows;
        self.skipped_records += other.skipped_records;
        self.total_size_bytes += other.total_size_bytes;
    }
}

/// Classifies, parses, and reconciles one artifact inside a single
/// transaction. Unknown suffixes are an error the caller may skip;
/// unreadable or malformed files are logged and yield an empty report
/// without opening a transaction.
pub fn process_artifact(
    store: &mut ExperimentStore,
    path: impl AsRef<Path>,
) -> Result<IngestReport, IngestError> {
    let path = path.as_ref();
    let kind = ArtifactKind::classify(path)
        .ok_or_else(|| IngestError::UnknownArtifact(path.to_path_buf()))?;
    let experiment_id = experiment_id_from_path(path)
        .ok_or_else(|| IngestError::MissingExperimentId(path.to_path_buf()))?;

    let mut report = IngestReport::default();
    match kind {
        ArtifactKind::Info => {
            let Some(value) = read_json(path) else {
                return Ok(report);
            };
            store.reconcile(|engine| {
                process_info(engine, path, &experiment_id, &value, &mut report)
            })?;
        }
        ArtifactKind::Runtable => {
            let Some(value) = read_json(path) else {
                return Ok(report);
            };
            store.reconcile(|engine| {
                process_runtable(engine, path, &experiment_id, &value, &mut report)
            })?;
        }
        ArtifactKind::FileManager => {
            let Some(rows) = read_csv(path, &mut report) else {
                return Ok(report);
            };
            store.reconcile(|engine| {
                process_file_manager(engine, path, &experiment_id, &rows, &mut report)
            })?;
        }
        ArtifactKind::Logbook => {
            let Some(rows) = read_csv(path, &mut report) else {
                return Ok(report);
            };
            store.reconcile(|engine| {
                process_logbook(engine, path, &experiment_id, &rows, &mut report)
            })?;
        }
    }

    info!(
        file = %path.display(),
        kind = kind.as_str(),
        experiment_id = %experiment_id,
        "processed artifact"
    );
    Ok(report)
}

fn process_info(
    engine: &Reconciler<'_>,
    path: &Path,
    experiment_id: &str,
    value: &Value,
    report: &mut IngestReport,
) -> Result<(), IngestError> {
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        warn!(file = %path.display(), "crawler reported an error: {message}");
    }

    let main_content = value
        .get("main_content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let fields = parse_main_content(main_content);
    let field = |label: &str| fields.get(label).cloned();

    let record = ExperimentRecord {
        experiment_id: experiment_id.to_string(),
        name: field("Name"),
        instrument: field("Instrument"),
        start_time: field("Start Time"),
        end_time: field("End Time"),
        pi: field("PI"),
        pi_email: field("PI Email"),
        leader_account: field("Leader Account"),
        description: field("Description"),
        slack_channels: field("Slack channels"),
        analysis_queues: field("Analysis Queues"),
        urawi_proposal: field("URAWI Proposal"),
    };
    if guard(engine, report, path, "experiment row", engine.upsert_experiment(&record))? {
        report.experiments += 1;
    }

    let tabs: Vec<ExperimentTab> = value
        .get("tabs")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(name, content)| ExperimentTab {
                    name: name.clone(),
                    content: content.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    if guard(
        engine,
        report,
        path,
        "experiment tab set",
        engine.replace_experiment_tabs(experiment_id, &tabs),
    )? {
        report.tabs += tabs.len();
    }

    Ok(())
}

fn process_file_manager(
    engine: &Reconciler<'_>,
    path: &Path,
    experiment_id: &str,
    rows: &[CsvRow],
    report: &mut IngestReport,
) -> Result<(), IngestError> {
    for row in rows {
        let Some(run_number) = int_field(row, "Run Number") else {
            row_failure(
                engine.mode(),
                report,
                path,
                format!("unparseable run number {:?}", row.get("Run Number")),
            )?;
            continue;
        };
        let Some(number_of_files) = int_field(row, "Number of Files") else {
            row_failure(
                engine.mode(),
                report,
                path,
                format!("unparseable file count {:?}", row.get("Number of Files")),
            )?;
            continue;
        };
        let Some(total_size_bytes) = row
            .get("Total Size (bytes)")
            .and_then(|text| parse_size(text))
        else {
            row_failure(
                engine.mode(),
                report,
                path,
                format!("unparseable size {:?}", row.get("Total Size (bytes)")),
            )?;
            continue;
        };

        // file_manager knows nothing beyond the run's identity, so the
        // Run row it writes carries no timing or event data.
        if guard(
            engine,
            report,
            path,
            "run row",
            engine.upsert_run(&RunRecord::bare(run_number, experiment_id)),
        )? {
            report.runs += 1;
        }

        let record = FileManagerRecord {
            experiment_id: experiment_id.to_string(),
            run_number,
            number_of_files,
            total_size_bytes: total_size_bytes as i64,
        };
        if guard(engine, report, path, "file manager row", engine.upsert_file_manager(&record))? {
            report.file_manager_rows += 1;
            report.total_size_bytes += total_size_bytes;
        }
    }
    Ok(())
}

fn process_logbook(
    engine: &Reconciler<'_>,
    path: &Path,
    experiment_id: &str,
    rows: &[CsvRow],
    report: &mut IngestReport,
) -> Result<(), IngestError> {
    // Run numbers carry forward in document order: a record with a
    // blank Run column inherits the most recently seen explicit run.
    let mut last_run_number: Option<i64> = None;

    for row in rows {
        let raw_run = row.get("Run").map(|text| text.trim()).unwrap_or_default();
        if !raw_run.is_empty() {
            match raw_run.parse::<i64>() {
                Ok(number) => last_run_number = Some(number),
                Err(_) => {
                    row_failure(
                        engine.mode(),
                        report,
                        path,
                        format!("unparseable run number {raw_run:?}"),
                    )?;
                    continue;
                }
            }
        }

        let Some(run_number) = last_run_number else {
            // No run seen yet; the record cannot be attributed.
            report.dropped_logbook_entries += 1;
            continue;
        };

        let text = |key: &str| row.get(key).cloned().unwrap_or_default();
        let record = LogbookRecord {
            experiment_id: experiment_id.to_string(),
            run_number,
            timestamp: text("Posted"),
            content: text("Content"),
            tags: text("Tags"),
            author: text("Author"),
        };
        if guard(engine, report, path, "logbook row", engine.upsert_logbook(&record))? {
            report.logbook_entries += 1;
        }
    }
    Ok(())
}

fn process_runtable(
    engine: &Reconciler<'_>,
    path: &Path,
    experiment_id: &str,
    value: &Value,
    report: &mut IngestReport,
) -> Result<(), IngestError> {
    for entry in value
        .get("Data Production")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(run_number) = int_value(entry.get("Run")) else {
            row_failure(
                engine.mode(),
                report,
                path,
                format!("data production entry without a run number: {entry}"),
            )?;
            continue;
        };

        let run = RunRecord {
            n_events: int_value(entry.get("N events")),
            n_damaged: int_value(entry.get("N damaged")),
            ..RunRecord::bare(run_number, experiment_id)
        };
        if guard(engine, report, path, "run row", engine.upsert_run(&run))? {
            report.runs += 1;
        }

        let production = DataProductionRecord {
            experiment_id: experiment_id.to_string(),
            run_number,
            n_events: int_value(entry.get("N events")),
            n_damaged: int_value(entry.get("N damaged")),
            n_dropped: int_value(entry.get("N dropped")),
            prod_start: str_value(entry.get("Prod Start")),
            prod_end: str_value(entry.get("Prod End")),
        };
        if guard(
            engine,
            report,
            path,
            "data production row",
            engine.upsert_data_production(&production),
        )? {
            report.data_productions += 1;
        }
    }

    for entry in value
        .get("Detectors")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(object) = entry.as_object() else {
            row_failure(
                engine.mode(),
                report,
                path,
                format!("detector entry is not an object: {entry}"),
            )?;
            continue;
        };
        let Some(run_number) = int_value(object.get("Run")) else {
            row_failure(
                engine.mode(),
                report,
                path,
                format!("detector entry without a run number: {entry}"),
            )?;
            continue;
        };

        // Only checked detectors are recorded; anything else is absent
        // from the store.
        for (name, status) in object {
            if name == "Run" || status.as_str() != Some("Checked") {
                continue;
            }
            let record = DetectorRecord {
                experiment_id: experiment_id.to_string(),
                run_number,
                detector_name: name.clone(),
                status: "Checked".to_string(),
            };
            if guard(engine, report, path, "detector row", engine.upsert_detector(&record))? {
                report.detectors += 1;
            }
        }
    }

    Ok(())
}

/// Mode-dependent row-operation contract: insert mode logs and keeps
/// going, update mode propagates so the artifact's transaction rolls
/// back. Returns whether the operation was applied.
fn guard(
    engine: &Reconciler<'_>,
    report: &mut IngestReport,
    file: &Path,
    what: &str,
    result: Result<(), StorageError>,
) -> Result<bool, IngestError> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if engine.mode() == ReconcileMode::Insert => {
            warn!(file = %file.display(), "skipping {what}: {err}");
            report.skipped_records += 1;
            Ok(false)
        }
        Err(err) => Err(IngestError::Storage(err)),
    }
}

fn row_failure(
    mode: ReconcileMode,
    report: &mut IngestReport,
    file: &Path,
    message: String,
) -> Result<(), IngestError> {
    if mode == ReconcileMode::Insert {
        warn!(file = %file.display(), "skipping record: {message}");
        report.skipped_records += 1;
        Ok(())
    } else {
        Err(IngestError::BadRecord {
            file: file.to_path_buf(),
            message,
        })
    }
}

type CsvRow = HashMap<String, String>;

fn read_json(path: &Path) -> Option<Value> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            error!(file = %path.display(), "cannot read artifact: {err}");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            error!(file = %path.display(), "artifact is not a JSON object");
            None
        }
        Err(err) => {
            error!(file = %path.display(), "cannot parse artifact: {err}");
            None
        }
    }
}

fn read_csv(path: &Path, report: &mut IngestReport) -> Option<Vec<CsvRow>> {
    // The csv crate imposes no field-size cap, so multi-kilobyte
    // logbook posts decode in full.
    let mut reader = match csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_path(path)
    {
        Ok(reader) => reader,
        Err(err) => {
            error!(file = %path.display(), "cannot read artifact: {err}");
            return None;
        }
    };

    let mut rows = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        match result {
            Ok(row) => rows.push(row),
            Err(err) => {
                warn!(file = %path.display(), "skipping malformed csv record: {err}");
                report.skipped_records += 1;
            }
        }
    }
    Some(rows)
}

fn int_field(row: &CsvRow, key: &str) -> Option<i64> {
    row.get(key)?.trim().replace(',', "").parse().ok()
}

fn int_value(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    if let Some(number) = value.as_i64() {
        return Some(number);
    }
    value
        .as_str()
        .and_then(|text| text.trim().replace(',', "").parse().ok())
}

fn str_value(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().expect("temp dir"),
            }
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, contents).expect("write fixture");
            path
        }

        fn db_path(&self) -> PathBuf {
            self.dir.path().join("store.db")
        }
    }

    fn info_artifact(name: &str) -> String {
        json!({
            "main_content": "Name:\nl1027522\nInstrument:\nMFX\nPI:\nA. Scientist\nDescription:\nSerial crystallography\nat room temperature\n",
            "tabs": {
                "Samples": {"count": 4},
                "Shifts": "night"
            }
        })
        .to_string()
        .replace("l1027522", name)
    }

    #[test]
    fn info_ingest_is_idempotent_and_replaces_tabs() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");

        let first = fixture.write("mfxl1027522.info.json", &info_artifact("l1027522"));
        let report = process_artifact(&mut store, &first).expect("first ingest");
        assert_eq!(report.experiments, 1);
        assert_eq!(report.tabs, 2);

        // Second ingest drops one tab; the stored set must match the
        // artifact exactly, with no accumulation.
        let updated = json!({
            "main_content": "Name:\nl1027522-v2\nInstrument:\nMFX\n",
            "tabs": {"Samples": {"count": 5}}
        })
        .to_string();
        let second = fixture.write("mfxl1027522.info.json", &updated);
        process_artifact(&mut store, &second).expect("second ingest");

        let experiment = store
            .experiment("mfxl1027522")
            .expect("query")
            .expect("row present");
        assert_eq!(experiment.name.as_deref(), Some("l1027522-v2"));
        assert_eq!(experiment.instrument.as_deref(), Some("MFX"));
        // The second artifact had no PI label; insert mode replaces the
        // row in full.
        assert_eq!(experiment.pi, None);

        let tabs = store.experiment_tabs("mfxl1027522").expect("tabs");
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].name, "Samples");
        assert_eq!(tabs[0].content, json!({"count": 5}));
    }

    #[test]
    fn info_normalizes_multiline_descriptions() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");
        let path = fixture.write("mfxl1027522.info.json", &info_artifact("l1027522"));
        process_artifact(&mut store, &path).expect("ingest");

        let experiment = store
            .experiment("mfxl1027522")
            .expect("query")
            .expect("row present");
        assert_eq!(
            experiment.description.as_deref(),
            Some("Serial crystallography at room temperature")
        );
    }

    #[test]
    fn logbook_run_numbers_carry_forward_and_leading_blanks_drop() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");

        let csv = "\
Posted,Run,Content,Tags,Author
09:00,,before any run,setup,ana
09:05,5,run five starts,,ana
09:06,,still five,,bob
09:07,,five again,,ana
09:10,6,run six,,bob
09:11,,still six,,ana
";
        let path = fixture.write("mfxl1027522.logbook.csv", csv);
        let report = process_artifact(&mut store, &path).expect("ingest");

        assert_eq!(report.logbook_entries, 5);
        assert_eq!(report.dropped_logbook_entries, 1);

        let entries = store.logbook_entries("mfxl1027522").expect("entries");
        let runs: Vec<i64> = entries.iter().map(|entry| entry.run_number).collect();
        assert_eq!(runs, vec![5, 5, 5, 6, 6]);
        assert_eq!(entries[1].content, "still five");
        assert_eq!(entries[1].author, "bob");
    }

    #[test]
    fn runtable_records_checked_detectors_only() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");

        let runtable = json!({
            "Detectors": [
                {"Run": 12, "CSPAD": "Checked", "Jungfrau": "Unchecked"}
            ]
        })
        .to_string();
        let path = fixture.write("mfxl1027522.runtable.json", &runtable);
        let report = process_artifact(&mut store, &path).expect("ingest");

        assert_eq!(report.detectors, 1);
        let detectors = store.detectors_for_run("mfxl1027522", 12).expect("query");
        assert_eq!(detectors.len(), 1);
        assert_eq!(detectors[0].detector_name, "CSPAD");
        assert_eq!(detectors[0].status, "Checked");
    }

    #[test]
    fn runtable_upserts_runs_and_data_production() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");

        let runtable = json!({
            "Data Production": [
                {
                    "Run": 7,
                    "N events": "12,345",
                    "N damaged": 10,
                    "N dropped": 0,
                    "Prod Start": "Oct 10, 2024 9:00 AM",
                    "Prod End": "Oct 10, 2024 9:40 AM"
                }
            ]
        })
        .to_string();
        let path = fixture.write("mfxl1027522.runtable.json", &runtable);
        let report = process_artifact(&mut store, &path).expect("ingest");
        assert_eq!(report.runs, 1);
        assert_eq!(report.data_productions, 1);

        let run = store
            .run(7, "mfxl1027522")
            .expect("query")
            .expect("row present");
        assert_eq!(run.n_events, Some(12_345));
        assert_eq!(run.start_time, None);

        let production = store
            .data_production("mfxl1027522", 7)
            .expect("query")
            .expect("row present");
        assert_eq!(production.n_dropped, Some(0));
        assert_eq!(production.prod_start.as_deref(), Some("Oct 10, 2024 9:00 AM"));

        // Re-ingesting must not duplicate dependent rows.
        process_artifact(&mut store, &path).expect("second ingest");
        let report = process_artifact(&mut store, &path).expect("third ingest");
        assert_eq!(report.data_productions, 1);
    }

    #[test]
    fn file_manager_parses_human_readable_sizes() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");

        let csv = "\
Run Number,Number of Files,Total Size (bytes)
7,40,1.5 GB
8,12,123456789
";
        let path = fixture.write("mfxl1027522.file_manager.csv", csv);
        let report = process_artifact(&mut store, &path).expect("ingest");

        assert_eq!(report.runs, 2);
        assert_eq!(report.file_manager_rows, 2);
        assert_eq!(report.total_size_bytes, 1_500_000_000 + 123_456_789);

        let row = store
            .file_manager("mfxl1027522", 7)
            .expect("query")
            .expect("row present");
        assert_eq!(row.total_size_bytes, 1_500_000_000);
        assert!(store.run(7, "mfxl1027522").expect("query").is_some());
    }

    #[test]
    fn insert_mode_skips_bad_records_and_continues() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");

        let csv = "\
Run Number,Number of Files,Total Size (bytes)
7,40,1 GB
not-a-run,1,1 GB
8,12,2 GB
";
        let path = fixture.write("mfxl1027522.file_manager.csv", csv);
        let report = process_artifact(&mut store, &path).expect("ingest");

        assert_eq!(report.file_manager_rows, 2);
        assert_eq!(report.skipped_records, 1);
        assert!(store.file_manager("mfxl1027522", 8).expect("query").is_some());
    }

    #[test]
    fn update_mode_preserves_run_fields_the_artifact_cannot_supply() {
        let fixture = Fixture::new();
        {
            let mut store = ExperimentStore::open(fixture.db_path()).expect("open insert");
            let runtable = json!({
                "Data Production": [
                    {"Run": 7, "N events": 100, "N damaged": 2, "N dropped": 0}
                ]
            })
            .to_string();
            let path = fixture.write("mfxl1027522.runtable.json", &runtable);
            process_artifact(&mut store, &path).expect("seed runtable");
        }

        let mut store = ExperimentStore::open_existing(fixture.db_path()).expect("open update");
        let csv = "\
Run Number,Number of Files,Total Size (bytes)
7,40,1.5 GB
";
        let path = fixture.write("mfxl1027522.file_manager.csv", csv);
        process_artifact(&mut store, &path).expect("update ingest");

        let run = store
            .run(7, "mfxl1027522")
            .expect("query")
            .expect("row present");
        assert_eq!(run.n_events, Some(100), "file_manager must not clear event counts");

        let row = store
            .file_manager("mfxl1027522", 7)
            .expect("query")
            .expect("row present");
        assert_eq!(row.number_of_files, 40);
    }

    #[test]
    fn update_mode_rolls_back_the_whole_artifact_on_a_bad_record() {
        let fixture = Fixture::new();
        drop(ExperimentStore::open(fixture.db_path()).expect("bootstrap"));

        let mut store = ExperimentStore::open_existing(fixture.db_path()).expect("open update");
        let csv = "\
Run Number,Number of Files,Total Size (bytes)
7,40,1.5 GB
not-a-run,1,1 GB
";
        let path = fixture.write("mfxl1027522.file_manager.csv", csv);
        let result = process_artifact(&mut store, &path);
        assert!(matches!(result, Err(IngestError::BadRecord { .. })));

        // The first record's rows were rolled back with the rest.
        assert!(store.run(7, "mfxl1027522").expect("query").is_none());
        assert!(store.file_manager("mfxl1027522", 7).expect("query").is_none());
    }

    #[test]
    fn unknown_suffixes_are_rejected_without_touching_the_store() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");
        let path = fixture.write("mfxl1027522.notes.txt", "not an artifact");

        let result = process_artifact(&mut store, &path);
        assert!(matches!(result, Err(IngestError::UnknownArtifact(_))));
    }

    #[test]
    fn malformed_json_is_no_data_not_an_error() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");
        let path = fixture.write("mfxl1027522.info.json", "{ not json");

        let report = process_artifact(&mut store, &path).expect("skipped");
        assert_eq!(report, IngestReport::default());
        assert!(store.experiment("mfxl1027522").expect("query").is_none());
    }

    #[test]
    fn missing_file_is_no_data_not_an_error() {
        let fixture = Fixture::new();
        let mut store = ExperimentStore::open(fixture.db_path()).expect("open store");
        let path = fixture.dir.path().join("mfxl1027522.runtable.json");

        let report = process_artifact(&mut store, &path).expect("skipped");
        assert_eq!(report, IngestReport::default());
    }
}
