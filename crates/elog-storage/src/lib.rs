use elog_core::{
    DataProductionRecord, DetectorRecord, ExperimentRecord, ExperimentTab, FileManagerRecord,
    LogbookRecord, RunRecord,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store not initialized: {path}")]
    StoreNotInitialized { path: String },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Reconciliation policy. Insert mode replaces whole rows by identity;
/// update mode field-updates existing rows and only inserts when the
/// identity is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Insert,
    Update,
}

/// Owned handle on the SQLite store. Single writer; transactions via
/// [`ExperimentStore::reconcile`] are the only atomicity unit.
pub struct ExperimentStore {
    conn: Connection,
    mode: ReconcileMode,
}

impl ExperimentStore {
    /// Opens (creating and bootstrapping if needed) a store in insert
    /// mode, for fresh or first loads.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            mode: ReconcileMode::Insert,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            mode: ReconcileMode::Insert,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Opens an already-populated store in update mode. Fails with
    /// [`StorageError::StoreNotInitialized`] if the file is missing or
    /// was never bootstrapped.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StorageError::StoreNotInitialized {
                path: path.display().to_string(),
            });
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            mode: ReconcileMode::Update,
        };
        if store.schema_version()? < 1 {
            return Err(StorageError::StoreNotInitialized {
                path: path.display().to_string(),
            });
        }
        store.migrate()?;
        Ok(store)
    }

    pub fn mode(&self) -> ReconcileMode {
        self.mode
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_experiment_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// The transaction boundary: runs `f` against a [`Reconciler`]
    /// inside one transaction, committing only if `f` returns `Ok`.
    /// Any error rolls back every row operation performed by `f`.
    pub fn reconcile<T, E>(
        &mut self,
        f: impl FnOnce(&Reconciler<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let tx = self
            .conn
            .transaction()
            .map_err(StorageError::from)
            .map_err(E::from)?;
        let value = {
            let engine = Reconciler {
                conn: &tx,
                mode: self.mode,
            };
            f(&engine)?
        };
        tx.commit().map_err(StorageError::from).map_err(E::from)?;
        Ok(value)
    }

    pub fn experiment(&self, experiment_id: &str) -> Result<Option<ExperimentRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "
                SELECT experiment_id, name, instrument, start_time, end_time, pi, pi_email,
                       leader_account, description, slack_channels, analysis_queues, urawi_proposal
                FROM Experiment
                WHERE experiment_id = ?1
                ",
                [experiment_id],
                |row| {
                    Ok(ExperimentRecord {
                        experiment_id: row.get(0)?,
                        name: row.get(1)?,
                        instrument: row.get(2)?,
                        start_time: row.get(3)?,
                        end_time: row.get(4)?,
                        pi: row.get(5)?,
                        pi_email: row.get(6)?,
                        leader_account: row.get(7)?,
                        description: row.get(8)?,
                        slack_channels: row.get(9)?,
                        analysis_queues: row.get(10)?,
                        urawi_proposal: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn experiment_tabs(&self, experiment_id: &str) -> Result<Vec<ExperimentTab>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT tab_name, tab_content
            FROM ExperimentTabs
            WHERE experiment_id = ?1
            ORDER BY tab_id ASC
            ",
        )?;
        let rows = statement.query_map([experiment_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut tabs = Vec::new();
        for row in rows {
            let (name, content_json) = row?;
            let content = match content_json {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?,
                None => serde_json::Value::Null,
            };
            tabs.push(ExperimentTab { name, content });
        }
        Ok(tabs)
    }

    pub fn run(
        &self,
        run_number: i64,
        experiment_id: &str,
    ) -> Result<Option<RunRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "
                SELECT run_number, experiment_id, start_time, end_time, n_events, n_damaged
                FROM Run
                WHERE run_number = ?1 AND experiment_id = ?2
                ",
                params![run_number, experiment_id],
                |row| {
                    Ok(RunRecord {
                        run_number: row.get(0)?,
                        experiment_id: row.get(1)?,
                        start_time: row.get(2)?,
                        end_time: row.get(3)?,
                        n_events: row.get(4)?,
                        n_damaged: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn logbook_entries(
        &self,
        experiment_id: &str,
    ) -> Result<Vec<LogbookRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT experiment_id, run_number, timestamp, content, tags, author
            FROM Logbook
            WHERE experiment_id = ?1
            ORDER BY log_id ASC
            ",
        )?;
        let rows = statement.query_map([experiment_id], |row| {
            Ok(LogbookRecord {
                experiment_id: row.get(0)?,
                run_number: row.get(1)?,
                timestamp: row.get(2)?,
                content: row.get(3)?,
                tags: row.get(4)?,
                author: row.get(5)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn detectors_for_run(
        &self,
        experiment_id: &str,
        run_number: i64,
    ) -> Result<Vec<DetectorRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT experiment_id, run_number, detector_name, status
            FROM Detector
            WHERE experiment_id = ?1 AND run_number = ?2
            ORDER BY detector_name ASC
            ",
        )?;
        let rows = statement.query_map(params![experiment_id, run_number], |row| {
            Ok(DetectorRecord {
                experiment_id: row.get(0)?,
                run_number: row.get(1)?,
                detector_name: row.get(2)?,
                status: row.get(3)?,
            })
        })?;

        let mut detectors = Vec::new();
        for row in rows {
            detectors.push(row?);
        }
        Ok(detectors)
    }

    pub fn data_production(
        &self,
        experiment_id: &str,
        run_number: i64,
    ) -> Result<Option<DataProductionRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "
                SELECT experiment_id, run_number, n_events, n_damaged, n_dropped,
                       prod_start, prod_end
                FROM DataProduction
                WHERE experiment_id = ?1 AND run_number = ?2
                ",
                params![experiment_id, run_number],
                |row| {
                    Ok(DataProductionRecord {
                        experiment_id: row.get(0)?,
                        run_number: row.get(1)?,
                        n_events: row.get(2)?,
                        n_damaged: row.get(3)?,
                        n_dropped: row.get(4)?,
                        prod_start: row.get(5)?,
                        prod_end: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn file_manager(
        &self,
        experiment_id: &str,
        run_number: i64,
    ) -> Result<Option<FileManagerRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "
                SELECT experiment_id, run_number, number_of_files, total_size_bytes
                FROM FileManager
                WHERE experiment_id = ?1 AND run_number = ?2
                ",
                params![experiment_id, run_number],
                |row| {
                    Ok(FileManagerRecord {
                        experiment_id: row.get(0)?,
                        run_number: row.get(1)?,
                        number_of_files: row.get(2)?,
                        total_size_bytes: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

/// Per-entity row operations within one transaction. Every operation
/// consults the mode: insert mode replaces whole rows on identity
/// conflict, update mode probes for the identity and field-updates the
/// existing row, falling back to the insert statement when absent.
pub struct Reconciler<'a> {
    conn: &'a Connection,
    mode: ReconcileMode,
}

impl Reconciler<'_> {
    pub fn mode(&self) -> ReconcileMode {
        self.mode
    }

    pub fn upsert_experiment(&self, record: &ExperimentRecord) -> Result<(), StorageError> {
        if self.mode == ReconcileMode::Update {
            let exists = self
                .conn
                .query_row(
                    "SELECT 1 FROM Experiment WHERE experiment_id = ?1",
                    [&record.experiment_id],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_some() {
                // All mapped columns are overwritten, even when the new
                // artifact left them blank. See DESIGN.md.
                self.conn.execute(
                    "
                    UPDATE Experiment
                    SET name=?1, instrument=?2, start_time=?3, end_time=?4, pi=?5,
                        pi_email=?6, leader_account=?7, description=?8,
                        slack_channels=?9, analysis_queues=?10, urawi_proposal=?11
                    WHERE experiment_id=?12
                    ",
                    params![
                        record.name,
                        record.instrument,
                        record.start_time,
                        record.end_time,
                        record.pi,
                        record.pi_email,
                        record.leader_account,
                        record.description,
                        record.slack_channels,
                        record.analysis_queues,
                        record.urawi_proposal,
                        record.experiment_id,
                    ],
                )?;
                return Ok(());
            }
        }

        self.conn.execute(
            "
            INSERT INTO Experiment (
                experiment_id, name, instrument, start_time, end_time, pi, pi_email,
                leader_account, description, slack_channels, analysis_queues, urawi_proposal
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(experiment_id) DO UPDATE SET
                name=excluded.name,
                instrument=excluded.instrument,
                start_time=excluded.start_time,
                end_time=excluded.end_time,
                pi=excluded.pi,
                pi_email=excluded.pi_email,
                leader_account=excluded.leader_account,
                description=excluded.description,
                slack_channels=excluded.slack_channels,
                analysis_queues=excluded.analysis_queues,
                urawi_proposal=excluded.urawi_proposal
            ",
            params![
                record.experiment_id,
                record.name,
                record.instrument,
                record.start_time,
                record.end_time,
                record.pi,
                record.pi_email,
                record.leader_account,
                record.description,
                record.slack_channels,
                record.analysis_queues,
                record.urawi_proposal,
            ],
        )?;
        Ok(())
    }

    /// Tabs are a full replacement set as of the most recent info
    /// ingest; stale tab names must not survive.
    pub fn replace_experiment_tabs(
        &self,
        experiment_id: &str,
        tabs: &[ExperimentTab],
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM ExperimentTabs WHERE experiment_id = ?1",
            [experiment_id],
        )?;

        for tab in tabs {
            let content_json = serde_json::to_string(&tab.content)
                .map_err(|err| StorageError::Serialization(err.to_string()))?;
            self.conn.execute(
                "
                INSERT INTO ExperimentTabs (experiment_id, tab_name, tab_content)
                VALUES (?1, ?2, ?3)
                ",
                params![experiment_id, tab.name, content_json],
            )?;
        }
        Ok(())
    }

    pub fn upsert_run(&self, record: &RunRecord) -> Result<(), StorageError> {
        if self.mode == ReconcileMode::Update {
            let exists = self
                .conn
                .query_row(
                    "SELECT 1 FROM Run WHERE run_number = ?1 AND experiment_id = ?2",
                    params![record.run_number, record.experiment_id],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_some() {
                // Selective merge: fields the artifact cannot supply
                // (file_manager carries no timing or event counts)
                // leave the stored value untouched.
                self.conn.execute(
                    "
                    UPDATE Run
                    SET start_time=COALESCE(?3, start_time),
                        end_time=COALESCE(?4, end_time),
                        n_events=COALESCE(?5, n_events),
                        n_damaged=COALESCE(?6, n_damaged)
                    WHERE run_number=?1 AND experiment_id=?2
                    ",
                    params![
                        record.run_number,
                        record.experiment_id,
                        record.start_time,
                        record.end_time,
                        record.n_events,
                        record.n_damaged,
                    ],
                )?;
                return Ok(());
            }
        }

        self.conn.execute(
            "
            INSERT INTO Run (run_number, experiment_id, start_time, end_time, n_events, n_damaged)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(run_number) DO UPDATE SET
                experiment_id=excluded.experiment_id,
                start_time=excluded.start_time,
                end_time=excluded.end_time,
                n_events=excluded.n_events,
                n_damaged=excluded.n_damaged
            ",
            params![
                record.run_number,
                record.experiment_id,
                record.start_time,
                record.end_time,
                record.n_events,
                record.n_damaged,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_detector(&self, record: &DetectorRecord) -> Result<(), StorageError> {
        if self.mode == ReconcileMode::Update {
            let exists = self
                .conn
                .query_row(
                    "
                    SELECT detector_id FROM Detector
                    WHERE experiment_id = ?1 AND run_number = ?2 AND detector_name = ?3
                    ",
                    params![record.experiment_id, record.run_number, record.detector_name],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            if let Some(detector_id) = exists {
                self.conn.execute(
                    "UPDATE Detector SET status=?1 WHERE detector_id=?2",
                    params![record.status, detector_id],
                )?;
                return Ok(());
            }
        }

        self.conn.execute(
            "
            INSERT INTO Detector (experiment_id, run_number, detector_name, status)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(experiment_id, run_number, detector_name) DO UPDATE SET
                status=excluded.status
            ",
            params![
                record.experiment_id,
                record.run_number,
                record.detector_name,
                record.status,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_logbook(&self, record: &LogbookRecord) -> Result<(), StorageError> {
        if self.mode == ReconcileMode::Update {
            // Logbook rows have no natural id; (run, timestamp, author)
            // within the experiment stands in as the composite key.
            let exists = self
                .conn
                .query_row(
                    "
                    SELECT log_id FROM Logbook
                    WHERE experiment_id = ?1 AND run_number = ?2
                      AND timestamp = ?3 AND author = ?4
                    ",
                    params![
                        record.experiment_id,
                        record.run_number,
                        record.timestamp,
                        record.author
                    ],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            if let Some(log_id) = exists {
                self.conn.execute(
                    "UPDATE Logbook SET content=?1, tags=?2 WHERE log_id=?3",
                    params![record.content, record.tags, log_id],
                )?;
                return Ok(());
            }
        }

        self.conn.execute(
            "
            INSERT INTO Logbook (experiment_id, run_number, timestamp, content, tags, author)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(experiment_id, run_number, timestamp, author) DO UPDATE SET
                content=excluded.content,
                tags=excluded.tags
            ",
            params![
                record.experiment_id,
                record.run_number,
                record.timestamp,
                record.content,
                record.tags,
                record.author,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_data_production(
        &self,
        record: &DataProductionRecord,
    ) -> Result<(), StorageError> {
        if self.mode == ReconcileMode::Update {
            let exists = self
                .conn
                .query_row(
                    "
                    SELECT production_id FROM DataProduction
                    WHERE experiment_id = ?1 AND run_number = ?2
                    ",
                    params![record.experiment_id, record.run_number],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            if let Some(production_id) = exists {
                self.conn.execute(
                    "
                    UPDATE DataProduction
                    SET n_events=?1, n_damaged=?2, n_dropped=?3, prod_start=?4, prod_end=?5
                    WHERE production_id=?6
                    ",
                    params![
                        record.n_events,
                        record.n_damaged,
                        record.n_dropped,
                        record.prod_start,
                        record.prod_end,
                        production_id,
                    ],
                )?;
                return Ok(());
            }
        }

        self.conn.execute(
            "
            INSERT INTO DataProduction (
                experiment_id, run_number, n_events, n_damaged, n_dropped, prod_start, prod_end
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(experiment_id, run_number) DO UPDATE SET
                n_events=excluded.n_events,
                n_damaged=excluded.n_damaged,
                n_dropped=excluded.n_dropped,
                prod_start=excluded.prod_start,
                prod_end=excluded.prod_end
            ",
            params![
                record.experiment_id,
                record.run_number,
                record.n_events,
                record.n_damaged,
                record.n_dropped,
                record.prod_start,
                record.prod_end,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_file_manager(&self, record: &FileManagerRecord) -> Result<(), StorageError> {
        if self.mode == ReconcileMode::Update {
            let exists = self
                .conn
                .query_row(
                    "
                    SELECT file_id FROM FileManager
                    WHERE experiment_id = ?1 AND run_number = ?2
                    ",
                    params![record.experiment_id, record.run_number],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            if let Some(file_id) = exists {
                self.conn.execute(
                    "
                    UPDATE FileManager
                    SET number_of_files=?1, total_size_bytes=?2
                    WHERE file_id=?3
                    ",
                    params![record.number_of_files, record.total_size_bytes, file_id],
                )?;
                return Ok(());
            }
        }

        self.conn.execute(
            "
            INSERT INTO FileManager (experiment_id, run_number, number_of_files, total_size_bytes)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(experiment_id, run_number) DO UPDATE SET
                number_of_files=excluded.number_of_files,
                total_size_bytes=excluded.total_size_bytes
            ",
            params![
                record.experiment_id,
                record.run_number,
                record.number_of_files,
                record.total_size_bytes,
            ],
        )?;
        Ok(())
    }
}
