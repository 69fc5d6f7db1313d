//! Append-only SQLite sink for similarity records.
//!
//! Records are buffered and flushed as one multi-row `INSERT` per batch.
//! Producers never touch the buffer: they hold a [`RecordSink`] feeding a
//! single writer thread that owns the store.
use crate::error::PipelineError;
use crate::similarity::SimilarityRecord;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use rusqlite::{params_from_iter, types::ToSql, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// SQLite's default cap on bound parameters per statement.
const MAX_PARAMS: usize = 32_766;
const COLUMNS: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub rows: usize,
    pub batches: usize,
}

pub struct ResultStore {
    conn: Connection,
    buffer: Vec<SimilarityRecord>,
    batch_size: usize,
    summary: StoreSummary,
}

impl ResultStore {
    /// Opens (creating if needed) the similarity table at `path`.
    pub fn open(path: &Path, batch_size: usize) -> Result<Self, PipelineError> {
        Self::init(Connection::open(path)?, batch_size)
    }

    /// Opens and drops every row left from an earlier run.
    pub fn open_fresh(path: &Path, batch_size: usize) -> Result<Self, PipelineError> {
        let store = Self::open(path, batch_size)?;
        let wiped = store.conn.execute("DELETE FROM similarity", ())?;
        if wiped > 0 {
            info!("wiped {wiped} row(s) from {}", path.display());
        }
        Ok(store)
    }

    pub fn open_in_memory(batch_size: usize) -> Result<Self, PipelineError> {
        Self::init(Connection::open_in_memory()?, batch_size)
    }

    fn init(conn: Connection, batch_size: usize) -> Result<Self, PipelineError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS similarity (
                seq_1 TEXT NOT NULL,
                seq_2 TEXT NOT NULL,
                score REAL NOT NULL
            )",
            (),
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS similarity_pair ON similarity (seq_1, seq_2)",
            (),
        )?;
        Ok(Self {
            conn,
            buffer: Vec::with_capacity(batch_size.max(1)),
            batch_size: batch_size.max(1),
            summary: StoreSummary::default(),
        })
    }

    /// Rows and batches written so far (buffered records excluded).
    pub fn summary(&self) -> StoreSummary {
        self.summary
    }

    pub fn append(&mut self, record: SimilarityRecord) -> Result<(), PipelineError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn append_batch<I>(&mut self, records: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = SimilarityRecord>,
    {
        for r in records {
            self.append(r)?;
        }
        Ok(())
    }

    /// Writes the buffer in one transaction. No-op when empty.
    pub fn flush(&mut self) -> Result<(), PipelineError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let t0 = Instant::now();
        let tx = self.conn.transaction()?;
        for rows in self.buffer.chunks(MAX_PARAMS / COLUMNS) {
            let placeholders = vec!["(?, ?, ?)"; rows.len()].join(", ");
            let sql = format!("INSERT INTO similarity (seq_1, seq_2, score) VALUES {placeholders}");
            let values = rows
                .iter()
                .flat_map(|r| [&r.seq_1 as &dyn ToSql, &r.seq_2, &r.score]);
            tx.execute(&sql, params_from_iter(values))?;
        }
        tx.commit()?;
        self.summary.rows += self.buffer.len();
        self.summary.batches += 1;
        debug!(
            "flushed batch {} ({} rows) in {} ms",
            self.summary.batches,
            self.buffer.len(),
            t0.elapsed().as_millis()
        );
        self.buffer.clear();
        Ok(())
    }

    /// End of stream: flushes what is left.
    pub fn finish(mut self) -> Result<StoreSummary, PipelineError> {
        self.flush()?;
        Ok(self.summary)
    }

    pub fn score(&self, seq_1: &str, seq_2: &str) -> Result<Option<f64>, PipelineError> {
        Ok(self
            .conn
            .query_row(
                "SELECT score FROM similarity WHERE seq_1 = ?1 AND seq_2 = ?2",
                (seq_1, seq_2),
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn row_count(&self) -> Result<usize, PipelineError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM similarity", (), |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Producer side of the writer channel. Cheap to clone.
#[derive(Clone)]
pub struct RecordSink {
    tx: Sender<Vec<SimilarityRecord>>,
}

impl RecordSink {
    pub fn send(&self, records: Vec<SimilarityRecord>) -> Result<(), PipelineError> {
        self.tx
            .send(records)
            .map_err(|_| PipelineError::WriterClosed("writer stopped accepting records".into()))
    }
}

/// The one thread allowed to append to a [`ResultStore`].
pub struct StoreWriter {
    tx: Sender<Vec<SimilarityRecord>>,
    handle: JoinHandle<Result<StoreSummary, PipelineError>>,
}

impl StoreWriter {
    /// `capacity` bounds the number of pending record vectors, so fast
    /// producers block instead of piling up memory.
    pub fn spawn(store: ResultStore, capacity: usize) -> Result<Self, PipelineError> {
        let (tx, rx) = bounded(capacity.max(1));
        let handle = thread::Builder::new()
            .name("result-store".into())
            .spawn(move || Self::drain(store, rx))
            .map_err(|e| PipelineError::WriterClosed(format!("spawn writer: {e}")))?;
        Ok(Self { tx, handle })
    }

    fn drain(
        mut store: ResultStore,
        rx: Receiver<Vec<SimilarityRecord>>,
    ) -> Result<StoreSummary, PipelineError> {
        // a flush error returns early and drops `rx`, failing later sends
        for records in rx {
            store.append_batch(records)?;
        }
        store.finish()
    }

    pub fn sink(&self) -> RecordSink {
        RecordSink {
            tx: self.tx.clone(),
        }
    }

    /// Closes the stream once every sink is dropped and waits for the
    /// final flush.
    pub fn finish(self) -> Result<StoreSummary, PipelineError> {
        drop(self.tx);
        let summary = self
            .handle
            .join()
            .map_err(|_| PipelineError::WriterClosed("writer thread panicked".into()))??;
        info!("result store: {} row(s) in {} batch(es)", summary.rows, summary.batches);
        Ok(summary)
    }
}
