//! Per-machine log stores.
use crate::manager::Inner;
use crate::reader::LineReader;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tokio::sync::watch;

/// Messages longer than this are truncated before insert.
const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Writes log lines for one machine and hands out readers over them.
///
/// `write_line` holds the per-store mutex for the full insert + notify +
/// trim sequence; followers are notified through a single-slot channel so a
/// slow reader never blocks the writer.
#[derive(Clone)]
pub struct MachineStore {
    inner: Arc<Inner>,
    machine_id: String,
    notify: Arc<watch::Sender<i64>>,
    write_lock: Arc<Mutex<()>>,
}

impl MachineStore {
    pub(crate) fn new(
        inner: Arc<Inner>,
        machine_id: String,
        notify: Arc<watch::Sender<i64>>,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            inner,
            machine_id,
            notify,
            write_lock,
        }
    }

    #[must_use]
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Appends one line. Committed lines are visible to every follower in
    /// write order.
    pub fn write_line(&self, message: &[u8]) -> Result<()> {
        if self.inner.ct.is_cancelled() {
            return Err(Error::Closed);
        }
        let _guard = self.write_lock.lock();
        let message = &message[..message.len().min(MAX_MESSAGE_BYTES)];
        let created_at = (self.inner.config.now)();
        let id = {
            let conn = self.inner.conn.lock();
            conn.execute(
                "INSERT INTO machine_logs (machine_id, message, created_at) VALUES (?1, ?2, ?3)",
                params![self.machine_id, message, created_at],
            )?;
            conn.last_insert_rowid()
        };
        let _ = self.notify.send_replace(id);
        if rand::random::<f64>() < self.inner.config.cleanup_probability {
            self.trim()?;
        }
        Ok(())
    }

    /// Keeps only the newest `max_lines_per_machine` rows for this machine.
    fn trim(&self) -> Result<()> {
        let cap = self.inner.config.max_lines_per_machine;
        let conn = self.inner.conn.lock();
        let horizon: Option<i64> = conn
            .query_row(
                "SELECT id FROM machine_logs WHERE machine_id = ?1
                 ORDER BY id DESC LIMIT 1 OFFSET ?2",
                params![self.machine_id, cap],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(horizon) = horizon {
            conn.execute(
                "DELETE FROM machine_logs WHERE machine_id = ?1 AND id <= ?2",
                params![self.machine_id, horizon],
            )?;
        }
        Ok(())
    }

    /// Opens a reader positioned at the newest `n_lines` (ascending by id).
    ///
    /// Negative `n_lines` reads from the beginning; zero starts empty. With
    /// `follow` the reader blocks at the tail and emits new lines as they
    /// are written; without it, exhaustion is EOF.
    pub fn reader(&self, n_lines: i64, follow: bool) -> Result<LineReader> {
        // Subscribe before the position query so a concurrent write is seen
        // either by the query or by the first wait.
        let notify = self.notify.subscribe();
        let last_id = {
            let conn = self.inner.conn.lock();
            if n_lines < 0 {
                0
            } else if n_lines == 0 {
                conn.query_row(
                    "SELECT COALESCE(MAX(id), 0) FROM machine_logs WHERE machine_id = ?1",
                    params![self.machine_id],
                    |row| row.get(0),
                )?
            } else {
                let nth: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM machine_logs WHERE machine_id = ?1
                         ORDER BY id DESC LIMIT 1 OFFSET ?2",
                        params![self.machine_id, n_lines - 1],
                        |row| row.get(0),
                    )
                    .optional()?;
                nth.map(|id| id - 1).unwrap_or(0)
            }
        };
        Ok(LineReader::new(
            Arc::clone(&self.inner),
            self.machine_id.clone(),
            follow,
            last_id,
            notify,
        ))
    }
}
