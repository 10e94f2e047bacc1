//! Line readers: a finite or follow-mode lazy sequence of log lines.
use crate::manager::Inner;
use crate::Result;
use rusqlite::params;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Rows fetched per refill query.
const BATCH: usize = 256;

/// Reads one machine's log lines in id order.
///
/// Each reader owns its cursor; restarting means opening a new reader. The
/// reader holds no database state between rows beyond the cursor, so writers
/// are never blocked by a slow consumer.
pub struct LineReader {
    inner: Arc<Inner>,
    machine_id: String,
    follow: bool,
    last_id: i64,
    buffered: VecDeque<Vec<u8>>,
    notify: watch::Receiver<i64>,
    closed: bool,
}

impl LineReader {
    pub(crate) fn new(
        inner: Arc<Inner>,
        machine_id: String,
        follow: bool,
        last_id: i64,
        notify: watch::Receiver<i64>,
    ) -> Self {
        Self {
            inner,
            machine_id,
            follow,
            last_id,
            buffered: VecDeque::new(),
            notify,
            closed: false,
        }
    }

    /// The next line, or `None` on EOF (exhaustion without follow, reader
    /// close, store close or cancellation).
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.closed || self.inner.ct.is_cancelled() {
                return Ok(None);
            }
            if let Some(line) = self.buffered.pop_front() {
                return Ok(Some(line));
            }
            let refilled = self.refill()?;
            if refilled {
                continue;
            }
            if !self.follow {
                return Ok(None);
            }
            tokio::select! {
                () = self.inner.ct.cancelled() => return Ok(None),
                changed = self.notify.changed() => {
                    // A closed channel means the machine store was removed.
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Marks the reader closed; subsequent reads return EOF.
    pub fn close(&mut self) {
        self.closed = true;
        self.buffered.clear();
    }

    fn refill(&mut self) -> Result<bool> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, message FROM machine_logs
             WHERE machine_id = ?1 AND id > ?2
             ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![self.machine_id, self.last_id, BATCH as i64],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )?;
        let mut any = false;
        for row in rows {
            let (id, message) = row?;
            self.last_id = id;
            self.buffered.push_back(message);
            any = true;
        }
        Ok(any)
    }
}
