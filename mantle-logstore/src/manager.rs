//! The store manager: owns the SQLite handle, the per-machine notify
//! registry and the periodic cleanup.
use crate::import::import_legacy;
use crate::store::MachineStore;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS machine_logs (
    id INTEGER PRIMARY KEY,
    machine_id TEXT,
    message BLOB,
    created_at INTEGER
) STRICT;
CREATE INDEX IF NOT EXISTS machine_logs_machine_id_id ON machine_logs (machine_id, id);
";

/// Rows deleted per batch while enforcing the size budget.
const SIZE_TRIM_BATCH: u32 = 512;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Log pipeline knobs; see the service configuration for their sources.
#[derive(Clone)]
pub struct LogConfig {
    pub path: PathBuf,
    /// Per-machine row cap enforced by the per-write trim.
    pub max_lines_per_machine: u32,
    /// Probability that a write triggers the per-machine trim. Set to 1.0
    /// for deterministic tests.
    pub cleanup_probability: f64,
    pub cleanup_older_than: Duration,
    pub cleanup_interval: Duration,
    /// Total database size budget; unlimited when absent.
    pub max_size: Option<u64>,
    /// Clock used for row timestamps and the age sweep.
    pub now: fn() -> i64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("machine-logs.db"),
            max_lines_per_machine: 1000,
            cleanup_probability: 0.05,
            cleanup_older_than: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(10 * 60),
            max_size: None,
            now: unix_now,
        }
    }
}

/// The set of machines whose logs must be retained; everything else is
/// treated as an orphan by the periodic cleanup.
#[async_trait]
pub trait LiveMachines: Send + Sync + 'static {
    async fn live_machine_ids(&self) -> Vec<String>;
}

pub(crate) struct MachineEntry {
    pub(crate) notify: Arc<watch::Sender<i64>>,
    pub(crate) write_lock: Arc<Mutex<()>>,
}

pub(crate) struct Inner {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) config: LogConfig,
    pub(crate) machines: Mutex<HashMap<String, MachineEntry>>,
    pub(crate) ct: CancellationToken,
}

/// Owns the `machine_logs` table and hands out per-machine stores.
#[derive(Clone)]
pub struct StoreManager {
    pub(crate) inner: Arc<Inner>,
}

impl StoreManager {
    /// Opens (creating if needed) the backing database, importing any legacy
    /// single-file logs found next to it.
    pub fn open(config: LogConfig) -> Result<Self> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        if let Some(dir) = config.path.parent() {
            import_legacy(&conn, dir, config.now)?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                config,
                machines: Mutex::new(HashMap::new()),
                ct: CancellationToken::new(),
            }),
        })
    }

    /// The store for one machine; handles for the same machine share their
    /// write lock and follower notifications.
    pub fn machine_store(&self, machine_id: &str) -> MachineStore {
        let machine_id: String = machine_id.chars().take(128).collect();
        let mut machines = self.inner.machines.lock();
        let entry = machines.entry(machine_id.clone()).or_insert_with(|| {
            let (notify, _) = watch::channel(0i64);
            MachineEntry {
                notify: Arc::new(notify),
                write_lock: Arc::new(Mutex::new(())),
            }
        });
        MachineStore::new(
            Arc::clone(&self.inner),
            machine_id,
            Arc::clone(&entry.notify),
            Arc::clone(&entry.write_lock),
        )
    }

    /// Drops the notify entry for a machine; its followers see EOF and its
    /// rows become orphans for the next cleanup sweep.
    pub fn remove_machine(&self, machine_id: &str) {
        self.inner.machines.lock().remove(machine_id);
    }

    /// Closes the manager: followers and writers observe the closure within
    /// their next operation.
    pub fn close(&self) {
        self.inner.ct.cancel();
        self.inner.machines.lock().clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.ct.is_cancelled()
    }

    /// One cleanup pass in a single transaction: age sweep, orphan sweep and
    /// (when configured) the global size budget.
    pub async fn cleanup(&self, live: &dyn LiveMachines) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let live_ids = live.live_machine_ids().await;
        let config = &self.inner.config;
        let cutoff = (config.now)() - config.cleanup_older_than.as_secs() as i64;
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS live_machines (machine_id TEXT PRIMARY KEY);
             DELETE FROM live_machines;",
        )?;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO live_machines (machine_id) VALUES (?1)")?;
            for id in &live_ids {
                stmt.execute(params![id])?;
            }
        }
        let removed = tx.execute(
            "DELETE FROM machine_logs
             WHERE created_at < ?1
                OR machine_id NOT IN (SELECT machine_id FROM live_machines)",
            params![cutoff],
        )?;
        if removed > 0 {
            debug!(removed, "removed aged or orphaned log rows");
        }
        if let Some(budget) = config.max_size {
            loop {
                let used: i64 = tx.query_row(
                    "SELECT (pc.page_count - fc.freelist_count) * ps.page_size
                     FROM pragma_page_count pc, pragma_freelist_count fc, pragma_page_size ps",
                    [],
                    |row| row.get(0),
                )?;
                if used <= budget as i64 {
                    break;
                }
                let deleted = tx.execute(
                    "DELETE FROM machine_logs
                     WHERE id IN (SELECT id FROM machine_logs ORDER BY id ASC LIMIT ?1)",
                    params![SIZE_TRIM_BATCH],
                )?;
                if deleted == 0 {
                    break;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Runs [`StoreManager::cleanup`] on the configured interval until the
    /// manager is closed; terminates promptly on cancellation.
    pub fn spawn_cleanup(&self, live: Arc<dyn LiveMachines>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.inner.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so an empty database
            // is not swept right at startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = manager.inner.ct.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = manager.cleanup(live.as_ref()).await {
                            warn!(error = %err, "log cleanup pass failed");
                        }
                    }
                }
            }
        })
    }
}
