//! Storage & DB Worker (C1 + C2).
//!
//! A single dedicated OS thread owns the one `rusqlite::Connection`. Callers
//! never touch the connection directly; they go through `DbHandle`, which
//! ships a closure across an `mpsc` channel and awaits the result on a
//! `oneshot`. This keeps every mutation on one FIFO-ordered actor without
//! needing row-level locking in the rest of the crate.

use crate::error::OrchestratorError;
use crate::types::{Builder, BuilderConfig, BuildStatusCode, PrDescriptor, PullRequest, Status};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use tokio::sync::oneshot;

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

type BoxedResult = Result<Box<dyn Any + Send>, OrchestratorError>;
type Command = Box<dyn FnOnce(&Connection) -> BoxedResult + Send>;

/// A cheap-to-clone reference to the DB worker. Every typed operation below
/// builds a closure, submits it over the channel, and awaits the reply.
#[derive(Clone)]
pub struct DbHandle {
    tx: mpsc::Sender<(Command, oneshot::Sender<BoxedResult>)>,
}

impl DbHandle {
    /// Opens (or creates) `<path>`, runs migrations, and spawns the worker thread.
    pub fn open(path: &str) -> Result<Self> {
        let mut conn = Connection::open(path).with_context(|| format!("opening {path}"))?;
        migrate(&mut conn)?;

        let (tx, rx) = mpsc::channel::<(Command, oneshot::Sender<BoxedResult>)>();
        thread::Builder::new()
            .name("db-worker".into())
            .spawn(move || {
                for (cmd, reply) in rx {
                    let result = cmd(&conn);
                    let _ = reply.send(result);
                }
                let _ = conn.execute("PRAGMA optimize", []);
            })
            .context("spawning db worker thread")?;

        Ok(Self { tx })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, OrchestratorError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, OrchestratorError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let boxed: Command = Box::new(move |conn| {
            f(conn).map(|v| Box::new(v) as Box<dyn Any + Send>)
        });
        self.tx
            .send((boxed, reply_tx))
            .map_err(|_| OrchestratorError::TransientDb("db worker is gone".into()))?;
        let result = reply_rx
            .await
            .map_err(|_| OrchestratorError::TransientDb("db worker dropped the reply".into()))?;
        result.map(|boxed| *boxed.downcast::<T>().expect("type mismatch on db reply"))
    }

    // ── PullRequest ───────────────────────────────────────────────────────

    pub async fn get_pr(&self, prid: i64) -> Result<Option<PullRequest>, OrchestratorError> {
        self.call(move |conn| get_pr(conn, prid)).await
    }

    pub async fn list_active_prs(&self) -> Result<Vec<PullRequest>, OrchestratorError> {
        self.call(list_active_prs).await
    }

    pub async fn insert_pr(&self, d: PrDescriptor) -> Result<PullRequest, OrchestratorError> {
        self.call(move |conn| insert_pr(conn, &d)).await
    }

    pub async fn update_pr(&self, pr: PullRequest) -> Result<PullRequest, OrchestratorError> {
        self.call(move |conn| update_pr(conn, &pr)).await
    }

    pub async fn close_pr(&self, prid: i64) -> Result<(), OrchestratorError> {
        self.call(move |conn| close_pr(conn, prid)).await
    }

    // ── Builder ─────────────────────────────────────────────────────────

    pub async fn get_builder(&self, bid: i64) -> Result<Option<Builder>, OrchestratorError> {
        self.call(move |conn| get_builder(conn, bid)).await
    }

    pub async fn get_builder_by_internal_name(
        &self,
        internal_name: String,
    ) -> Result<Option<Builder>, OrchestratorError> {
        self.call(move |conn| get_builder_by_internal_name(conn, &internal_name))
            .await
    }

    pub async fn list_active_builders(&self) -> Result<Vec<Builder>, OrchestratorError> {
        self.call(list_active_builders).await
    }

    pub async fn startup_reconcile(
        &self,
        config: HashMap<String, BuilderConfig>,
    ) -> Result<Vec<Builder>, OrchestratorError> {
        self.call(move |conn| startup_reconcile(conn, &config)).await
    }

    // ── Status ──────────────────────────────────────────────────────────

    pub async fn get_active_status(
        &self,
        prid: i64,
        bid: i64,
    ) -> Result<Option<Status>, OrchestratorError> {
        self.call(move |conn| get_active_status(conn, prid, bid)).await
    }

    pub async fn get_status_by_request(
        &self,
        prid: i64,
        bid: i64,
        brid: i64,
    ) -> Result<Option<Status>, OrchestratorError> {
        self.call(move |conn| get_status_by_request(conn, prid, bid, brid))
            .await
    }

    pub async fn get_status_by_build_number(
        &self,
        prid: i64,
        bid: i64,
        build_number: i64,
    ) -> Result<Option<Status>, OrchestratorError> {
        self.call(move |conn| get_status_by_build_number(conn, prid, bid, build_number))
            .await
    }

    pub async fn list_active_statuses(&self) -> Result<Vec<Status>, OrchestratorError> {
        self.call(list_active_statuses).await
    }

    pub async fn list_active_statuses_for_pr(
        &self,
        prid: i64,
    ) -> Result<Vec<Status>, OrchestratorError> {
        self.call(move |conn| list_active_statuses_for_pr(conn, prid))
            .await
    }

    /// Inserts a fresh active Status, deactivating any prior active row for
    /// the same `(prid, bid)` in the same transaction.
    pub async fn insert_status(
        &self,
        prid: i64,
        bid: i64,
        head_sha: String,
        status: BuildStatusCode,
        brid: i64,
    ) -> Result<Status, OrchestratorError> {
        self.call(move |conn| insert_status(conn, prid, bid, &head_sha, status, brid))
            .await
    }

    pub async fn update_status(&self, status: Status) -> Result<Status, OrchestratorError> {
        self.call(move |conn| update_status(conn, &status)).await
    }

    pub async fn delete_status(&self, sid: i64) -> Result<(), OrchestratorError> {
        self.call(move |conn| delete_status(conn, sid)).await
    }

    /// Highest-priority `INQUEUE`, active Status for `bid`, ordered by
    /// `(PullRequest.priority ASC, prid ASC)`.
    pub async fn pick_next_for_builder(
        &self,
        bid: i64,
    ) -> Result<Option<Status>, OrchestratorError> {
        self.call(move |conn| pick_next_for_builder(conn, bid)).await
    }
}

// ── Migration ─────────────────────────────────────────────────────────────

fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_pr(row: &rusqlite::Row<'_>) -> rusqlite::Result<PullRequest> {
    let info_str: String = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(PullRequest {
        prid: row.get(0)?,
        branch: row.get(1)?,
        author: row.get(2)?,
        assignee: row.get(3)?,
        head_user: row.get(4)?,
        head_repo: row.get(5)?,
        head_branch: row.get(6)?,
        head_sha: row.get(7)?,
        title: row.get(8)?,
        description: row.get(9)?,
        priority: row.get(10)?,
        status: row.get(11)?,
        info: serde_json::from_str(&info_str).unwrap_or(serde_json::json!({})),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const PR_COLUMNS: &str = "prid, branch, author, assignee, head_user, head_repo, head_branch, \
    head_sha, title, description, priority, status, info, created_at, updated_at";

fn row_to_builder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Builder> {
    let builders_str: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(Builder {
        bid: row.get(0)?,
        internal_name: row.get(1)?,
        name: row.get(2)?,
        builders: serde_json::from_str(&builders_str).unwrap_or_default(),
        order: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        is_perf: row.get::<_, i64>(6)? != 0,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const BUILDER_COLUMNS: &str =
    "bid, internal_name, name, builders, \"order\", active, is_perf, created_at, updated_at";

fn row_to_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<Status> {
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(Status {
        sid: row.get(0)?,
        prid: row.get(1)?,
        bid: row.get(2)?,
        head_sha: row.get(3)?,
        brid: row.get(4)?,
        build_number: row.get(5)?,
        status: BuildStatusCode(row.get(6)?),
        active: row.get::<_, i64>(7)? != 0,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const STATUS_COLUMNS: &str =
    "sid, prid, bid, head_sha, brid, build_number, status, active, created_at, updated_at";

// ── PullRequest operations ─────────────────────────────────────────────────

fn get_pr(conn: &Connection, prid: i64) -> Result<Option<PullRequest>, OrchestratorError> {
    Ok(conn
        .query_row(
            &format!("SELECT {PR_COLUMNS} FROM pullrequest WHERE prid = ?1"),
            params![prid],
            row_to_pr,
        )
        .optional()?)
}

fn list_active_prs(conn: &Connection) -> Result<Vec<PullRequest>, OrchestratorError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PR_COLUMNS} FROM pullrequest WHERE status >= 0 ORDER BY prid DESC"
    ))?;
    let rows = stmt.query_map([], row_to_pr)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn insert_pr(conn: &Connection, d: &PrDescriptor) -> Result<PullRequest, OrchestratorError> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO pullrequest (prid, branch, author, assignee, head_user, head_repo, \
         head_branch, head_sha, title, description, priority, status, info, created_at, updated_at) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,0,?12,?13,?13)",
        params![
            d.id,
            d.branch,
            d.author,
            d.assignee,
            d.head_user,
            d.head_repo,
            d.head_branch,
            d.head_sha,
            d.title,
            d.description,
            d.priority,
            d.info.to_string(),
            now,
        ],
    )?;
    get_pr(conn, d.id)?.ok_or_else(|| OrchestratorError::TransientDb("insert_pr: row vanished".into()))
}

fn update_pr(conn: &Connection, pr: &PullRequest) -> Result<PullRequest, OrchestratorError> {
    let now = now_iso();
    conn.execute(
        "UPDATE pullrequest SET branch=?2, author=?3, assignee=?4, head_user=?5, head_repo=?6, \
         head_branch=?7, head_sha=?8, title=?9, description=?10, priority=?11, status=?12, \
         info=?13, updated_at=?14 WHERE prid=?1",
        params![
            pr.prid,
            pr.branch,
            pr.author,
            pr.assignee,
            pr.head_user,
            pr.head_repo,
            pr.head_branch,
            pr.head_sha,
            pr.title,
            pr.description,
            pr.priority,
            pr.status,
            pr.info.to_string(),
            now,
        ],
    )?;
    get_pr(conn, pr.prid)?
        .ok_or_else(|| OrchestratorError::NotFound(format!("pull request {}", pr.prid)))
}

fn close_pr(conn: &Connection, prid: i64) -> Result<(), OrchestratorError> {
    conn.execute(
        "UPDATE pullrequest SET status = -1, updated_at = ?2 WHERE prid = ?1",
        params![prid, now_iso()],
    )?;
    Ok(())
}

// ── Builder operations ──────────────────────────────────────────────────────

fn get_builder(conn: &Connection, bid: i64) -> Result<Option<Builder>, OrchestratorError> {
    Ok(conn
        .query_row(
            &format!("SELECT {BUILDER_COLUMNS} FROM builder WHERE bid = ?1"),
            params![bid],
            row_to_builder,
        )
        .optional()?)
}

fn get_builder_by_internal_name(
    conn: &Connection,
    internal_name: &str,
) -> Result<Option<Builder>, OrchestratorError> {
    Ok(conn
        .query_row(
            &format!("SELECT {BUILDER_COLUMNS} FROM builder WHERE internal_name = ?1"),
            params![internal_name],
            row_to_builder,
        )
        .optional()?)
}

fn list_active_builders(conn: &Connection) -> Result<Vec<Builder>, OrchestratorError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BUILDER_COLUMNS} FROM builder WHERE active = 1 ORDER BY \"order\" ASC"
    ))?;
    let rows = stmt.query_map([], row_to_builder)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// On startup: deactivate everything, then upsert each configured entry
/// (matched first by `internal_name`, else by `name`) and reactivate it.
fn startup_reconcile(
    conn: &Connection,
    config: &HashMap<String, BuilderConfig>,
) -> Result<Vec<Builder>, OrchestratorError> {
    conn.execute("UPDATE builder SET active = 0, updated_at = ?1", params![now_iso()])?;

    for entry in config.values() {
        let existing = get_builder_by_internal_name(conn, &entry.internal_name)?.or_else(|| {
            conn.query_row(
                &format!("SELECT {BUILDER_COLUMNS} FROM builder WHERE name = ?1"),
                params![entry.name],
                row_to_builder,
            )
            .optional()
            .ok()
            .flatten()
        });

        let builders_json = serde_json::to_string(&entry.builders).unwrap_or_else(|_| "[]".into());
        let now = now_iso();
        match existing {
            Some(b) => {
                conn.execute(
                    "UPDATE builder SET internal_name=?2, name=?3, builders=?4, \"order\"=?5, \
                     active=1, is_perf=?6, updated_at=?7 WHERE bid=?1",
                    params![
                        b.bid,
                        entry.internal_name,
                        entry.name,
                        builders_json,
                        entry.order,
                        entry.is_perf as i64,
                        now,
                    ],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO builder (internal_name, name, builders, \"order\", active, \
                     is_perf, created_at, updated_at) VALUES (?1,?2,?3,?4,1,?5,?6,?6)",
                    params![
                        entry.internal_name,
                        entry.name,
                        builders_json,
                        entry.order,
                        entry.is_perf as i64,
                        now,
                    ],
                )?;
            }
        }
    }

    list_active_builders(conn)
}

// ── Status operations ───────────────────────────────────────────────────────

fn get_active_status(
    conn: &Connection,
    prid: i64,
    bid: i64,
) -> Result<Option<Status>, OrchestratorError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {STATUS_COLUMNS} FROM status WHERE prid=?1 AND bid=?2 AND active=1"
            ),
            params![prid, bid],
            row_to_status,
        )
        .optional()?)
}

fn get_status_by_request(
    conn: &Connection,
    prid: i64,
    bid: i64,
    brid: i64,
) -> Result<Option<Status>, OrchestratorError> {
    Ok(conn
        .query_row(
            &format!("SELECT {STATUS_COLUMNS} FROM status WHERE prid=?1 AND bid=?2 AND brid=?3"),
            params![prid, bid, brid],
            row_to_status,
        )
        .optional()?)
}

fn get_status_by_build_number(
    conn: &Connection,
    prid: i64,
    bid: i64,
    build_number: i64,
) -> Result<Option<Status>, OrchestratorError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {STATUS_COLUMNS} FROM status WHERE prid=?1 AND bid=?2 AND build_number=?3"
            ),
            params![prid, bid, build_number],
            row_to_status,
        )
        .optional()?)
}

fn list_active_statuses(conn: &Connection) -> Result<Vec<Status>, OrchestratorError> {
    let mut stmt = conn.prepare(&format!("SELECT {STATUS_COLUMNS} FROM status WHERE active = 1"))?;
    let rows = stmt.query_map([], row_to_status)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn list_active_statuses_for_pr(
    conn: &Connection,
    prid: i64,
) -> Result<Vec<Status>, OrchestratorError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STATUS_COLUMNS} FROM status WHERE prid = ?1 AND active = 1"
    ))?;
    let rows = stmt.query_map(params![prid], row_to_status)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn insert_status(
    conn: &Connection,
    prid: i64,
    bid: i64,
    head_sha: &str,
    status: BuildStatusCode,
    brid: i64,
) -> Result<Status, OrchestratorError> {
    let now = now_iso();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE status SET active = 0, updated_at = ?3 WHERE prid = ?1 AND bid = ?2 AND active = 1",
        params![prid, bid, now],
    )?;
    tx.execute(
        "INSERT INTO status (prid, bid, head_sha, brid, build_number, status, active, \
         created_at, updated_at) VALUES (?1,?2,?3,?4,-1,?5,1,?6,?6)",
        params![prid, bid, head_sha, brid, status.0, now],
    )?;
    let sid = tx.last_insert_rowid();
    tx.commit()?;
    conn.query_row(
        &format!("SELECT {STATUS_COLUMNS} FROM status WHERE sid = ?1"),
        params![sid],
        row_to_status,
    )
    .map_err(OrchestratorError::from)
}

fn update_status(conn: &Connection, status: &Status) -> Result<Status, OrchestratorError> {
    let now = now_iso();
    conn.execute(
        "UPDATE status SET head_sha=?2, brid=?3, build_number=?4, status=?5, active=?6, \
         updated_at=?7 WHERE sid=?1",
        params![
            status.sid,
            status.head_sha,
            status.brid,
            status.build_number,
            status.status.0,
            status.active as i64,
            now,
        ],
    )?;
    conn.query_row(
        &format!("SELECT {STATUS_COLUMNS} FROM status WHERE sid = ?1"),
        params![status.sid],
        row_to_status,
    )
    .optional()?
    .ok_or_else(|| OrchestratorError::NotFound(format!("status {}", status.sid)))
}

fn delete_status(conn: &Connection, sid: i64) -> Result<(), OrchestratorError> {
    conn.execute("DELETE FROM status WHERE sid = ?1", params![sid])?;
    Ok(())
}

fn pick_next_for_builder(conn: &Connection, bid: i64) -> Result<Option<Status>, OrchestratorError> {
    let cols: Vec<String> = STATUS_COLUMNS.split(", ").map(|c| format!("s.{c}")).collect();
    let query = format!(
        "SELECT {} FROM status s JOIN pullrequest p ON p.prid = s.prid \
         WHERE s.bid = ?1 AND s.status = ?2 AND s.active = 1 AND p.status >= 0 \
         ORDER BY p.priority ASC, p.prid ASC LIMIT 1",
        cols.join(", ")
    );
    Ok(conn
        .query_row(&query, params![bid, BuildStatusCode::INQUEUE.0], row_to_status)
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> DbHandle {
        let path = tempfile::NamedTempFile::new().unwrap();
        DbHandle::open(path.path().to_str().unwrap()).unwrap()
    }

    fn descriptor(id: i64, head_sha: &str) -> PrDescriptor {
        PrDescriptor {
            id,
            branch: "refs/pull/1".into(),
            author: "alice".into(),
            assignee: "bob".into(),
            head_user: "alice".into(),
            head_repo: "repo".into(),
            head_branch: "feature".into(),
            head_sha: head_sha.into(),
            title: "t".into(),
            description: "".into(),
            priority: 0,
            info: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let db = handle();
        db.insert_pr(descriptor(10, "aaa")).await.unwrap();
        let pr = db.get_pr(10).await.unwrap().unwrap();
        assert_eq!(pr.head_sha, "aaa");
        assert!(pr.is_active());
    }

    #[tokio::test]
    async fn insert_status_deactivates_prior_active_row() {
        let db = handle();
        db.insert_pr(descriptor(10, "aaa")).await.unwrap();
        db.startup_reconcile(HashMap::from([(
            "b1".into(),
            BuilderConfig {
                internal_name: "b1".into(),
                name: "b1".into(),
                builders: vec!["b1".into()],
                order: 0,
                is_perf: false,
            },
        )]))
        .await
        .unwrap();
        let builder = db.get_builder_by_internal_name("b1".into()).await.unwrap().unwrap();

        let first = db
            .insert_status(10, builder.bid, "aaa".into(), BuildStatusCode::INQUEUE, -1)
            .await
            .unwrap();
        let second = db
            .insert_status(10, builder.bid, "bbb".into(), BuildStatusCode::INQUEUE, -1)
            .await
            .unwrap();

        let active = db.get_active_status(10, builder.bid).await.unwrap().unwrap();
        assert_eq!(active.sid, second.sid);
        assert_eq!(active.head_sha, "bbb");

        let stale = db
            .list_active_statuses_for_pr(10)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.sid == first.sid);
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn pick_next_for_builder_orders_by_priority_then_prid() {
        let db = handle();
        db.startup_reconcile(HashMap::from([(
            "b1".into(),
            BuilderConfig {
                internal_name: "b1".into(),
                name: "b1".into(),
                builders: vec!["b1".into()],
                order: 0,
                is_perf: false,
            },
        )]))
        .await
        .unwrap();
        let builder = db.get_builder_by_internal_name("b1".into()).await.unwrap().unwrap();

        let mut high_priority = descriptor(20, "aaa");
        high_priority.priority = 5;
        db.insert_pr(descriptor(10, "aaa")).await.unwrap();
        db.insert_pr(high_priority).await.unwrap();

        db.insert_status(10, builder.bid, "aaa".into(), BuildStatusCode::INQUEUE, -1)
            .await
            .unwrap();
        db.insert_status(20, builder.bid, "aaa".into(), BuildStatusCode::INQUEUE, -1)
            .await
            .unwrap();

        let next = db.pick_next_for_builder(builder.bid).await.unwrap().unwrap();
        assert_eq!(next.prid, 10, "lower priority value should be picked first");
    }
}
