//! kedit edit journal.
//!
//! Every committed save is recorded with the full identity of the object it
//! changed, so history can be queried per object. Only the newest
//! `keep_per_object` commits of each object are retained.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use kedit_core::ObjectIdentity;
use metrics::{counter, histogram};
use rusqlite::{named_params, Connection, OptionalExtension};
use tracing::debug;

const DEFAULT_KEEP_PER_OBJECT: usize = 3;

/// Where the journal lives and how much of it to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalConfig {
    pub path: PathBuf,
    pub keep_per_object: usize,
}

impl JournalConfig {
    /// `KEDIT_DB_PATH` (default `~/.kedit/kedit.db`) and `KEDIT_JOURNAL_KEEP` (default 3).
    pub fn from_env() -> Self {
        let path = std::env::var_os("KEDIT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_path);
        let keep_per_object = std::env::var("KEDIT_JOURNAL_KEEP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_KEEP_PER_OBJECT);
        Self { path, keep_per_object }
    }
}

fn default_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".kedit").join("kedit.db"),
        None => PathBuf::from("kedit.db"),
    }
}

/// One committed edit. `identity.resource_version` is the version the store
/// assigned to the commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEdit {
    pub identity: ObjectIdentity,
    /// Unix seconds.
    pub committed_at: i64,
    pub yaml: String,
}

impl CommittedEdit {
    pub fn now(identity: ObjectIdentity, yaml: impl Into<String>) -> Self {
        Self { identity, committed_at: chrono::Utc::now().timestamp(), yaml: yaml.into() }
    }

    pub fn resource_version(&self) -> &str {
        self.identity.resource_version.as_deref().unwrap_or_default()
    }
}

pub trait EditJournal: Send + Sync {
    fn record(&self, edit: &CommittedEdit) -> Result<()>;
    /// Newest first.
    fn history(&self, identity: &ObjectIdentity, limit: usize) -> Result<Vec<CommittedEdit>>;
}

/// How a body is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Plain,
    #[cfg(feature = "zstd")]
    Zstd,
}

impl Codec {
    fn tag(self) -> &'static str {
        match self {
            Codec::Plain => "plain",
            #[cfg(feature = "zstd")]
            Codec::Zstd => "zstd",
        }
    }

    fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "plain" => Ok(Codec::Plain),
            #[cfg(feature = "zstd")]
            "zstd" => Ok(Codec::Zstd),
            other => bail!("unsupported journal codec {:?}", other),
        }
    }
}

fn encode_body(yaml: &str) -> (Codec, Vec<u8>) {
    #[cfg(feature = "zstd")]
    {
        let level = std::env::var("KEDIT_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        if let Ok(packed) = zstd::encode_all(yaml.as_bytes(), level) {
            return (Codec::Zstd, packed);
        }
    }
    (Codec::Plain, yaml.as_bytes().to_vec())
}

fn decode_body(codec: Codec, body: Vec<u8>) -> Result<String> {
    let bytes = match codec {
        Codec::Plain => body,
        #[cfg(feature = "zstd")]
        Codec::Zstd => zstd::decode_all(std::io::Cursor::new(body)).context("inflating journal body")?,
    };
    String::from_utf8(bytes).context("journal body is not UTF-8")
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS committed_edits (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    api_version      TEXT NOT NULL,
    kind             TEXT NOT NULL,
    namespace        TEXT NOT NULL,
    name             TEXT NOT NULL,
    resource_version TEXT NOT NULL,
    committed_at     INTEGER NOT NULL,
    codec            TEXT NOT NULL,
    body             BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS committed_edits_by_object
    ON committed_edits(kind, name, namespace, api_version, id DESC);
";

const OBJECT_FILTER: &str =
    "api_version = :api_version AND kind = :kind AND namespace = :namespace AND name = :name";

/// SQLite-backed journal; a single connection behind a mutex.
pub struct SqliteJournal {
    db: std::sync::Mutex<Connection>,
    keep_per_object: usize,
}

impl SqliteJournal {
    pub fn open(cfg: &JournalConfig) -> Result<Self> {
        let started = Instant::now();
        if let Some(dir) = cfg.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let db = Connection::open(&cfg.path).with_context(|| format!("opening journal at {}", cfg.path.display()))?;
        db.busy_timeout(Duration::from_secs(2)).context("setting busy timeout")?;
        let me = Self::init(db, cfg.keep_per_object)?;
        histogram!("journal_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn open_in_memory(keep_per_object: usize) -> Result<Self> {
        Self::init(Connection::open_in_memory().context("opening in-memory journal")?, keep_per_object)
    }

    fn init(db: Connection, keep_per_object: usize) -> Result<Self> {
        db.execute_batch(SCHEMA).context("creating journal schema")?;
        Ok(Self { db: std::sync::Mutex::new(db), keep_per_object: keep_per_object.max(1) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| anyhow!("journal connection poisoned"))
    }
}

impl EditJournal for SqliteJournal {
    fn record(&self, edit: &CommittedEdit) -> Result<()> {
        let started = Instant::now();
        let id = &edit.identity;
        let (codec, body) = encode_body(&edit.yaml);
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO committed_edits
                (api_version, kind, namespace, name, resource_version, committed_at, codec, body)
             VALUES (:api_version, :kind, :namespace, :name, :rv, :at, :codec, :body)",
            named_params! {
                ":api_version": id.api_version,
                ":kind": id.kind,
                ":namespace": id.scope(),
                ":name": id.name,
                ":rv": edit.resource_version(),
                ":at": edit.committed_at,
                ":codec": codec.tag(),
                ":body": body,
            },
        )
        .context("inserting committed edit")?;
        // Oldest row still inside the retention window; everything before it goes.
        let cutoff: Option<i64> = tx
            .query_row(
                &format!("SELECT id FROM committed_edits WHERE {} ORDER BY id DESC LIMIT 1 OFFSET :offset", OBJECT_FILTER),
                named_params! {
                    ":api_version": id.api_version,
                    ":kind": id.kind,
                    ":namespace": id.scope(),
                    ":name": id.name,
                    ":offset": (self.keep_per_object - 1) as i64,
                },
                |row| row.get(0),
            )
            .optional()?;
        let mut pruned = 0;
        if let Some(cutoff) = cutoff {
            pruned = tx.execute(
                &format!("DELETE FROM committed_edits WHERE {} AND id < :cutoff", OBJECT_FILTER),
                named_params! {
                    ":api_version": id.api_version,
                    ":kind": id.kind,
                    ":namespace": id.scope(),
                    ":name": id.name,
                    ":cutoff": cutoff,
                },
            )?;
        }
        tx.commit()?;
        debug!(object = %id, rv = %edit.resource_version(), pruned, "journal: committed edit recorded");
        counter!("journal_records_total", 1u64);
        histogram!("journal_record_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn history(&self, identity: &ObjectIdentity, limit: usize) -> Result<Vec<CommittedEdit>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT resource_version, committed_at, codec, body FROM committed_edits
             WHERE {} ORDER BY id DESC LIMIT :limit",
            OBJECT_FILTER
        ))?;
        let rows = stmt.query_map(
            named_params! {
                ":api_version": identity.api_version,
                ":kind": identity.kind,
                ":namespace": identity.scope(),
                ":name": identity.name,
                ":limit": limit as i64,
            },
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            let (rv, committed_at, codec, body) = row?;
            out.push(CommittedEdit {
                identity: identity.clone().with_resource_version(Some(rv)),
                committed_at,
                yaml: decode_body(Codec::from_tag(&codec)?, body)?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(ns: Option<&str>, name: &str) -> ObjectIdentity {
        ObjectIdentity {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: name.into(),
            namespace: ns.map(Into::into),
            resource_version: None,
        }
    }

    fn commit(j: &SqliteJournal, id: &ObjectIdentity, rv: &str) {
        let edit = CommittedEdit::now(id.clone().with_resource_version(Some(rv.into())), format!("rv: \"{}\"\n", rv));
        j.record(&edit).unwrap();
    }

    #[test]
    fn keeps_newest_commits_per_object() {
        let j = SqliteJournal::open_in_memory(2).unwrap();
        let id = ident(Some("prod"), "app");
        for rv in ["1", "2", "3", "4"] {
            commit(&j, &id, rv);
        }
        let rows = j.history(&id, 10).unwrap();
        let rvs: Vec<_> = rows.iter().map(|r| r.resource_version()).collect();
        assert_eq!(rvs, vec!["4", "3"]);
        assert_eq!(rows[0].yaml, "rv: \"4\"\n");
        assert_eq!(rows[0].identity.name, "app");
        assert_eq!(j.history(&id, 1).unwrap().len(), 1);
    }

    #[test]
    fn history_is_filtered_by_full_identity() {
        let j = SqliteJournal::open_in_memory(3).unwrap();
        let prod = ident(Some("prod"), "app");
        let dev = ident(Some("dev"), "app");
        let cluster = ident(None, "app");
        commit(&j, &prod, "1");
        commit(&j, &dev, "2");
        commit(&j, &cluster, "3");

        assert_eq!(j.history(&prod, 10).unwrap()[0].resource_version(), "1");
        assert_eq!(j.history(&dev, 10).unwrap()[0].resource_version(), "2");
        assert_eq!(j.history(&cluster, 10).unwrap()[0].resource_version(), "3");

        let mut other_kind = prod.clone();
        other_kind.kind = "Secret".into();
        assert!(j.history(&other_kind, 10).unwrap().is_empty());
        let mut other_version = prod.clone();
        other_version.api_version = "v2".into();
        assert!(j.history(&other_version, 10).unwrap().is_empty());
    }

    #[test]
    fn retention_of_one_object_leaves_others_alone() {
        let j = SqliteJournal::open_in_memory(1).unwrap();
        let a = ident(Some("prod"), "a");
        let b = ident(Some("prod"), "b");
        commit(&j, &a, "1");
        commit(&j, &b, "1");
        commit(&j, &a, "2");
        assert_eq!(j.history(&a, 10).unwrap().len(), 1);
        assert_eq!(j.history(&b, 10).unwrap()[0].resource_version(), "1");
    }

    #[test]
    fn file_journal_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("kedit-journal-{}", std::process::id()));
        let cfg = JournalConfig { path: dir.join("nested").join("kedit.db"), keep_per_object: 3 };
        let id = ident(Some("prod"), "app");
        commit(&SqliteJournal::open(&cfg).unwrap(), &id, "7");
        let rows = SqliteJournal::open(&cfg).unwrap().history(&id, 3).unwrap();
        assert_eq!(rows.last().map(|r| r.resource_version()), Some("7"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_codec_is_an_error() {
        assert!(Codec::from_tag("lz4").is_err());
        assert_eq!(Codec::from_tag(Codec::Plain.tag()).unwrap(), Codec::Plain);
        assert_eq!(decode_body(Codec::Plain, b"a: 1\n".to_vec()).unwrap(), "a: 1\n");
    }
}
