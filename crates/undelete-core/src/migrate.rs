//! The repair pass: scan a resource prefix, clear the terminating-state marker on
//! every object and write each one back under its derived key.
//!
//! Writes are not transactional across entries. A failure after some writes leaves
//! the store partially repaired; re-running is safe because the mutation is idempotent.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    codec::{CodecError, ObjectCodec},
    resource::{IdentityError, KeyPath, TypeDescriptor},
    store::{KvStore, StoreConnector, StoreError, StoredEntry},
};

/// Registry prefix holding PersistentVolumeClaims.
pub const PVC_PREFIX: &str = "/registry/persistentvolumeclaims";

/// Which objects a run repairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTarget {
    pub prefix: String,
    pub type_descriptor: TypeDescriptor,
}

impl MigrationTarget {
    pub fn persistent_volume_claims() -> Self {
        Self {
            prefix: PVC_PREFIX.to_string(),
            type_descriptor: TypeDescriptor::persistent_volume_claim(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Do everything except the write.
    pub dry_run: bool,
}

/// Lifecycle of one run. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "index")]
pub enum MigrationState {
    Idle,
    Connected,
    Scanned,
    Processing(usize),
    Done,
    Failed,
}

impl MigrationState {
    fn rank(self) -> (u8, usize) {
        match self {
            MigrationState::Idle => (0, 0),
            MigrationState::Connected => (1, 0),
            MigrationState::Scanned => (2, 0),
            MigrationState::Processing(i) => (3, i),
            MigrationState::Done | MigrationState::Failed => (4, 0),
        }
    }
}

/// Counters for a run, complete on success and partial on failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Entries returned by the scan.
    pub scanned: usize,
    /// Entries that made it through decode, mutate, encode and write.
    pub processed: usize,
    /// Processed entries that actually carried a marker.
    pub cleared: usize,
    /// Puts acknowledged by the store.
    pub written: usize,
    pub dry_run: bool,
}

/// Operator-facing failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Connection,
    Scan,
    Decode,
    Encode,
    Write,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("connect: {0}")]
    Connect(StoreError),
    #[error("scan: {0}")]
    Scan(StoreError),
    #[error("decode entry {index} ({key}): {source}")]
    Decode {
        index: usize,
        key: String,
        source: CodecError,
    },
    #[error("encode entry {index} ({key}): {source}")]
    Encode {
        index: usize,
        key: String,
        source: CodecError,
    },
    #[error("derive key for entry {index} ({key}): {source}")]
    InvalidIdentity {
        index: usize,
        key: String,
        source: IdentityError,
    },
    #[error("put entry {index}: {source}")]
    Write { index: usize, source: StoreError },
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Connect(StoreError::Config { .. }) => ErrorKind::Config,
            MigrationError::Connect(_) => ErrorKind::Connection,
            MigrationError::Scan(_) => ErrorKind::Scan,
            MigrationError::Decode { .. } | MigrationError::InvalidIdentity { .. } => {
                ErrorKind::Decode
            }
            MigrationError::Encode { .. } => ErrorKind::Encode,
            MigrationError::Write { .. } => ErrorKind::Write,
        }
    }
}

/// A run that stopped early, with what had been done up to that point.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{error} ({} of {} entries written before stopping)", .report.written, .report.scanned)]
pub struct MigrationFailure {
    #[source]
    pub error: MigrationError,
    /// State the run was in when it failed.
    pub failed_at: MigrationState,
    pub report: MigrationReport,
}

impl MigrationFailure {
    /// True when at least one write landed, leaving a mixed store.
    pub fn is_partial(&self) -> bool {
        self.report.written > 0
    }
}

/// Drives one repair pass end to end.
pub struct StoreMigrator<C: StoreConnector> {
    connector: C,
    target: MigrationTarget,
    codec: ObjectCodec,
    options: MigrationOptions,
    state: MigrationState,
    report: MigrationReport,
}

impl<C: StoreConnector> StoreMigrator<C> {
    pub fn new(connector: C, target: MigrationTarget, options: MigrationOptions) -> Self {
        let codec = ObjectCodec::new(target.type_descriptor.clone());
        let report = MigrationReport {
            dry_run: options.dry_run,
            ..MigrationReport::default()
        };
        Self {
            connector,
            target,
            codec,
            options,
            state: MigrationState::Idle,
            report,
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Run the pass. Consumes the migrator; there is no retry or resume.
    pub async fn run(mut self) -> Result<MigrationReport, MigrationFailure> {
        match self.execute().await {
            Ok(()) => {
                self.advance(MigrationState::Done);
                info!(
                    scanned = self.report.scanned,
                    cleared = self.report.cleared,
                    written = self.report.written,
                    dry_run = self.report.dry_run,
                    "migration finished"
                );
                Ok(self.report)
            }
            Err(err) => {
                let failed_at = self.state;
                self.advance(MigrationState::Failed);
                error!(kind = ?err.kind(), "migration aborted: {err}");
                Err(MigrationFailure {
                    error: err,
                    failed_at,
                    report: self.report,
                })
            }
        }
    }

    async fn execute(&mut self) -> Result<(), MigrationError> {
        info!(store = %self.connector.describe(), "connecting");
        let store = self
            .connector
            .connect()
            .await
            .map_err(MigrationError::Connect)?;
        self.advance(MigrationState::Connected);

        let entries = store
            .scan(&self.target.prefix)
            .await
            .map_err(MigrationError::Scan)?;
        self.report.scanned = entries.len();
        self.advance(MigrationState::Scanned);
        info!(prefix = %self.target.prefix, entries = entries.len(), "scan complete");

        for (index, entry) in entries.iter().enumerate() {
            self.advance(MigrationState::Processing(index));
            self.process(&store, index, entry).await?;
        }
        Ok(())
    }

    async fn process(
        &mut self,
        store: &C::Store,
        index: usize,
        entry: &StoredEntry,
    ) -> Result<(), MigrationError> {
        let scanned_key = entry.key_lossy();

        let mut resource =
            self.codec
                .decode(&entry.value)
                .map_err(|source| MigrationError::Decode {
                    index,
                    key: scanned_key.clone(),
                    source,
                })?;

        let had_marker = resource.metadata.clear_terminating_state();

        let encoded = self
            .codec
            .encode(&resource)
            .map_err(|source| MigrationError::Encode {
                index,
                key: scanned_key.clone(),
                source,
            })?;

        let key = KeyPath::derive(&self.target.prefix, resource.namespace(), resource.name())
            .map_err(|source| MigrationError::InvalidIdentity {
                index,
                key: scanned_key.clone(),
                source,
            })?;
        if key.as_str() != scanned_key {
            warn!(scanned = %scanned_key, derived = %key, "stored key differs from derived key");
        }

        if self.options.dry_run {
            debug!(key = %key, had_marker, "dry run: skipping put");
        } else {
            store
                .put(key.as_str(), &encoded)
                .await
                .map_err(|source| MigrationError::Write { index, source })?;
            self.report.written += 1;
            debug!(key = %key, had_marker, "entry rewritten");
        }

        self.report.processed += 1;
        if had_marker {
            self.report.cleared += 1;
        }
        Ok(())
    }

    fn advance(&mut self, next: MigrationState) {
        debug_assert!(
            next.rank() > self.state.rank(),
            "state may not move from {:?} to {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        codec::tests::{pvc_bytes, pvc_bytes_marked},
        store::InMemoryKvStore,
    };

    fn key(namespace: &str, name: &str) -> String {
        format!("{PVC_PREFIX}/{namespace}/{name}")
    }

    fn seeded(entries: &[(&str, &str, bool)]) -> InMemoryKvStore {
        let store = InMemoryKvStore::new();
        for (namespace, name, terminating) in entries {
            store.insert(key(namespace, name), pvc_bytes(namespace, name, *terminating));
        }
        store
    }

    fn migrator(store: &InMemoryKvStore) -> StoreMigrator<InMemoryKvStore> {
        StoreMigrator::new(
            store.clone(),
            MigrationTarget::persistent_volume_claims(),
            MigrationOptions::default(),
        )
    }

    fn codec() -> ObjectCodec {
        ObjectCodec::new(TypeDescriptor::persistent_volume_claim())
    }

    #[tokio::test]
    async fn clears_marker_and_writes_to_derived_key() {
        let store = seeded(&[("default", "data-pvc", true)]);

        let report = migrator(&store).run().await.expect("run");

        assert_eq!(store.writes(), vec![key("default", "data-pvc")]);
        let written = store
            .get(key("default", "data-pvc").as_bytes())
            .expect("entry present");
        let decoded = codec().decode(&written).expect("decode");
        assert_eq!(decoded.metadata.deletion_timestamp, None);
        assert_eq!(decoded.metadata.deletion_grace_period_seconds, None);
        assert_eq!(written, pvc_bytes("default", "data-pvc", false));
        assert_eq!(
            report,
            MigrationReport {
                scanned: 1,
                processed: 1,
                cleared: 1,
                written: 1,
                dry_run: false,
            }
        );
    }

    #[tokio::test]
    async fn clears_objects_carrying_only_one_marker_field() {
        let store = InMemoryKvStore::new();
        store.insert(
            key("default", "stamped"),
            pvc_bytes_marked("default", "stamped", true, false),
        );
        store.insert(
            key("default", "graced"),
            pvc_bytes_marked("default", "graced", false, true),
        );

        let report = migrator(&store).run().await.expect("run");

        assert_eq!(report.cleared, 2);
        for name in ["graced", "stamped"] {
            let written = store
                .get(key("default", name).as_bytes())
                .expect("entry present");
            assert_eq!(written, pvc_bytes("default", name, false));
        }
    }

    #[tokio::test]
    async fn empty_scan_succeeds_without_writes() {
        let store = InMemoryKvStore::new();
        let report = migrator(&store).run().await.expect("run");
        assert_eq!(report.scanned, 0);
        assert_eq!(report.written, 0);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn second_pass_leaves_store_unchanged() {
        let store = seeded(&[
            ("default", "data-pvc", true),
            ("kube-system", "etcd-backup", false),
            ("team-a", "scratch", true),
        ]);

        migrator(&store).run().await.expect("first pass");
        let after_first = store.snapshot();

        let report = migrator(&store).run().await.expect("second pass");
        assert_eq!(store.snapshot(), after_first);
        assert_eq!(report.cleared, 0);
        assert_eq!(report.written, 3);
    }

    #[tokio::test]
    async fn stops_at_first_undecodable_entry() {
        let store = seeded(&[("a", "first", true), ("c", "third", true)]);
        store.insert(key("b", "second"), b"not an envelope".to_vec());

        let failure = migrator(&store).run().await.expect_err("should fail");

        assert_eq!(store.writes(), vec![key("a", "first")]);
        assert_eq!(failure.failed_at, MigrationState::Processing(1));
        assert_eq!(failure.error.kind(), ErrorKind::Decode);
        assert!(matches!(
            failure.error,
            MigrationError::Decode { index: 1, ref key, source: CodecError::MissingMagic }
                if key.ends_with("/b/second")
        ));
        assert!(failure.is_partial());
        assert_eq!(failure.report.written, 1);
        assert_eq!(failure.report.scanned, 3);
        // third entry never touched
        assert_eq!(
            store.get(key("c", "third").as_bytes()),
            Some(pvc_bytes("c", "third", true))
        );
    }

    #[tokio::test]
    async fn write_failure_is_terminal() {
        let store = seeded(&[("a", "first", true), ("b", "second", true)]);
        store.fail_put_on(key("a", "first"));

        let failure = migrator(&store).run().await.expect_err("should fail");
        assert_eq!(failure.error.kind(), ErrorKind::Write);
        assert!(!failure.is_partial());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn scan_failure_reports_scan_kind() {
        let store = InMemoryKvStore::new();
        store.fail_scans("etcdserver: request timed out");

        let failure = migrator(&store).run().await.expect_err("should fail");
        assert_eq!(failure.error.kind(), ErrorKind::Scan);
        assert_eq!(failure.failed_at, MigrationState::Connected);
    }

    #[tokio::test]
    async fn dry_run_processes_without_writing() {
        let store = seeded(&[("default", "data-pvc", true)]);
        let migrator = StoreMigrator::new(
            store.clone(),
            MigrationTarget::persistent_volume_claims(),
            MigrationOptions { dry_run: true },
        );

        let report = migrator.run().await.expect("run");
        assert!(store.writes().is_empty());
        assert_eq!(report.processed, 1);
        assert_eq!(report.cleared, 1);
        assert_eq!(report.written, 0);
        assert!(report.dry_run);
    }

    #[tokio::test]
    async fn writes_to_derived_key_when_stored_key_drifts() {
        let store = InMemoryKvStore::new();
        store.insert(
            format!("{PVC_PREFIX}/legacy/key"),
            pvc_bytes("default", "data-pvc", true),
        );

        migrator(&store).run().await.expect("run");
        assert_eq!(store.writes(), vec![key("default", "data-pvc")]);
    }

    #[tokio::test]
    async fn rejects_identity_that_cannot_form_a_key() {
        let store = InMemoryKvStore::new();
        store.insert(key("x", "y"), pvc_bytes("", "orphan", true));

        let failure = migrator(&store).run().await.expect_err("should fail");
        assert!(matches!(
            failure.error,
            MigrationError::InvalidIdentity { index: 0, .. }
        ));
        assert!(store.writes().is_empty());
    }

    struct RefusingConnector(StoreError);

    #[async_trait]
    impl StoreConnector for RefusingConnector {
        type Store = InMemoryKvStore;

        fn describe(&self) -> String {
            "refusing".to_string()
        }

        async fn connect(&self) -> Result<Self::Store, StoreError> {
            Err(self.0.clone())
        }
    }

    #[tokio::test]
    async fn connect_failures_map_to_config_or_connection() {
        let config = StoreError::Config {
            path: "/etc/etcd/ca.crt".into(),
            reason: "no such file".into(),
        };
        let failure = StoreMigrator::new(
            RefusingConnector(config),
            MigrationTarget::persistent_volume_claims(),
            MigrationOptions::default(),
        )
        .run()
        .await
        .expect_err("should fail");
        assert_eq!(failure.error.kind(), ErrorKind::Config);
        assert_eq!(failure.failed_at, MigrationState::Idle);

        let refused = StoreError::Connection {
            endpoint: "https://localhost:2379".into(),
            reason: "connection refused".into(),
        };
        let failure = StoreMigrator::new(
            RefusingConnector(refused),
            MigrationTarget::persistent_volume_claims(),
            MigrationOptions::default(),
        )
        .run()
        .await
        .expect_err("should fail");
        assert_eq!(failure.error.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn failure_exposes_underlying_error_as_source() {
        use std::error::Error as _;

        let store = InMemoryKvStore::new();
        store.insert(key("default", "broken"), b"garbage".to_vec());

        let failure = migrator(&store).run().await.expect_err("should fail");
        let source = failure.source().expect("failure has a source");
        assert_eq!(source.to_string(), failure.error.to_string());
        assert!(source.source().is_some(), "codec error is chained too");
    }

    #[test]
    fn fresh_migrator_starts_idle() {
        let store = InMemoryKvStore::new();
        assert_eq!(migrator(&store).state(), MigrationState::Idle);
    }
}
