use std::path::Path;

use catalog::{CatalogGateway, NewFileFilter, PathPredicate};
use common::{config::GroupConfig, ShutdownSignal};
use container::{ContainerWriter, PackOutcome};
use fetch::ReplicaFetcher;
use futures::TryStreamExt;

use crate::clock::Clock;

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),
    #[error("container error: {0}")]
    Container(#[from] container::ContainerError),
    #[error("invalid regex in group {0}: {1}")]
    Regex(String, regex::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Summary of one group's pass through `run_group_tick`, used to drive
/// the status file and logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupTickOutcome {
    pub sealed: usize,
    pub discarded: usize,
    pub verification_failed: usize,
    pub quota_stopped: bool,
    pub aborted_by_shutdown: bool,
}

/// Counts files directly under `<work_dir>/container/`, the quota
/// enforcement point spec.md §9 insists happen *before* a new container
/// is created (not after), to avoid an off-by-one.
async fn count_container_dir(work_dir: &Path) -> std::io::Result<usize> {
    let dir = work_dir.join("container");
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut count = 0;
    while entries.next_entry().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Runs one tick of one group's selection loop (spec.md §4.E): enumerates
/// concrete parent paths, walks a per-parent cursor, fills containers up
/// to `archive_size_bytes` (or past it under the old-files override), and
/// packs every queued container in order. Cooperative cancellation
/// (spec.md §5) is checked before each `pack()`.
pub async fn run_group_tick(
    catalog: &dyn CatalogGateway,
    fetcher: &ReplicaFetcher,
    clock: &dyn Clock,
    work_dir: &Path,
    worker_id: &str,
    group: &GroupConfig,
    shutdown: &ShutdownSignal,
) -> Result<GroupTickOutcome, TickError> {
    let mut outcome = GroupTickOutcome::default();

    let anchored = PathPredicate::anchored(group.path_expression.clone());
    let file_regex = regex::Regex::new(&group.file_expression)
        .map_err(|e| TickError::Regex(group.name.clone(), e))?;
    let parents = catalog.distinct_parents(&anchored.as_regex_str()).await?;

    let now = clock.now_unix();
    let ctime_min = now - (group.min_age_min as i64) * 60;
    let ctime_old_threshold = now - (group.max_age_min as i64) * 60;

    let mut to_pack: Vec<ContainerWriter> = Vec::new();

    'parents: for parent in parents {
        let filter = NewFileFilter {
            path_pattern: Some(PathPredicate::anchored(regex::escape(&parent))),
            group_pattern: Some(PathPredicate::anchored(regex::escape(&group.s_group))),
            store_pattern: Some(PathPredicate::anchored(regex::escape(&group.store_name))),
            ctime_max: Some(ctime_min),
        };
        let mut cursor = catalog.list_new_files(&filter).await?;
        let mut current: Option<ContainerWriter> = None;

        while let Some(record) = cursor.try_next().await? {
            if !file_regex.is_match(&record.path) {
                continue;
            }

            if current.is_none() {
                if group.quota != -1 {
                    let count = count_container_dir(work_dir).await?;
                    if count as i64 >= group.quota {
                        outcome.quota_stopped = true;
                        break 'parents;
                    }
                }
                current = Some(
                    ContainerWriter::new(
                        work_dir,
                        group.archive_size_bytes,
                        ctime_old_threshold,
                        group.verify,
                        group.archive_path.clone(),
                    )
                    .await?,
                );
            }

            let writer = current.as_mut().expect("just constructed above");
            writer.add(catalog, worker_id, record).await?;
            if writer.is_full() {
                to_pack.push(current.take().expect("just checked is_full on Some"));
            }
        }

        if let Some(trailing) = current.take() {
            to_pack.push(trailing);
        }
    }

    for writer in to_pack {
        if !shutdown.is_running() {
            writer.abort(catalog).await?;
            outcome.aborted_by_shutdown = true;
            break;
        }
        match writer.pack(catalog, fetcher).await? {
            PackOutcome::Sealed { .. } => outcome.sealed += 1,
            PackOutcome::DiscardedBelowThreshold => outcome.discarded += 1,
            PackOutcome::VerificationFailed => outcome.verification_failed += 1,
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use catalog::{fake::FakeCatalog, FileRecord, FileState};
    use common::{config::VerifyMode, webdav::WebDavClient};
    use reqwest::Client;

    use super::*;
    use crate::clock::FixedClock;

    fn group(name: &str) -> GroupConfig {
        GroupConfig {
            name: name.to_string(),
            path_expression: "/data/a".into(),
            file_expression: ".*".into(),
            s_group: "group1".into(),
            store_name: "store1".into(),
            archive_size_bytes: 1000,
            min_age_min: 0,
            max_age_min: 999_999,
            verify: VerifyMode::FileList,
            archive_path: "/archives/a".into(),
            quota: -1,
        }
    }

    fn record(pnfsid: &str, size: u64, ctime: i64, local: &std::path::Path) -> FileRecord {
        FileRecord {
            pnfsid: pnfsid.to_string(),
            path: format!("/data/a/{pnfsid}"),
            parent: "/data/a".into(),
            size,
            ctime,
            store: "store1".into(),
            group: "group1".into(),
            hsm_type: "osm".into(),
            hsm_name: "example".into(),
            replica_uri: None,
            driver_url: None,
            localpath: Some(local.to_string_lossy().to_string()),
            state: FileState::New,
            lock: None,
            archive_url: None,
        }
    }

    fn fetcher() -> ReplicaFetcher {
        ReplicaFetcher::new(Client::new(), WebDavClient::new(Client::new(), None), None)
    }

    #[tokio::test]
    async fn seals_one_container_when_total_exceeds_threshold() {
        let work_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::new();
        for (id, size) in [("A1", 600u64), ("A2", 500)] {
            let path = source.path().join(id);
            tokio::fs::write(&path, vec![0u8; size as usize]).await.unwrap();
            let r = record(id, size, 100, &path);
            catalog.insert_file(r);
        }

        let shutdown = ShutdownSignal::for_tests_running();
        let outcome = run_group_tick(
            &catalog,
            &fetcher(),
            &FixedClock(1_000_000),
            work_dir.path(),
            "worker1",
            &group("groupA"),
            &shutdown,
        )
        .await
        .unwrap();

        assert_eq!(outcome.sealed, 1);
        assert_eq!(outcome.discarded, 0);
        assert_eq!(catalog.list_archives().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn discards_trailing_container_below_threshold() {
        let work_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::new();
        let path = source.path().join("A1");
        tokio::fs::write(&path, vec![0u8; 100]).await.unwrap();
        catalog.insert_file(record("A1", 100, 100, &path));

        let shutdown = ShutdownSignal::for_tests_running();
        let outcome = run_group_tick(
            &catalog,
            &fetcher(),
            &FixedClock(1_000_000),
            work_dir.path(),
            "worker1",
            &group("groupA"),
            &shutdown,
        )
        .await
        .unwrap();

        assert_eq!(outcome.sealed, 0);
        assert_eq!(outcome.discarded, 1);
        assert_eq!(catalog.file("A1").unwrap().state, FileState::New);
    }

    #[tokio::test]
    async fn quota_zero_stops_before_any_container_is_created() {
        let work_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let catalog = FakeCatalog::new();
        let path = source.path().join("A1");
        tokio::fs::write(&path, vec![0u8; 100]).await.unwrap();
        catalog.insert_file(record("A1", 100, 100, &path));

        let mut g = group("groupA");
        g.quota = 0;
        let shutdown = ShutdownSignal::for_tests_running();
        let outcome = run_group_tick(
            &catalog,
            &fetcher(),
            &FixedClock(1_000_000),
            work_dir.path(),
            "worker1",
            &g,
            &shutdown,
        )
        .await
        .unwrap();

        assert!(outcome.quota_stopped);
        assert_eq!(outcome.sealed, 0);
        assert_eq!(outcome.discarded, 0);
        assert_eq!(catalog.file("A1").unwrap().state, FileState::New);
    }
}
