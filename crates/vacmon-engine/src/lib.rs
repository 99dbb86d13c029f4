//! One monitoring pass: configuration, the new-vacancy diff, dispatch, commit.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;
use vacmon_adapters::{load_codes_file, AbcClient, AbcClientConfig, DEFAULT_API_BASE_URL};
use vacmon_core::{is_eligible, EligibilityCodes, FilterCriteria, VacancyRecord};
use vacmon_notify::{EmailConfig, VacancySink};
use vacmon_storage::{NotifiedSnapshot, NotifiedStore, PollRecord, StorageError};

pub const CRATE_NAME: &str = "vacmon-engine";

/// Process-wide configuration, built once at startup and passed down
/// explicitly; nothing reads the environment after this.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub api: AbcClientConfig,
    pub districts: Vec<String>,
    pub levels: Vec<String>,
    pub codes_file: PathBuf,
    pub state_file: PathBuf,
    pub email: EmailConfig,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            api: AbcClientConfig {
                base_url: std::env::var("ABC_API_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
                timeout: Duration::from_secs(
                    std::env::var("VACMON_HTTP_TIMEOUT_SECS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(30),
                ),
                user_agent: std::env::var("VACMON_USER_AGENT")
                    .unwrap_or_else(|_| "vacmon/0.1".to_string()),
                max_results: std::env::var("VACMON_MAX_RESULTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
                accept_invalid_certs: std::env::var("VACMON_ACCEPT_INVALID_CERTS")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(false),
            },
            districts: list_from_env("VACMON_DISTRICTS", "patagones"),
            levels: list_from_env("VACMON_LEVELS", "primaria,secundaria,artistica"),
            codes_file: std::env::var("VACMON_CODES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("codigos.txt")),
            state_file: std::env::var("VACMON_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/notified.json")),
            email: EmailConfig {
                smtp_host: std::env::var("SMTP_HOST")
                    .unwrap_or_else(|_| "smtp.gmail.com".to_string()),
                smtp_port: std::env::var("SMTP_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(587),
                from_address: std::env::var("EMAIL_FROM").unwrap_or_default(),
                password: std::env::var("EMAIL_PASSWORD").unwrap_or_default(),
                to_address: std::env::var("EMAIL_TO").unwrap_or_default(),
            },
        }
    }

    pub fn criteria(&self) -> FilterCriteria {
        FilterCriteria::new(self.districts.clone(), self.levels.clone())
    }
}

fn list_from_env(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Result of filtering one raw poll against the criteria, the oblea codes
/// and the already-notified snapshot.
#[derive(Debug, Clone, Default)]
pub struct DiffReport {
    /// New-and-eligible records, input order preserved.
    pub new_eligible: Vec<VacancyRecord>,
    pub invalid: usize,
    pub ineligible: usize,
    pub already_notified: usize,
    pub duplicates_in_poll: usize,
}

impl DiffReport {
    /// Eligible records in the poll, whether or not previously notified.
    pub fn eligible(&self) -> usize {
        self.new_eligible.len() + self.already_notified
    }
}

/// Pure diff over one poll. Order preserved; duplicate ids keep the first
/// occurrence; records without an id are counted and skipped, never fatal.
pub fn diff_new_eligible(
    raw: &[VacancyRecord],
    criteria: &FilterCriteria,
    codes: &EligibilityCodes,
    notified: &NotifiedSnapshot,
) -> DiffReport {
    let mut report = DiffReport::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for record in raw {
        if !record.has_valid_id() {
            report.invalid += 1;
            continue;
        }
        if !seen.insert(record.id.as_str()) {
            report.duplicates_in_poll += 1;
            continue;
        }
        if !is_eligible(record, criteria, codes) {
            report.ineligible += 1;
            continue;
        }
        if notified.contains(&record.id) {
            report.already_notified += 1;
            continue;
        }
        report.new_eligible.push(record.clone());
    }

    report
}

/// Loads the notified snapshot and returns the ordered new-and-eligible
/// subset of `raw`. Read-only: committing is the caller's job, after the
/// notification sink confirms delivery.
pub async fn compute_new_eligible(
    raw: &[VacancyRecord],
    criteria: &FilterCriteria,
    codes: &EligibilityCodes,
    store: &NotifiedStore,
) -> Result<Vec<VacancyRecord>, StorageError> {
    let snapshot = store.load().await?;
    Ok(diff_new_eligible(raw, criteria, codes, &snapshot).new_eligible)
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub total_fetched: usize,
    pub eligible: usize,
    pub invalid_records: usize,
    pub new_notified: usize,
    pub status: String,
}

/// Filters one fetched batch and, when anything new turns up, hands it to
/// the sink and commits the delivered ids. The commit happens only after
/// the sink reports success; on sink failure the ids stay uncommitted and
/// the next pass retries them.
pub async fn process_batch(
    raw: &[VacancyRecord],
    criteria: &FilterCriteria,
    codes: &EligibilityCodes,
    store: &NotifiedStore,
    sink: &dyn VacancySink,
) -> Result<BatchOutcome> {
    let snapshot = store.load().await?;
    let report = diff_new_eligible(raw, criteria, codes, &snapshot);

    if report.invalid > 0 {
        warn!(invalid = report.invalid, "skipped records without an upstream id");
    }
    info!(
        total = raw.len(),
        eligible = report.eligible(),
        new = report.new_eligible.len(),
        already_notified = report.already_notified,
        "poll filtered"
    );

    if report.new_eligible.is_empty() {
        let status = if raw.is_empty() {
            "OK - Sin vacantes"
        } else if report.eligible() == 0 {
            "OK - Sin coincidencias"
        } else {
            "OK - Sin nuevas"
        };
        store
            .record_poll(PollRecord {
                at: Utc::now(),
                total_found: raw.len(),
                new_notified: 0,
                status: status.to_string(),
            })
            .await?;
        return Ok(BatchOutcome {
            total_fetched: raw.len(),
            eligible: report.eligible(),
            invalid_records: report.invalid,
            new_notified: 0,
            status: status.to_string(),
        });
    }

    info!(count = report.new_eligible.len(), "dispatching new vacancies");
    match sink.deliver(&report.new_eligible).await {
        Ok(()) => {
            store.commit(&report.new_eligible, Utc::now()).await?;
            store
                .record_poll(PollRecord {
                    at: Utc::now(),
                    total_found: raw.len(),
                    new_notified: report.new_eligible.len(),
                    status: "OK".to_string(),
                })
                .await?;
            Ok(BatchOutcome {
                total_fetched: raw.len(),
                eligible: report.eligible(),
                invalid_records: report.invalid,
                new_notified: report.new_eligible.len(),
                status: "OK".to_string(),
            })
        }
        Err(err) => {
            if let Err(store_err) = store
                .record_poll(PollRecord {
                    at: Utc::now(),
                    total_found: raw.len(),
                    new_notified: 0,
                    status: "ERROR - Email no enviado".to_string(),
                })
                .await
            {
                error!(error = %store_err, "failed to record poll result");
            }
            Err(err).context("delivering notification batch")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_fetched: usize,
    pub eligible: usize,
    pub invalid_records: usize,
    pub new_notified: usize,
    pub status: String,
}

/// One complete pass: load codes, fetch the listing, filter, notify,
/// commit. A fetch failure aborts the pass with the notified set untouched.
pub async fn run_pass(
    config: &MonitorConfig,
    store: &NotifiedStore,
    client: &AbcClient,
    sink: &dyn VacancySink,
) -> Result<PassSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, districts = ?config.districts, levels = ?config.levels, "starting vacancy check");

    let codes = load_codes_file(&config.codes_file).context("loading oblea codes")?;
    if codes.is_empty() {
        warn!(
            path = %config.codes_file.display(),
            "no oblea codes configured; no vacancy can match until codes are provided"
        );
    }

    let raw = match client
        .fetch_published(&config.districts, &config.levels)
        .await
    {
        Ok(raw) => raw,
        Err(err) => {
            if let Err(store_err) = store
                .record_poll(PollRecord {
                    at: Utc::now(),
                    total_found: 0,
                    new_notified: 0,
                    status: format!("ERROR - {err}"),
                })
                .await
            {
                error!(error = %store_err, "failed to record poll result");
            }
            return Err(err).context("fetching vacancy listing");
        }
    };

    let criteria = config.criteria();
    let outcome = process_batch(&raw, &criteria, &codes, store, sink).await?;

    let finished_at = Utc::now();
    info!(%run_id, status = %outcome.status, new = outcome.new_notified, "pass finished");
    Ok(PassSummary {
        run_id,
        started_at,
        finished_at,
        total_fetched: outcome.total_fetched,
        eligible: outcome.eligible,
        invalid_records: outcome.invalid_records,
        new_notified: outcome.new_notified,
        status: outcome.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use vacmon_notify::NotifyError;

    fn record(id: &str, district: &str, level: &str, codes: &[&str]) -> VacancyRecord {
        VacancyRecord {
            id: id.into(),
            position: format!("CARGO {id}"),
            position_description: String::new(),
            area_codes: codes.iter().map(|c| c.to_string()).collect(),
            level: level.into(),
            district: district.into(),
            school: "E.P. N 1".into(),
            address: String::new(),
            shift: "M".into(),
            workload: "JS".into(),
            start_date: None,
            offer_closes: None,
            schedule: BTreeMap::new(),
            replaced_teacher: None,
            replacement_reason: None,
        }
    }

    fn criteria() -> FilterCriteria {
        FilterCriteria::new(["Patagones"], ["Primaria", "Secundaria"])
    }

    fn codes() -> EligibilityCodes {
        EligibilityCodes::new(["APV", "MAT"])
    }

    struct RecordingSink {
        fail: bool,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                batches: Mutex::new(Vec::new()),
            }
        }

        fn delivered_ids(&self) -> Vec<Vec<String>> {
            self.batches.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl VacancySink for RecordingSink {
        async fn deliver(&self, vacancies: &[VacancyRecord]) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::NotConfigured);
            }
            self.batches
                .lock()
                .expect("lock")
                .push(vacancies.iter().map(|v| v.id.clone()).collect());
            Ok(())
        }
    }

    #[test]
    fn eligible_unnotified_record_is_returned() {
        let raw = vec![record("1", "Patagones", "Primaria", &["APV"])];
        let report = diff_new_eligible(&raw, &criteria(), &codes(), &NotifiedSnapshot::default());
        assert_eq!(report.new_eligible.len(), 1);
        assert_eq!(report.new_eligible[0].id, "1");
    }

    #[tokio::test]
    async fn already_notified_record_is_suppressed() {
        let dir = tempdir().expect("tempdir");
        let store = NotifiedStore::new(dir.path().join("notified.json"));
        let raw = vec![record("1", "Patagones", "Primaria", &["APV"])];
        store.commit(&raw, Utc::now()).await.expect("commit");

        let new = compute_new_eligible(&raw, &criteria(), &codes(), &store)
            .await
            .expect("compute");
        assert!(new.is_empty());
    }

    #[test]
    fn duplicate_ids_within_a_poll_keep_the_first_occurrence() {
        let raw = vec![
            record("2", "Patagones", "Primaria", &["APV"]),
            record("2", "Patagones", "Secundaria", &["MAT"]),
        ];
        let report = diff_new_eligible(&raw, &criteria(), &codes(), &NotifiedSnapshot::default());
        assert_eq!(report.new_eligible.len(), 1);
        assert_eq!(report.new_eligible[0].level, "Primaria");
        assert_eq!(report.duplicates_in_poll, 1);
    }

    #[test]
    fn disallowed_district_is_excluded_regardless_of_codes() {
        let raw = vec![record("3", "Bahía Blanca", "Primaria", &["APV", "MAT"])];
        let report = diff_new_eligible(&raw, &criteria(), &codes(), &NotifiedSnapshot::default());
        assert!(report.new_eligible.is_empty());
        assert_eq!(report.ineligible, 1);
    }

    #[test]
    fn output_preserves_input_order() {
        let raw = vec![
            record("c", "Patagones", "Primaria", &["APV"]),
            record("a", "Patagones", "Secundaria", &["MAT"]),
            record("b", "Patagones", "Primaria", &["MAT"]),
        ];
        let report = diff_new_eligible(&raw, &criteria(), &codes(), &NotifiedSnapshot::default());
        let ids: Vec<&str> = report.new_eligible.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn records_without_an_id_are_counted_and_skipped() {
        let raw = vec![
            record("", "Patagones", "Primaria", &["APV"]),
            record("1", "Patagones", "Primaria", &["APV"]),
        ];
        let report = diff_new_eligible(&raw, &criteria(), &codes(), &NotifiedSnapshot::default());
        assert_eq!(report.invalid, 1);
        assert_eq!(report.new_eligible.len(), 1);
    }

    #[tokio::test]
    async fn compute_is_idempotent_until_commit() {
        let dir = tempdir().expect("tempdir");
        let store = NotifiedStore::new(dir.path().join("notified.json"));
        let raw = vec![
            record("1", "Patagones", "Primaria", &["APV"]),
            record("2", "Patagones", "Secundaria", &["MAT"]),
        ];

        let first = compute_new_eligible(&raw, &criteria(), &codes(), &store)
            .await
            .expect("first");
        let second = compute_new_eligible(&raw, &criteria(), &codes(), &store)
            .await
            .expect("second");
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_store_aborts_the_computation() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("notified.json");
        std::fs::write(&path, b"not json at all").expect("write");
        let store = NotifiedStore::new(&path);

        let raw = vec![record("1", "Patagones", "Primaria", &["APV"])];
        let err = compute_new_eligible(&raw, &criteria(), &codes(), &store)
            .await
            .expect_err("corrupt");
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn successful_dispatch_commits_and_logs_the_poll() {
        let dir = tempdir().expect("tempdir");
        let store = NotifiedStore::new(dir.path().join("notified.json"));
        let sink = RecordingSink::new(false);
        let raw = vec![
            record("1", "Patagones", "Primaria", &["APV"]),
            record("9", "Bahía Blanca", "Primaria", &["APV"]),
        ];

        let outcome = process_batch(&raw, &criteria(), &codes(), &store, &sink)
            .await
            .expect("batch");
        assert_eq!(outcome.new_notified, 1);
        assert_eq!(outcome.status, "OK");
        assert_eq!(sink.delivered_ids(), vec![vec!["1".to_string()]]);

        let snapshot = store.load().await.expect("load");
        assert!(snapshot.contains("1"));
        assert!(!snapshot.contains("9"));

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.last_poll.expect("poll").new_notified, 1);
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_the_notified_set_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = NotifiedStore::new(dir.path().join("notified.json"));
        let sink = RecordingSink::new(true);
        let raw = vec![record("1", "Patagones", "Primaria", &["APV"])];

        let err = process_batch(&raw, &criteria(), &codes(), &store, &sink).await;
        assert!(err.is_err());

        let snapshot = store.load().await.expect("load");
        assert!(snapshot.is_empty());

        let stats = store.stats().await.expect("stats");
        assert_eq!(
            stats.last_poll.expect("poll").status,
            "ERROR - Email no enviado"
        );
    }

    #[tokio::test]
    async fn second_run_does_not_redeliver() {
        let dir = tempdir().expect("tempdir");
        let store = NotifiedStore::new(dir.path().join("notified.json"));
        let sink = RecordingSink::new(false);
        let raw = vec![record("1", "Patagones", "Primaria", &["APV"])];

        process_batch(&raw, &criteria(), &codes(), &store, &sink)
            .await
            .expect("first");
        let outcome = process_batch(&raw, &criteria(), &codes(), &store, &sink)
            .await
            .expect("second");

        assert_eq!(outcome.new_notified, 0);
        assert_eq!(outcome.status, "OK - Sin nuevas");
        assert_eq!(sink.delivered_ids().len(), 1);
    }

    #[tokio::test]
    async fn empty_poll_is_logged_without_dispatch() {
        let dir = tempdir().expect("tempdir");
        let store = NotifiedStore::new(dir.path().join("notified.json"));
        let sink = RecordingSink::new(false);

        let outcome = process_batch(&[], &criteria(), &codes(), &store, &sink)
            .await
            .expect("batch");
        assert_eq!(outcome.status, "OK - Sin vacantes");
        assert!(sink.delivered_ids().is_empty());
    }

    #[tokio::test]
    async fn poll_without_matches_is_distinguished() {
        let dir = tempdir().expect("tempdir");
        let store = NotifiedStore::new(dir.path().join("notified.json"));
        let sink = RecordingSink::new(false);
        let raw = vec![record("1", "Patagones", "Primaria", &["EFI"])];

        let outcome = process_batch(&raw, &criteria(), &codes(), &store, &sink)
            .await
            .expect("batch");
        assert_eq!(outcome.status, "OK - Sin coincidencias");
        assert_eq!(outcome.eligible, 0);
    }

    #[test]
    fn env_lists_split_and_trim() {
        let values = super::list_from_env("VACMON_TEST_UNSET_KEY", "primaria, secundaria ,,artistica");
        assert_eq!(
            values,
            vec![
                "primaria".to_string(),
                "secundaria".to_string(),
                "artistica".to_string()
            ]
        );
    }
}
