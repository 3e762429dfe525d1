use serde::Serialize;
use tracing::{info, warn};
use undelete_core::{
    migrate::{
        ErrorKind, MigrationFailure, MigrationOptions, MigrationReport, MigrationState,
        MigrationTarget, StoreMigrator,
    },
    store::StoreConnector,
};
use undelete_etcd::etcd_store::EtcdConnector;

use crate::{
    config::MigrationConfig,
    errors::{exit_code, exit_codes},
};

/// Repair every PersistentVolumeClaim reachable with `config`. Returns the exit status.
pub async fn run(config: MigrationConfig) -> u8 {
    info!(
        endpoint = %config.settings.endpoint(),
        dry_run = config.options.dry_run,
        "starting PersistentVolumeClaim repair"
    );
    let outcome = execute(EtcdConnector::new(config.settings), config.options).await;
    println!("{}", render_summary(&outcome, config.json));
    status_for(&outcome)
}

async fn execute<C: StoreConnector>(
    connector: C,
    options: MigrationOptions,
) -> Result<MigrationReport, MigrationFailure> {
    let outcome = StoreMigrator::new(
        connector,
        MigrationTarget::persistent_volume_claims(),
        options,
    )
    .run()
    .await;

    if let Err(failure) = &outcome {
        if failure.is_partial() {
            warn!(
                written = failure.report.written,
                scanned = failure.report.scanned,
                "store left partially migrated; re-running is safe"
            );
        }
    }
    outcome
}

fn status_for(outcome: &Result<MigrationReport, MigrationFailure>) -> u8 {
    match outcome {
        Ok(_) => exit_codes::SUCCESS,
        Err(failure) => exit_code(failure.error.kind()),
    }
}

#[derive(Serialize)]
struct Summary<'a> {
    ok: bool,
    report: &'a MigrationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_at: Option<MigrationState>,
    partial: bool,
}

fn render_summary(outcome: &Result<MigrationReport, MigrationFailure>, json: bool) -> String {
    let summary = match outcome {
        Ok(report) => Summary {
            ok: true,
            report,
            error: None,
            kind: None,
            failed_at: None,
            partial: false,
        },
        Err(failure) => Summary {
            ok: false,
            report: &failure.report,
            error: Some(failure.error.to_string()),
            kind: Some(failure.error.kind()),
            failed_at: Some(failure.failed_at),
            partial: failure.is_partial(),
        },
    };

    if json {
        return serde_json::to_string(&summary)
            .unwrap_or_else(|err| format!("{{\"ok\":false,\"error\":\"summary: {err}\"}}"));
    }

    let report = summary.report;
    let mode = if report.dry_run { " (dry run)" } else { "" };
    let counts = format!(
        "scanned {}, cleared {}, written {}{mode}",
        report.scanned, report.cleared, report.written
    );
    match summary.error {
        None => format!("Done: {counts}."),
        Some(error) if summary.partial => {
            format!("Failed: {error}\n{counts}; store is partially migrated, re-run to finish.")
        }
        Some(error) => format!("Failed: {error}\n{counts}."),
    }
}
