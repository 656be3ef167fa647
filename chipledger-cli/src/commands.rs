//! Subcommand implementations.
//!
//! Each command returns the text to print so it can be tested without
//! capturing stdout.

use crate::config::AppConfig;
use anyhow::{Context, Result, anyhow, bail};
use chipledger_settlement::settle_with_tolerance;
use chipledger_storage::{FileKeyValueStore, LoadSource, LocalStore, StoreConfig, repair_session};
use chipledger_sync::{
    HttpRemoteStore, SyncCoordinator, SyncOutcome, SyncTrigger, fingerprint,
};
use chipledger_types::{MinorUnits, NetBalance, ParticipantId, UserId};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Net balances to settle, with display names when known.
#[derive(Debug, Clone, Default)]
pub struct BalanceSheet {
    pub balances: Vec<NetBalance>,
    pub names: HashMap<ParticipantId, String>,
}

impl BalanceSheet {
    fn name(&self, id: ParticipantId) -> String {
        self.names.get(&id).cloned().unwrap_or_else(|| id.to_string())
    }
}

/// Reads either a JSON array of `{participant_id, amount}` or a session record.
pub fn parse_balances(raw: &str) -> Result<BalanceSheet> {
    let value: Value = serde_json::from_str(raw).context("balance file is not valid JSON")?;
    if value.is_array() {
        let balances: Vec<NetBalance> = serde_json::from_value(value)
            .context("expected an array of {participant_id, amount} entries")?;
        return Ok(BalanceSheet {
            balances,
            names: HashMap::new(),
        });
    }

    let repaired = repair_session(&value).context("balance file is neither a balance list nor a session")?;
    for note in &repaired.notes {
        debug!("Repaired session {}: {}", repaired.session.id, note);
    }
    let session = repaired.session;
    Ok(BalanceSheet {
        balances: session.net_balances(),
        names: session
            .participants
            .iter()
            .map(|p| (p.id, p.name.clone()))
            .collect(),
    })
}

/// Settles `sheet` and describes the transfers.
pub fn settle_report(sheet: &BalanceSheet, tolerance: MinorUnits) -> String {
    let settlement = settle_with_tolerance(&sheet.balances, tolerance);
    let mut lines = Vec::new();
    if settlement.transfers.is_empty() {
        lines.push("Nothing to settle".to_string());
    }
    for transfer in &settlement.transfers {
        lines.push(format!(
            "{} pays {} {}",
            sheet.name(transfer.from),
            sheet.name(transfer.to),
            transfer.amount
        ));
    }
    if !settlement.transfers.is_empty() {
        lines.push(format!(
            "{} transfers, {} in total",
            settlement.transfers.len(),
            settlement.total_transferred()
        ));
    }
    if let Some(warning) = settlement.warning {
        lines.push(format!(
            "warning: balances do not sum to zero (residual {})",
            warning.residual
        ));
    }
    lines.join("\n")
}

/// Opens the file-backed local store of `user` under `dir`.
pub fn open_store(dir: &Path, user: &str, config: &StoreConfig) -> Result<LocalStore> {
    let kv = FileKeyValueStore::open(dir)
        .with_context(|| format!("failed to open store at {}", dir.display()))?;
    Ok(LocalStore::new(Arc::new(kv), config.clone(), &UserId::new(user)))
}

/// Describes what the store holds and what loading it had to repair.
pub fn inspect_report(store: &LocalStore) -> String {
    let report = store.load();
    let mut lines = vec![
        format!("user: {}", store.user()),
        format!("source: {:?}", report.source),
        format!("sessions: {}", report.sessions.len()),
    ];
    for session in &report.sessions {
        lines.push(format!(
            "  {}  {:?}  {}  players={}  in={}  out={}  on_table={}",
            session.id,
            session.status,
            session.name,
            session.participants.len(),
            session.total_contributions(),
            session.total_cash_out(),
            session.physical_points_on_table()
        ));
    }
    if report.skipped > 0 {
        lines.push(format!("skipped: {}", report.skipped));
    }
    for (id, notes) in &report.repairs {
        for note in notes {
            lines.push(format!("repair {id}: {note}"));
        }
    }
    for warning in &report.warnings {
        lines.push(format!("warning: {warning}"));
    }
    lines.push(format!("backups: {}", store.backup_count()));
    lines.push(format!("fingerprint: {}", fingerprint(&report.sessions)));
    lines.join("\n")
}

/// Loads the store and rewrites it in the current layout if anything was repaired.
pub fn repair_store(store: &LocalStore) -> Result<String> {
    let report = store.load();
    if report.source == LoadSource::Empty {
        return Ok("Nothing stored".to_string());
    }
    if !report.needs_rewrite() {
        return Ok(format!("Store is clean ({} sessions)", report.sessions.len()));
    }

    let saved = store.save(&report.sessions);
    if !saved.written {
        bail!(
            "failed to rewrite store: {}",
            saved.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    info!("Rewrote local store from {:?}", report.source);
    Ok(format!(
        "Rewrote {} sessions from {:?} ({} repaired, {} skipped)",
        saved.sessions,
        report.source,
        report.repairs.len(),
        report.skipped
    ))
}

/// Runs one forced sync cycle for `user` against the configured HTTP remote.
pub async fn sync_once(dir: &Path, user: &str, config: &AppConfig) -> Result<String> {
    let remote = HttpRemoteStore::new(config.remote.clone()).context("invalid remote configuration")?;
    let kv = FileKeyValueStore::open(dir)
        .with_context(|| format!("failed to open store at {}", dir.display()))?;
    let coordinator = SyncCoordinator::new(Arc::new(remote), Arc::new(kv), config.sync.clone())
        .with_store_config(config.store.clone());
    coordinator.set_user(Some(UserId::new(user)));
    if let Some(report) = coordinator.load_local() {
        info!("Local store: {} sessions ({:?})", report.sessions.len(), report.source);
    }

    match coordinator.sync(SyncTrigger::ForceRefresh).await {
        SyncOutcome::Synced {
            fetched,
            pushed,
            kept_local,
        } => Ok(format!(
            "Synced: {fetched} fetched, {pushed} pushed, {kept_local} kept local, {} sessions stored",
            coordinator.sessions().len()
        )),
        SyncOutcome::Skipped(reason) => Ok(format!("Sync skipped: {reason}")),
        SyncOutcome::Failed { error, stale, .. } => {
            let context = if stale {
                "sync failed; local data left untouched"
            } else {
                "sync failed"
            };
            Err(anyhow::Error::new(error).context(context))
        }
        SyncOutcome::LoadFailed { error } => {
            Err(anyhow::Error::new(error).context("sync failed and no local data is available"))
        }
        SyncOutcome::Superseded => Err(anyhow!("sync result was discarded")),
    }
}
