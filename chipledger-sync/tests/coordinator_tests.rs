use chipledger_storage::{LoadSource, LocalStore, MemoryKeyValueStore, StoreConfig};
use chipledger_sync::remote::mock::{InjectedFailure, MemoryRemoteStore};
use chipledger_sync::{
    GrantStatus, ManualClock, MessageKind, NetworkQuality, PendingWrite, RemoteStore, SkipReason,
    SyncConfig, SyncCoordinator, SyncError, SyncEvent, SyncOutcome, SyncPhase, SyncTrigger,
    TokioClock,
};
use chipledger_types::{
    ConversionRate, MinorUnits, Session, SessionAccess, SessionId, SessionStatus, Timestamp, UserId,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const START: u64 = 1_700_000_000_000;

struct Harness {
    remote: Arc<MemoryRemoteStore>,
    kv: Arc<MemoryKeyValueStore>,
    clock: Arc<ManualClock>,
    coordinator: SyncCoordinator,
    user: UserId,
}

fn harness() -> Harness {
    let remote = Arc::new(MemoryRemoteStore::new());
    let kv = Arc::new(MemoryKeyValueStore::new());
    harness_on(remote, kv)
}

fn harness_on(remote: Arc<MemoryRemoteStore>, kv: Arc<MemoryKeyValueStore>) -> Harness {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(START)));
    let coordinator = SyncCoordinator::new(remote.clone(), kv.clone(), SyncConfig::default())
        .with_clock(clock.clone());
    let user = UserId::new("ana");
    coordinator.set_user(Some(user.clone()));
    Harness {
        remote,
        kv,
        clock,
        coordinator,
        user,
    }
}

fn game(name: &str) -> Session {
    Session::new(name, ConversionRate::one_to_one(), MinorUnits::new(100))
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ── Fetch & merge ────────────────────────────────────────────────

#[tokio::test]
async fn mount_fetches_owned_and_accepted_shared_sessions() {
    let h = harness();
    let bob = UserId::new("bob");
    let mine = game("mine");
    let theirs = game("theirs");
    let invited = game("invited");
    h.remote.insert(&h.user, mine.clone());
    h.remote.insert(&bob, theirs.clone());
    h.remote.insert(&bob, invited.clone());
    h.remote.share(theirs.id, &h.user, GrantStatus::Accepted);
    h.remote.share(invited.id, &h.user, GrantStatus::Pending);

    let outcome = h.coordinator.sync(SyncTrigger::Mount).await;
    assert!(
        matches!(outcome, SyncOutcome::Synced { fetched: 2, pushed: 0, .. }),
        "{outcome:?}"
    );

    let sessions = h.coordinator.sessions();
    assert_eq!(sessions.len(), 2);
    assert_eq!(h.coordinator.session(mine.id).unwrap().access, SessionAccess::Owner);
    let shared = h.coordinator.session(theirs.id).unwrap();
    assert_eq!(shared.access, SessionAccess::Guest);
    assert_eq!(shared.owner_id, Some(bob));
    assert!(h.coordinator.session(invited.id).is_none());

    let status = h.coordinator.status();
    assert_eq!(status.last_sync_time, Some(Timestamp::from_millis(START)));
    assert_eq!(status.phase, SyncPhase::Cooldown);
    assert!(!status.stale);
}

#[tokio::test]
async fn owned_copy_wins_over_shared_copy() {
    let h = harness();
    let session = game("both");
    h.remote.insert(&h.user, session.clone());
    h.remote.share(session.id, &h.user, GrantStatus::Accepted);

    h.coordinator.sync(SyncTrigger::Mount).await;

    let sessions = h.coordinator.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].access, SessionAccess::Owner);
}

#[tokio::test]
async fn sessions_are_sorted_newest_first() {
    let h = harness();
    let old = Session::with_id(SessionId::new(), "old", Timestamp::from_millis(1_000));
    let new = Session::with_id(SessionId::new(), "new", Timestamp::from_millis(2_000));
    h.remote.insert(&h.user, old.clone());
    h.remote.insert(&h.user, new.clone());

    h.coordinator.sync(SyncTrigger::Mount).await;

    let ids: Vec<SessionId> = h.coordinator.sessions().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![new.id, old.id]);
}

#[tokio::test]
async fn remote_deletion_drops_untouched_local_copy() {
    let h = harness();
    let session = game("gone");
    h.remote.insert(&h.user, session.clone());
    h.coordinator.sync(SyncTrigger::Mount).await;
    assert_eq!(h.coordinator.sessions().len(), 1);

    h.remote.delete(&h.user, session.id).await.unwrap();
    h.clock.advance(Duration::from_secs(31));
    h.coordinator.sync(SyncTrigger::Periodic).await;

    assert!(h.coordinator.sessions().is_empty());
}

// ── Gating ───────────────────────────────────────────────────────

#[tokio::test]
async fn cooldown_prevents_back_to_back_fetches() {
    let h = harness();

    assert!(h.coordinator.sync(SyncTrigger::Mount).await.is_synced());
    let second = h.coordinator.sync(SyncTrigger::VisibilityRegained).await;
    assert!(matches!(second, SyncOutcome::Skipped(SkipReason::CoolingDown { .. })));
    assert_eq!(h.remote.calls().fetch_owned, 1);

    h.clock.advance(Duration::from_secs(30));
    assert!(h.coordinator.sync(SyncTrigger::Periodic).await.is_synced());
    assert_eq!(h.remote.calls().fetch_owned, 2);
}

#[tokio::test]
async fn failed_attempt_still_starts_cooldown() {
    let h = harness();
    h.remote.fail_next(InjectedFailure::Network);

    let first = h.coordinator.sync(SyncTrigger::Mount).await;
    assert_eq!(first.retry_in(), Some(Duration::from_secs(2)));

    h.clock.advance(Duration::from_secs(3));
    let periodic = h.coordinator.sync(SyncTrigger::Periodic).await;
    assert!(
        matches!(
            periodic,
            SyncOutcome::Skipped(SkipReason::CoolingDown { remaining }) if remaining == Duration::from_secs(27)
        ),
        "{periodic:?}"
    );
    assert_eq!(h.remote.calls().fetch_owned, 1);

    // The scheduled retry answers to the backoff, not the cooldown.
    assert!(h.coordinator.sync(SyncTrigger::Retry).await.is_synced());
    assert_eq!(h.remote.calls().fetch_owned, 2);
}

#[tokio::test]
async fn force_refresh_ignores_cooldown() {
    let h = harness();
    h.coordinator.sync(SyncTrigger::Mount).await;
    assert!(h.coordinator.sync(SyncTrigger::ForceRefresh).await.is_synced());
    assert_eq!(h.remote.calls().fetch_owned, 2);
}

#[tokio::test]
async fn sync_without_user_is_skipped() {
    let h = harness();
    h.coordinator.set_user(None);
    let outcome = h.coordinator.sync(SyncTrigger::ForceRefresh).await;
    assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::NoUser)));
    assert_eq!(h.remote.calls().fetch_owned, 0);
}

#[tokio::test]
async fn offline_skips_automatic_syncs() {
    let h = harness();
    h.coordinator.set_network(NetworkQuality::Offline);
    let outcome = h.coordinator.sync(SyncTrigger::Periodic).await;
    assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::Offline)));
    assert_eq!(h.coordinator.status().network, NetworkQuality::Offline);
    assert_eq!(h.remote.calls().fetch_owned, 0);
}

#[tokio::test]
async fn local_change_without_edits_is_skipped() {
    let h = harness();
    h.coordinator.sync(SyncTrigger::Mount).await;
    h.clock.advance(Duration::from_secs(60));

    let outcome = h.coordinator.sync(SyncTrigger::LocalChange).await;
    assert!(matches!(outcome, SyncOutcome::Skipped(SkipReason::Unchanged)));
}

// ── Writes ───────────────────────────────────────────────────────

#[tokio::test]
async fn added_session_is_pushed_on_next_sync() {
    let h = harness();
    let session = game("new");
    let id = h.coordinator.add(session.clone());

    assert_eq!(h.coordinator.status().pending_writes, 1);
    assert_eq!(h.coordinator.session(id).unwrap().owner_id, Some(h.user.clone()));

    let outcome = h.coordinator.sync(SyncTrigger::LocalChange).await;
    assert!(matches!(outcome, SyncOutcome::Synced { pushed: 1, .. }), "{outcome:?}");
    assert_eq!(h.remote.session(id).unwrap().name, "new");
    assert!(h.coordinator.pending_writes().is_empty());
    assert_eq!(h.coordinator.sessions().len(), 1);
}

#[tokio::test]
async fn outbox_folds_writes_per_session() {
    let h = harness();
    let mut session = game("draft");
    let id = h.coordinator.add(session.clone());
    session.name = "final".into();
    h.coordinator.update(session).unwrap();

    let pending = h.coordinator.pending_writes();
    assert_eq!(pending.len(), 1);
    assert!(matches!(&pending[0], PendingWrite::Create(s) if s.name == "final"));

    h.coordinator.remove(id).unwrap();
    assert!(h.coordinator.pending_writes().is_empty());
    assert!(h.coordinator.sessions().is_empty());
}

#[tokio::test]
async fn update_of_unknown_session_fails() {
    let h = harness();
    let err = h.coordinator.update(game("ghost")).unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert!(matches!(h.coordinator.remove(SessionId::new()), Err(SyncError::NotFound(_))));
}

#[tokio::test]
async fn modify_applies_model_mutations() {
    let h = harness();
    let id = h.coordinator.add(game("table"));
    let at = Timestamp::from_millis(START);

    let updated = h
        .coordinator
        .modify(id, |s| {
            let pid = s.add_participant("Ana", at)?;
            s.standard_buy_in(pid, at)
        })
        .unwrap();
    assert_eq!(updated.total_contributions(), MinorUnits::new(100));
    assert_eq!(h.coordinator.session(id).unwrap(), updated);

    let err = h
        .coordinator
        .modify(id, |s| s.buy_in(s.participants[0].id, MinorUnits::new(-1), Default::default(), at))
        .unwrap_err();
    assert!(matches!(err, SyncError::Model(_)));
}

#[tokio::test]
async fn removed_session_is_deleted_remotely() {
    let h = harness();
    let session = game("doomed");
    h.remote.insert(&h.user, session.clone());
    h.coordinator.sync(SyncTrigger::Mount).await;

    h.coordinator.remove(session.id).unwrap();
    assert_eq!(h.coordinator.pending_writes(), vec![PendingWrite::Delete(session.id)]);

    h.coordinator.sync(SyncTrigger::ForceRefresh).await;
    assert_eq!(h.remote.session_count(), 0);
    assert!(h.coordinator.sessions().is_empty());
    assert_eq!(h.remote.calls().delete, 1);
}

#[tokio::test]
async fn guest_updates_stay_local() {
    let h = harness();
    let bob = UserId::new("bob");
    let shared = game("bob's game");
    h.remote.insert(&bob, shared.clone());
    h.remote.share(shared.id, &h.user, GrantStatus::Accepted);
    h.coordinator.sync(SyncTrigger::Mount).await;

    let mut edited = h.coordinator.session(shared.id).unwrap();
    edited.name = "renamed by guest".into();
    h.coordinator.update(edited).unwrap();

    assert!(h.coordinator.pending_writes().is_empty());
    assert_eq!(h.coordinator.session(shared.id).unwrap().access, SessionAccess::Guest);
    assert_eq!(h.remote.session(shared.id).unwrap().name, "bob's game");
}

#[tokio::test]
async fn rejected_write_is_dropped() {
    let h = harness();
    h.coordinator.add(game("contested"));
    h.remote.fail_next(InjectedFailure::Forbidden);

    let outcome = h.coordinator.sync(SyncTrigger::LocalChange).await;
    assert!(matches!(outcome, SyncOutcome::Synced { pushed: 0, .. }), "{outcome:?}");
    assert!(h.coordinator.pending_writes().is_empty());
}

#[tokio::test]
async fn last_writer_wins_across_devices() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let phone = harness_on(remote.clone(), Arc::new(MemoryKeyValueStore::new()));
    let laptop = harness_on(remote.clone(), Arc::new(MemoryKeyValueStore::new()));

    let id = phone.coordinator.add(game("friday"));
    phone.coordinator.sync(SyncTrigger::Mount).await;
    laptop.coordinator.sync(SyncTrigger::Mount).await;
    let stale_on_phone = phone.coordinator.session(id).unwrap();

    let mut from_laptop = laptop.coordinator.session(id).unwrap();
    from_laptop.name = "friday (laptop)".into();
    laptop.coordinator.update(from_laptop).unwrap();
    laptop.coordinator.sync(SyncTrigger::ForceRefresh).await;
    assert_eq!(remote.session(id).unwrap().name, "friday (laptop)");

    let mut from_phone = stale_on_phone;
    from_phone.standard_buy_in = MinorUnits::new(500);
    phone.coordinator.update(from_phone).unwrap();
    phone.coordinator.sync(SyncTrigger::ForceRefresh).await;

    let stored = remote.session(id).unwrap();
    assert_eq!(stored.name, "friday");
    assert_eq!(stored.standard_buy_in, MinorUnits::new(500));
}

// ── Concurrent edits ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn edit_during_sync_is_not_overwritten() {
    let h = harness();
    let session = game("old name");
    h.remote.insert(&h.user, session.clone());
    h.coordinator.sync(SyncTrigger::Mount).await;
    h.clock.advance(Duration::from_secs(31));
    h.remote.set_latency(Duration::from_millis(100));

    let (outcome, _) = tokio::join!(h.coordinator.sync(SyncTrigger::Periodic), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.clock.advance(Duration::from_millis(10));
        h.coordinator
            .modify(session.id, |s| {
                s.name = "new name".into();
                Ok(())
            })
            .unwrap();
    });

    assert!(matches!(outcome, SyncOutcome::Synced { kept_local: 1, .. }), "{outcome:?}");
    assert_eq!(h.coordinator.session(session.id).unwrap().name, "new name");
    assert_eq!(h.coordinator.pending_writes().len(), 1);
    assert_eq!(h.remote.session(session.id).unwrap().name, "old name");
}

#[tokio::test(start_paused = true)]
async fn deletion_during_sync_is_not_resurrected() {
    let h = harness();
    let session = game("short lived");
    h.remote.insert(&h.user, session.clone());
    h.coordinator.sync(SyncTrigger::Mount).await;
    h.clock.advance(Duration::from_secs(31));
    h.remote.set_latency(Duration::from_millis(100));

    tokio::join!(h.coordinator.sync(SyncTrigger::Periodic), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.coordinator.remove(session.id).unwrap();
    });

    assert!(h.coordinator.session(session.id).is_none());
    assert_eq!(h.coordinator.pending_writes(), vec![PendingWrite::Delete(session.id)]);
}

#[tokio::test(start_paused = true)]
async fn user_switch_discards_in_flight_result() {
    let h = harness();
    h.remote.insert(&h.user, game("ana's"));
    h.remote.set_latency(Duration::from_millis(100));

    let (outcome, _) = tokio::join!(h.coordinator.sync(SyncTrigger::Mount), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.coordinator.set_user(Some(UserId::new("bob")));
    });

    assert!(matches!(outcome, SyncOutcome::Superseded), "{outcome:?}");
    assert!(h.coordinator.sessions().is_empty());
    assert_eq!(h.coordinator.status().last_sync_time, None);
}

// ── Failures ─────────────────────────────────────────────────────

#[tokio::test]
async fn failed_sync_falls_back_to_local_snapshot() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let kv = Arc::new(MemoryKeyValueStore::new());
    let first = harness_on(remote.clone(), kv.clone());
    first.coordinator.add(game("saved"));
    assert!(first.coordinator.flush_local("test"));

    // Restart with the server unreachable.
    let h = harness_on(remote, kv);
    h.remote.fail_always(Some(InjectedFailure::Network));
    let outcome = h.coordinator.sync(SyncTrigger::Mount).await;

    match outcome {
        SyncOutcome::Failed { error, retry_in, stale } => {
            assert!(error.is_transient());
            assert_eq!(retry_in, Some(Duration::from_secs(2)));
            assert!(stale);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.coordinator.sessions().len(), 1);
    let status = h.coordinator.status();
    assert!(status.stale);
    assert_eq!(status.phase, SyncPhase::Error);
    let message = status.message.unwrap();
    assert_eq!(message.kind, MessageKind::Network);
    assert!(message.dismissable);

    h.coordinator.dismiss_error();
    assert_eq!(h.coordinator.status().message, None);
}

#[tokio::test]
async fn retries_stall_then_force_refresh_recovers() {
    let h = harness();
    h.remote.fail_always(Some(InjectedFailure::Network));

    let first = h.coordinator.sync(SyncTrigger::Mount).await;
    assert_eq!(first.retry_in(), Some(Duration::from_secs(2)));

    let early = h.coordinator.sync(SyncTrigger::Retry).await;
    assert!(matches!(early, SyncOutcome::Skipped(SkipReason::BackingOff { .. })));

    h.clock.advance(Duration::from_secs(2));
    let second = h.coordinator.sync(SyncTrigger::Retry).await;
    assert_eq!(second.retry_in(), Some(Duration::from_secs(4)));

    h.clock.advance(Duration::from_secs(4));
    let third = h.coordinator.sync(SyncTrigger::Retry).await;
    assert!(matches!(third, SyncOutcome::LoadFailed { .. }), "{third:?}");
    assert!(h.coordinator.status().stalled);

    h.clock.advance(Duration::from_secs(600));
    let stalled = h.coordinator.sync(SyncTrigger::Periodic).await;
    assert!(matches!(stalled, SyncOutcome::Skipped(SkipReason::Stalled)));

    h.remote.fail_always(None);
    assert!(h.coordinator.sync(SyncTrigger::ForceRefresh).await.is_synced());
    let status = h.coordinator.status();
    assert!(!status.stalled);
    assert_eq!(status.message, None);
}

#[tokio::test]
async fn auth_failure_stops_automatic_retries() {
    let h = harness();
    h.remote.fail_next(InjectedFailure::Auth);

    let outcome = h.coordinator.sync(SyncTrigger::Mount).await;
    assert!(
        matches!(outcome, SyncOutcome::LoadFailed { error: SyncError::Auth(_) }),
        "{outcome:?}"
    );
    let status = h.coordinator.status();
    assert!(status.needs_reauth);
    assert_eq!(status.message.unwrap().kind, MessageKind::Auth);

    h.clock.advance(Duration::from_secs(600));
    let retry = h.coordinator.sync(SyncTrigger::Retry).await;
    assert!(matches!(retry, SyncOutcome::Skipped(SkipReason::NeedsReauth)));
    assert!(h.coordinator.sync(SyncTrigger::ForceRefresh).await.is_synced());
}

#[tokio::test(start_paused = true)]
async fn slow_remote_times_out() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let coordinator = SyncCoordinator::new(
        remote.clone(),
        Arc::new(MemoryKeyValueStore::new()),
        SyncConfig::default(),
    )
    .with_clock(Arc::new(TokioClock::new()));
    coordinator.set_user(Some(UserId::new("ana")));
    remote.set_latency(Duration::from_secs(20));

    let outcome = coordinator.sync(SyncTrigger::Mount).await;
    assert!(
        matches!(outcome, SyncOutcome::Failed { error: SyncError::Timeout, .. }),
        "{outcome:?}"
    );
    assert!(!coordinator.machine().in_flight());
}

// ── Local persistence ────────────────────────────────────────────

#[tokio::test]
async fn sync_result_is_saved_locally() {
    let h = harness();
    h.remote.insert(&h.user, game("from server"));
    h.coordinator.sync(SyncTrigger::Mount).await;

    let store = LocalStore::new(h.kv.clone(), StoreConfig::default(), &h.user);
    let report = store.load();
    assert_eq!(report.source, LoadSource::Primary);
    assert_eq!(report.sessions.len(), 1);
    assert_eq!(report.sessions[0].name, "from server");
}

#[tokio::test]
async fn flush_skips_unchanged_data() {
    let h = harness();
    h.coordinator.add(game("a"));
    assert!(h.coordinator.flush_local("first"));
    assert!(!h.coordinator.flush_local("second"));
}

#[tokio::test]
async fn renamed_session_is_saved() {
    let h = harness();
    let id = h.coordinator.add(game("Friday"));
    assert!(h.coordinator.flush_local("first"));

    let mut renamed = h.coordinator.session(id).unwrap();
    renamed.name = "Saturday".to_string();
    h.coordinator.update(renamed).unwrap();
    assert!(h.coordinator.flush_local("rename"));
    assert!(!h.coordinator.flush_local("again"));

    let store = LocalStore::new(h.kv.clone(), StoreConfig::default(), &h.user);
    assert_eq!(store.load().sessions[0].name, "Saturday");
}

#[tokio::test]
async fn reordered_participants_are_saved() {
    let h = harness();
    let mut session = game("seats");
    session.add_participant("Ana", Timestamp::from_millis(START)).unwrap();
    session.add_participant("Ben", Timestamp::from_millis(START)).unwrap();
    let id = h.coordinator.add(session);
    assert!(h.coordinator.flush_local("first"));

    let mut reordered = h.coordinator.session(id).unwrap();
    reordered.participants.reverse();
    h.coordinator.replace_all(vec![reordered]);
    assert!(h.coordinator.flush_local("reorder"));

    let store = LocalStore::new(h.kv.clone(), StoreConfig::default(), &h.user);
    let names: Vec<String> = store.load().sessions[0]
        .participants
        .iter()
        .map(|p| p.name.clone())
        .collect();
    assert_eq!(names, vec!["Ben".to_string(), "Ana".to_string()]);
}

#[tokio::test]
async fn load_local_populates_empty_list() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let kv = Arc::new(MemoryKeyValueStore::new());
    let first = harness_on(remote.clone(), kv.clone());
    first.coordinator.add(game("persisted"));
    first.coordinator.flush_local("test");

    let h = harness_on(remote, kv);
    let report = h.coordinator.load_local().unwrap();
    assert_eq!(report.source, LoadSource::Primary);
    assert_eq!(h.coordinator.sessions().len(), 1);

    h.coordinator.set_user(None);
    assert!(h.coordinator.load_local().is_none());
}

#[tokio::test]
async fn failed_local_save_sets_storage_message() {
    let h = harness();
    h.coordinator.add(game("unsaved"));
    h.kv.set_fail_writes(true);

    assert!(!h.coordinator.flush_local("test"));
    assert_eq!(h.coordinator.status().message.unwrap().kind, MessageKind::Storage);

    h.kv.set_fail_writes(false);
    assert!(h.coordinator.flush_local("test"));
    assert_eq!(h.coordinator.status().message, None);
}

// ── Completion ───────────────────────────────────────────────────

#[tokio::test]
async fn completing_a_session_settles_it() {
    let h = harness();
    let mut events = h.coordinator.events();
    let at = Timestamp::from_millis(START);

    let mut session = Session::with_id(SessionId::new(), "final table", at);
    session.standard_buy_in = MinorUnits::new(100);
    let ana = session.add_participant("Ana", at).unwrap();
    let ben = session.add_participant("Ben", at).unwrap();
    let cy = session.add_participant("Cy", at).unwrap();
    for pid in [ana, ben, cy] {
        session.standard_buy_in(pid, at).unwrap();
    }
    session.cash_out_stack(ben, at).unwrap();
    session.cash_out(ana, MinorUnits::new(200), session.participants[0].stack, at).unwrap();
    session.cash_out(cy, MinorUnits::ZERO, session.participants[2].stack, at).unwrap();
    let id = h.coordinator.add(session);

    let ended = Timestamp::from_millis(START + 3_600_000);
    let completion = h.coordinator.complete_session(id, ended).unwrap();

    assert!(completion.settlement.warning.is_none());
    assert_eq!(completion.settlement.transfers.len(), 1);
    let transfer = completion.settlement.transfers[0];
    assert_eq!((transfer.from, transfer.to, transfer.amount), (cy, ana, MinorUnits::new(100)));
    assert_eq!(completion.stats.participants, 3);
    assert_eq!(completion.stats.total_contributions, MinorUnits::new(300));
    assert_eq!(completion.stats.total_cash_out, MinorUnits::new(300));
    assert_eq!(completion.stats.residual, MinorUnits::ZERO);
    assert_eq!(completion.stats.duration, Duration::from_secs(3_600));

    let stored = h.coordinator.session(id).unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
    assert_eq!(stored.ended_at, Some(ended));

    let events = drain(&mut events);
    assert!(events.contains(&SyncEvent::SessionCompleted(completion.clone())));

    let saved = LocalStore::new(h.kv.clone(), StoreConfig::default(), &h.user).load();
    assert_eq!(saved.sessions[0].status, SessionStatus::Completed);

    let again = h.coordinator.complete_session(id, ended).unwrap_err();
    assert!(matches!(again, SyncError::Model(_)));
}

#[tokio::test]
async fn unbalanced_session_completes_with_warning() {
    let h = harness();
    let at = Timestamp::from_millis(START);
    let mut session = Session::with_id(SessionId::new(), "miscounted", at);
    let ana = session.add_participant("Ana", at).unwrap();
    let ben = session.add_participant("Ben", at).unwrap();
    session.buy_in(ana, MinorUnits::new(100), Default::default(), at).unwrap();
    session.buy_in(ben, MinorUnits::new(100), Default::default(), at).unwrap();
    session.cash_out(ana, MinorUnits::new(150), Default::default(), at).unwrap();
    let id = h.coordinator.add(session);

    let completion = h.coordinator.complete_session(id, at).unwrap();
    let warning = completion.settlement.warning.unwrap();
    assert_eq!(warning.residual, MinorUnits::new(-50));
    assert_eq!(completion.stats.residual, MinorUnits::new(-50));
}

// ── Status channel ───────────────────────────────────────────────

#[tokio::test]
async fn status_channel_tracks_pending_writes() {
    let h = harness();
    let mut status = h.coordinator.subscribe();
    h.coordinator.add(game("watched"));
    assert!(status.has_changed().unwrap());
    assert_eq!(status.borrow_and_update().pending_writes, 1);

    h.coordinator.sync(SyncTrigger::LocalChange).await;
    assert_eq!(status.borrow_and_update().pending_writes, 0);
}
