mod common;

use cdr_core::{
    CdrService, CoreConfig, DiagnosisSystem, GcReport, IngestOutcome, LocalZone, SqliteStore,
};
use chrono::FixedOffset;
use common::{mrn, request, service, Problem, ACTIVE, INACTIVE};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn persistent(path: PathBuf) -> Arc<CoreConfig> {
    let zone = LocalZone::Fixed(FixedOffset::west_opt(7 * 3600).expect("offset"));
    Arc::new(CoreConfig::new(zone, Some(path), 2, Duration::from_secs(30)).expect("config"))
}

fn two_patients(service: &CdrService) {
    service
        .ingest(
            &mrn("abc123"),
            request(
                "2019-01-01T00:00:00Z",
                Some(&[
                    Problem::new("66344007").icd9("296.30").icd10("F33.9"),
                    Problem::new("35489007").icd9("311"),
                    Problem::new("195967001").icd9("493.90").status(Some(INACTIVE)),
                ]),
            ),
        )
        .expect("abc123");
    service
        .ingest(
            &mrn("xyz789"),
            request("2019-01-01T00:00:00Z", Some(&[Problem::new("35489007").icd9("311")])),
        )
        .expect("xyz789");
}

#[test]
fn gc_preview_then_collect() {
    let service = service();
    two_patients(&service);
    assert!(service.remove_document(&mrn("abc123")).expect("remove"));
    assert!(!service.remove_document(&mrn("abc123")).expect("remove again"));

    let preview = service.collect_garbage(true, None).expect("preview");
    assert_eq!(
        preview,
        GcReport {
            observations_purged: 3,
            statuses_purged: 1,
            preview: true,
            interrupted: false,
        }
    );
    assert_eq!(service.store().counts().expect("counts").observations, 4);

    let run = service.collect_garbage(false, None).expect("collect");
    assert_eq!(run.observations_purged, 3);
    assert_eq!(run.statuses_purged, 1);

    let counts = service.store().counts().expect("counts");
    assert_eq!(counts.observations, 1);
    assert_eq!(counts.statuses, 1);

    let again = service.collect_garbage(false, None).expect("second pass");
    assert_eq!(again.observations_purged, 0);
    assert_eq!(again.statuses_purged, 0);

    let survivor = service
        .problem_list(&mrn("xyz789"), None)
        .expect("query")
        .expect("xyz789");
    assert_eq!(survivor.problem_list.len(), 1);
    assert_eq!(
        service
            .diagnosis_patients(DiagnosisSystem::Icd9, "311")
            .expect("diagnosis")
            .patients,
        vec![mrn("xyz789")]
    );
}

#[test]
fn cancelled_gc_reports_interrupted() {
    let service = service();
    two_patients(&service);
    service.remove_document(&mrn("abc123")).expect("remove");

    let cancel = AtomicBool::new(true);
    let report = service
        .collect_garbage(false, Some(&cancel))
        .expect("collect");
    assert!(report.interrupted);
    // cancellation is checked after the first batch, which covers every row here
    assert_eq!(report.statuses_purged, 0);
}

#[test]
fn snapshot_survives_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("cdr.json");
    let cfg = persistent(path.clone());

    {
        let service = CdrService::open(cfg.clone()).expect("open empty");
        two_patients(&service);
        service.remove_document(&mrn("abc123")).expect("remove");
    }
    assert!(path.exists());

    let service = CdrService::open(cfg.clone()).expect("reopen");
    assert!(service.file_info(&mrn("abc123")).expect("info").is_none());
    let info = service
        .file_info(&mrn("xyz789"))
        .expect("info")
        .expect("xyz789");
    assert_eq!(info.filepath, "/archive/2019-01-01T00:00:00Z.xml");

    // orphans were persisted too, and the small batch size walks them in several batches
    let report = service.collect_garbage(false, None).expect("collect");
    assert_eq!(report.observations_purged, 3);
    assert_eq!(report.statuses_purged, 1);

    let outcome = service
        .ingest(&mrn("xyz789"), request("2018-01-01T00:00:00Z", Some(&[Problem::new("1")])))
        .expect("older");
    assert_eq!(outcome, IngestOutcome::Obsolete);

    drop(service);
    let service = CdrService::open(cfg).expect("reopen after gc");
    assert_eq!(service.store().counts().expect("counts").observations, 1);
}

#[test]
fn failed_snapshot_write_keeps_the_accepted_document() {
    let dir = TempDir::new().expect("tempdir");
    let blocker = dir.path().join("blocker");
    let cfg = persistent(blocker.join("cdr.json"));
    let service = CdrService::open(cfg.clone()).expect("open empty");

    // the data directory cannot be created while a plain file holds its name
    fs::write(&blocker, b"").expect("block data dir");
    let outcome = service
        .ingest(
            &mrn("abc123"),
            request("2019-01-01T00:00:00Z", Some(&[Problem::new("35489007").icd9("311")])),
        )
        .expect("committed ingestion is reported as accepted");
    assert_eq!(
        outcome,
        IngestOutcome::Accepted {
            observations: 1,
            replaced: 0,
        }
    );
    assert!(service.file_info(&mrn("abc123")).expect("info").is_some());

    fs::remove_file(&blocker).expect("unblock");
    service
        .ingest(
            &mrn("xyz789"),
            request("2019-01-01T00:00:00Z", Some(&[Problem::new("1")])),
        )
        .expect("xyz789");
    drop(service);

    let service = CdrService::open(cfg).expect("reopen");
    assert!(service.file_info(&mrn("abc123")).expect("info").is_some());
    assert!(service.file_info(&mrn("xyz789")).expect("info").is_some());
    assert_eq!(service.store().counts().expect("counts").observations, 2);
}

/// Four patients re-ingest newer documents while a collector loops over the same store.
fn gc_alongside_replacing_ingestions(service: CdrService) {
    const PATIENTS: usize = 4;
    const ROUNDS: i32 = 150;

    let done = AtomicBool::new(false);

    let (ingested, gc_runs) = thread::scope(|scope| {
        let gc = scope.spawn(|| {
            let mut runs = 0usize;
            loop {
                service.collect_garbage(false, None).expect("gc run");
                runs += 1;
                if done.load(Ordering::Acquire) {
                    return runs;
                }
            }
        });

        let ingesters: Vec<_> = (0..PATIENTS)
            .map(|patient| {
                let service = &service;
                scope.spawn(move || {
                    let mrn = mrn(&format!("pt{patient}"));
                    for round in 0..ROUNDS {
                        // alternating status values leave one status orphaned after each swap
                        let status = if round % 2 == 0 { ACTIVE } else { INACTIVE };
                        let generated = format!("{}-01-01T00:00:00Z", 2000 + round);
                        let problems = [Problem::new("35489007").icd9("311").status(Some(status))];
                        let outcome = service
                            .ingest(&mrn, request(&generated, Some(&problems)))
                            .expect("ingest");
                        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
                    }
                })
            })
            .collect();

        let ingested: Vec<_> = ingesters.into_iter().map(|h| h.join()).collect();
        done.store(true, Ordering::Release);
        (ingested, gc.join())
    });

    assert!(ingested.iter().all(Result::is_ok), "an ingestion failed");
    assert!(gc_runs.expect("gc thread") > 0);

    let newest = format!("/archive/{}-01-01T00:00:00Z.xml", 2000 + ROUNDS - 1);
    for patient in 0..PATIENTS {
        let mrn = mrn(&format!("pt{patient}"));
        let info = service.file_info(&mrn).expect("info").expect("document");
        assert_eq!(info.filepath, newest);
        let list = service
            .problem_list(&mrn, None)
            .expect("query")
            .expect("problem list");
        assert_eq!(list.problem_list.len(), 1);
    }

    service.collect_garbage(false, None).expect("final gc");
    let counts = service.store().counts().expect("counts");
    assert_eq!(counts.observations, PATIENTS);
    assert_eq!(counts.statuses, 1);
}

#[test]
fn gc_runs_alongside_replacing_ingestions() {
    gc_alongside_replacing_ingestions(service());
}

#[test]
fn gc_runs_alongside_replacing_ingestions_on_sqlite() {
    let zone = LocalZone::Fixed(FixedOffset::west_opt(7 * 3600).expect("offset"));
    gc_alongside_replacing_ingestions(CdrService::new(
        Arc::new(CoreConfig::in_memory(zone)),
        Arc::new(SqliteStore::open_in_memory().expect("sqlite")),
    ));
}

#[test]
fn sqlite_data_file_survives_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("cdr.db");
    let cfg = persistent(path.clone());

    {
        let service = CdrService::open(cfg.clone()).expect("open empty");
        two_patients(&service);
        service.remove_document(&mrn("abc123")).expect("remove");
    }
    assert!(path.exists());

    let service = CdrService::open(cfg.clone()).expect("reopen");
    assert!(service.file_info(&mrn("abc123")).expect("info").is_none());
    let list = service
        .problem_list(&mrn("xyz789"), None)
        .expect("query")
        .expect("xyz789");
    assert_eq!(list.problem_list.len(), 1);

    let report = service.collect_garbage(false, None).expect("collect");
    assert_eq!(report.observations_purged, 3);
    assert_eq!(report.statuses_purged, 1);
    assert_eq!(
        service
            .ingest(&mrn("xyz789"), request("2018-01-01T00:00:00Z", Some(&[Problem::new("1")])))
            .expect("older"),
        IngestOutcome::Obsolete
    );

    drop(service);
    let service = CdrService::open(cfg).expect("reopen after gc");
    let counts = service.store().counts().expect("counts");
    assert_eq!(counts.documents, 1);
    assert_eq!(counts.observations, 1);
}
