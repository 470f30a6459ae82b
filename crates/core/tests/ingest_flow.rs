mod common;

use cdr_core::{CdrError, DiagnosisSystem, IngestOutcome, ProblemFilter};
use common::{mrn, request, service, Problem, ACTIVE, INACTIVE};

fn depression_list() -> Vec<Problem> {
    vec![
        Problem::new("66344007").icd9("296.30").icd10("F33.9"),
        Problem::new("35489007").icd9("311").icd10("F32.9"),
        Problem::new("55822004").icd9("272.4").icd10("E78.5"),
        Problem::new("160245001").status(None),
        Problem::new("195967001").icd9("493.90").status(Some(INACTIVE)),
    ]
}

#[test]
fn new_patient_keeps_only_observations_with_status() {
    let service = service();
    let outcome = service
        .ingest(
            &mrn("abc123"),
            request("2019-11-15T00:00:00Z", Some(&depression_list())),
        )
        .expect("ingest");
    assert_eq!(
        outcome,
        IngestOutcome::Accepted {
            observations: 4,
            replaced: 0
        }
    );

    let list = service
        .problem_list(&mrn("abc123"), None)
        .expect("query")
        .expect("document exists");
    assert_eq!(list.problem_list.len(), 4);
    let first = &list.problem_list[0];
    assert_eq!(first.icd9.as_ref().map(|c| c.code.as_str()), Some("296.30"));
    assert_eq!(first.status.status_code, "completed");
    assert_eq!(
        first.status.value.as_ref().map(|c| c.display.as_str()),
        Some("Active")
    );
    assert_eq!(first.entry_date.to_rfc3339(), "2015-03-02T17:15:00+00:00");
    assert_eq!(
        first.onset_date.map(|d| d.to_rfc3339()),
        Some("2014-01-01T07:00:00+00:00".to_string())
    );
}

#[test]
fn older_or_equal_document_is_obsolete_and_changes_nothing() {
    let service = service();
    let patient = mrn("abc123");
    service
        .ingest(&patient, request("2019-11-15T00:00:00Z", Some(&depression_list())))
        .expect("first");
    let before = service.store().counts().expect("counts");
    let info_before = service.file_info(&patient).expect("info");

    for generated in ["2018-01-01T00:00:00Z", "2019-11-15T00:00:00Z"] {
        let outcome = service
            .ingest(
                &patient,
                request(generated, Some(&[Problem::new("38341003").icd9("401.9")])),
            )
            .expect("ingest");
        assert_eq!(outcome, IngestOutcome::Obsolete);
    }

    assert_eq!(service.store().counts().expect("counts"), before);
    assert_eq!(service.file_info(&patient).expect("info"), info_before);
}

#[test]
fn newer_document_replaces_only_its_own_observations() {
    let service = service();
    service
        .ingest(&mrn("abc123"), request("2019-01-01T00:00:00Z", Some(&depression_list())))
        .expect("abc123");
    service
        .ingest(
            &mrn("xyz789"),
            request("2019-01-01T00:00:00Z", Some(&[Problem::new("38341003").icd9("401.9")])),
        )
        .expect("xyz789");

    let outcome = service
        .ingest(
            &mrn("abc123"),
            request("2020-01-01T00:00:00Z", Some(&[Problem::new("73211009").icd9("250.00")])),
        )
        .expect("replacement");
    assert_eq!(
        outcome,
        IngestOutcome::Accepted {
            observations: 1,
            replaced: 4
        }
    );

    let abc = service
        .problem_list(&mrn("abc123"), None)
        .expect("query")
        .expect("abc123");
    assert_eq!(abc.problem_list.len(), 1);
    assert_eq!(
        abc.problem_list[0].icd9.as_ref().map(|c| c.code.as_str()),
        Some("250.00")
    );

    let xyz = service
        .problem_list(&mrn("xyz789"), None)
        .expect("query")
        .expect("xyz789");
    assert_eq!(xyz.problem_list.len(), 1);
}

#[test]
fn missing_problem_list_is_accepted_with_no_observations() {
    let service = service();
    let outcome = service
        .ingest(&mrn("abc123"), request("2019-11-15T00:00:00Z", None))
        .expect("ingest");
    assert_eq!(
        outcome,
        IngestOutcome::Accepted {
            observations: 0,
            replaced: 0
        }
    );
    let info = service
        .file_info(&mrn("abc123"))
        .expect("info")
        .expect("document");
    assert_eq!(info.filepath, "/archive/2019-11-15T00:00:00Z.xml");
}

#[test]
fn empty_problem_list_mapping_is_treated_as_missing() {
    let service = service();
    let patient = mrn("abc123");
    service
        .ingest(&patient, request("2019-01-01T00:00:00Z", Some(&depression_list())))
        .expect("first");

    let mut req = request("2020-01-01T00:00:00Z", None);
    req.problem_list = Some(serde_json::json!({}));
    let outcome = service.ingest(&patient, req).expect("empty mapping");
    assert_eq!(
        outcome,
        IngestOutcome::Accepted {
            observations: 0,
            replaced: 4
        }
    );
    let list = service
        .problem_list(&patient, None)
        .expect("query")
        .expect("document");
    assert!(list.problem_list.is_empty());
}

#[test]
fn parse_failure_commits_no_document_state() {
    let service = service();
    let patient = mrn("abc123");
    service
        .ingest(&patient, request("2019-01-01T00:00:00Z", Some(&depression_list())))
        .expect("first");

    let duplicate_icd9 = {
        let mut req = request("2020-01-01T00:00:00Z", Some(&[Problem::new("38341003").icd9("401.9")]));
        let payload = req.problem_list.as_mut().expect("payload");
        let translations = &mut payload["section"]["entry"][0]["act"]["_"]["entryRelationship"]["_"]
            ["observation"]["_"]["value"]["_"]["translation"];
        let copy = translations[0].clone();
        translations
            .as_array_mut()
            .expect("translation list")
            .push(copy);
        req
    };

    let err = service
        .ingest(&patient, duplicate_icd9)
        .expect_err("duplicate translation");
    assert!(matches!(err, CdrError::DuplicateTranslation(_)));
    assert!(err.is_client_error());

    let info = service.file_info(&patient).expect("info").expect("document");
    assert_eq!(info.filepath, "/archive/2019-01-01T00:00:00Z.xml");
    let list = service
        .problem_list(&patient, None)
        .expect("query")
        .expect("document");
    assert_eq!(list.problem_list.len(), 4);
}

#[test]
fn wrong_section_title_is_rejected() {
    let service = service();
    let mut req = request("2019-01-01T00:00:00Z", Some(&depression_list()));
    req.problem_list.as_mut().expect("payload")["section"]["code"]["_displayName"] =
        serde_json::json!("Medications");
    let err = service
        .ingest(&mrn("abc123"), req)
        .expect_err("wrong section");
    assert!(matches!(err, CdrError::SchemaMismatch(_)));
    assert!(service.file_info(&mrn("abc123")).expect("info").is_none());
}

#[test]
fn filtered_problem_list() {
    let service = service();
    service
        .ingest(
            &mrn("abc123"),
            request(
                "2019-11-15T00:00:00Z",
                Some(&[
                    Problem::new("66344007").icd9("296.30").icd10("F33.9"),
                    Problem::new("35489007").icd9("311").icd10("F32.9"),
                    Problem::new("55822004").icd9("272.4").icd10("E78.5"),
                    Problem::new("192080009").icd9("300.40"),
                    Problem::new("371631005").icd9("300.4").status(Some(INACTIVE)),
                    Problem::new("38341003").icd9("401.9"),
                ]),
            ),
        )
        .expect("ingest");

    let filter = ProblemFilter::from_json_str(&format!(
        r#"{{
            "filter": {{
                "icd9": {{"code": ["133.0", "296.2*", "296.3*", "300.4", "311.*"]}},
                "icd10": {{"code": ["E78.*", "H21.239"]}}
            }},
            "status": {{"value": {{"code": "{ACTIVE}", "code_system": "2.16.840.1.113883.6.96"}}}}
        }}"#
    ))
    .expect("filter");

    let list = service
        .problem_list(&mrn("abc123"), Some(&filter))
        .expect("query")
        .expect("document");
    let icd9: Vec<_> = list
        .problem_list
        .iter()
        .filter_map(|o| o.icd9.as_ref().map(|c| c.code.as_str()))
        .collect();
    assert_eq!(icd9, vec!["296.30", "272.4"]);
    for problem in &list.problem_list {
        assert_eq!(
            problem.status.value.as_ref().map(|v| v.display.as_str()),
            Some("Active")
        );
    }
}

#[test]
fn codes_and_diagnosis_queries() {
    let service = service();
    service
        .ingest(&mrn("abc123"), request("2019-01-01T00:00:00Z", Some(&depression_list())))
        .expect("abc123");
    service
        .ingest(
            &mrn("xyz789"),
            request("2019-01-01T00:00:00Z", Some(&[Problem::new("35489007").icd9("311")])),
        )
        .expect("xyz789");

    let icd9 = service.codes(DiagnosisSystem::Icd9).expect("icd9 codes");
    let codes: Vec<_> = icd9.codes.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes, vec!["272.4", "296.30", "311", "493.90"]);
    assert!(icd9
        .codes
        .iter()
        .all(|c| c.code_system_name == "ICD-9-CM"));

    let icd10 = service.codes(DiagnosisSystem::Icd10).expect("icd10 codes");
    assert_eq!(icd10.codes.len(), 3);

    let exact = service
        .diagnosis_patients(DiagnosisSystem::Icd9, "311")
        .expect("diagnosis");
    assert_eq!(exact.patients, vec![mrn("abc123"), mrn("xyz789")]);

    let prefix = service
        .diagnosis_patients(DiagnosisSystem::Icd9, "296.*")
        .expect("diagnosis");
    assert_eq!(prefix.patients, vec![mrn("abc123")]);

    let none = service
        .diagnosis_patients(DiagnosisSystem::Icd10, "Z99.*")
        .expect("diagnosis");
    assert!(none.patients.is_empty());
}

#[test]
fn canonical_rows_are_shared_across_patients() {
    let service = service();
    for patient in ["p1", "p2", "p3"] {
        service
            .ingest(&mrn(patient), request("2019-01-01T00:00:00Z", Some(&depression_list())))
            .expect("ingest");
    }
    let counts = service.store().counts().expect("counts");
    assert_eq!(counts.observations, 12);
    // 2 statuses (active/inactive), shared by every patient
    assert_eq!(counts.statuses, 2);
}

#[test]
fn concurrent_ingestion_keeps_newest_generation() {
    let service = service();
    let patient = mrn("abc123");
    let years = [2015, 2019, 2017, 2016, 2018];

    std::thread::scope(|scope| {
        for year in years {
            let service = &service;
            let patient = &patient;
            scope.spawn(move || {
                let problems = [Problem::new("38341003").icd9("401.9")];
                service
                    .ingest(patient, request(&format!("{year}-06-01T00:00:00Z"), Some(&problems)))
                    .expect("ingest");
            });
        }
    });

    let info = service
        .file_info(&patient)
        .expect("info")
        .expect("document");
    assert_eq!(info.filepath, "/archive/2019-06-01T00:00:00Z.xml");
    let list = service
        .problem_list(&patient, None)
        .expect("query")
        .expect("document");
    assert_eq!(list.problem_list.len(), 1);
}
