//! Requests sent through a running service loop

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use personadb_core::{
    CheckMode, DeleteConfirmation, JsonWebKey, LinkedProfileDetails, PersonaDbConfig, PersonaEvent,
    PersonaIdentifier, PersonaRecord, PersonaRequest, PersonaResponse, PersonaService,
    ProfileIdentifier,
};
use tempfile::TempDir;
use tokio::time::timeout;

fn open_service() -> (PersonaService, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let service = PersonaService::open(&PersonaDbConfig::in_dir(temp_dir.path())).unwrap();
    (service, temp_dir)
}

fn persona(seed: u8) -> PersonaRecord {
    let key = JsonWebKey::ec_public(
        "P-256",
        URL_SAFE_NO_PAD.encode([seed; 32]),
        URL_SAFE_NO_PAD.encode([seed.wrapping_mul(3); 32]),
    );
    PersonaRecord::new(PersonaIdentifier::from_public_key(&key).unwrap(), key)
}

#[tokio::test]
async fn test_link_through_handle() {
    let (service, _dir) = open_service();
    let mut events = service.bus().subscribe();
    let (handle, task) = service.spawn();

    let p = persona(1);
    let profile = ProfileIdentifier::new("facebook.com", "alice").unwrap();

    let created = handle
        .call(PersonaRequest::CreatePersona { record: p.clone() })
        .await
        .unwrap();
    assert_eq!(created, PersonaResponse::Done);

    let attached = handle
        .call(PersonaRequest::AttachProfile {
            profile: profile.clone(),
            persona: p.identifier.clone(),
            details: LinkedProfileDetails::default(),
        })
        .await
        .unwrap();
    assert_eq!(attached, PersonaResponse::Done);

    match handle
        .call(PersonaRequest::QueryPersonaByProfile { profile })
        .await
        .unwrap()
    {
        PersonaResponse::Persona(Some(owner)) => assert_eq!(owner.identifier, p.identifier),
        other => panic!("unexpected response {:?}", other),
    }

    // The loop runs a dispatcher, so events reach broadcast subscribers
    let first = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, PersonaEvent::PersonaCreated);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_handles_are_shared_between_tasks() {
    let (service, _dir) = open_service();
    let (handle, task) = service.with_queue_capacity(2).spawn();

    let mut joins = Vec::new();
    for seed in 1..=6u8 {
        let handle = handle.clone();
        joins.push(tokio::spawn(async move {
            handle
                .call(PersonaRequest::CreatePersona {
                    record: persona(seed),
                })
                .await
        }));
    }
    for join in joins {
        assert_eq!(join.await.unwrap().unwrap(), PersonaResponse::Done);
    }

    match handle.call(PersonaRequest::QueryPersonas).await.unwrap() {
        PersonaResponse::Personas(all) => assert_eq!(all.len(), 6),
        other => panic!("unexpected response {:?}", other),
    }

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_errors_come_back_as_responses() {
    let (service, _dir) = open_service();
    let p = persona(7);
    service.create_persona(p.clone()).await.unwrap();

    let again = service
        .handle(PersonaRequest::CreatePersona { record: p.clone() })
        .await;
    assert!(again.is_error());

    let deleted = service
        .handle(PersonaRequest::DeletePersona {
            identifier: p.identifier.clone(),
            confirmation: DeleteConfirmation::DontDeleteIfHasPrivateKey,
        })
        .await;
    assert_eq!(deleted, PersonaResponse::Done);
    assert!(service.query_persona(&p.identifier).await.unwrap().is_none());
}

#[tokio::test]
async fn test_json_round_trip_of_a_consistency_check() {
    let (service, _dir) = open_service();

    let reply = service
        .handle_json(r#"{"method":"check_consistency","params":{"mode":"fix"}}"#)
        .await;
    let response: PersonaResponse = serde_json::from_str(&reply).unwrap();
    match response {
        PersonaResponse::Report(report) => assert!(report.is_clean()),
        other => panic!("unexpected response {:?}", other),
    }

    let report = service.check_consistency(CheckMode::Throw).await.unwrap();
    assert!(report.is_clean());
}
