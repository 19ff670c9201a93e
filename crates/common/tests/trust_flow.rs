//! Operator to daemon flows: bootstrap, envelopes, roles and audit

mod common;

use std::sync::Arc;

use ::common::audit::{AuditEvent, AuditLog, Outcome};
use ::common::clock::Clock;
use ::common::envelope::{open, seal, EnvelopeError, SecretBundle};
use ::common::error::{Classify, ErrorKind};
use ::common::secrets::SecretStore;
use ::common::trust::{bootstrap, BootstrapError, BootstrapOutcome, Operation, Role};
use chrono::Duration;
use crate::common::{accept, cli_trust, daemon, decline, LocalSource, DAEMON_ADDR};

#[tokio::test]
async fn test_push_bundle_through_bootstrapped_daemon() {
    let daemon = daemon(3);
    let owner = daemon.enroll(Role::Owner, None);
    let (_cli_dir, known) = cli_trust();
    let source = LocalSource(daemon.keys.clone());

    let outcome = bootstrap(DAEMON_ADDR, &source, &accept, Role::Reader, &known).await.unwrap();
    let pinned = outcome.pinned().clone();
    assert_eq!(pinned.fingerprint, daemon.keys.current().fingerprint());

    let bundle = SecretBundle::new("demo").with("DB_PASSWORD", "p@ss");
    let envelope = seal(
        &owner,
        &pinned.key_id,
        &pinned.public_key,
        &bundle.to_bytes().unwrap(),
        daemon.clock.now(),
    )
    .unwrap();

    let opened = open(&envelope, &daemon.keys, &daemon.trust, &daemon.clock, &daemon.guard).unwrap();
    daemon
        .trust
        .authorize(&opened.sender.fingerprint, Operation::PushSecrets)
        .unwrap();

    let store = SecretStore::in_memory(
        ::common::crypto::Secret::generate().unwrap(),
        Arc::new(daemon.clock.clone()),
    );
    SecretBundle::from_bytes(&opened.plaintext)
        .unwrap()
        .apply(&store)
        .unwrap();
    assert_eq!(store.get("demo/DB_PASSWORD").await.unwrap().as_str(), "p@ss");
}

#[test]
fn test_reader_cannot_add_identity_owner_can() {
    let daemon = daemon(3);
    let owner = daemon.enroll(Role::Owner, None);
    let reader = daemon.enroll(Role::Reader, Some(&owner));

    let candidate = ::common::trust::OperatorIdentity::generate().unwrap();
    let err = daemon
        .trust
        .add_identity(
            candidate.add_identity_request(Role::Reader, None),
            Some(&reader.fingerprint()),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let added = daemon
        .trust
        .add_identity(
            candidate.add_identity_request(Role::Deployer, None),
            Some(&owner.fingerprint()),
        )
        .unwrap();
    assert_eq!(added.role, Role::Deployer);

    // deployers push but cannot manage identities
    daemon
        .trust
        .authorize(&added.fingerprint, Operation::PushSecrets)
        .unwrap();
    assert_eq!(
        daemon
            .trust
            .authorize(&added.fingerprint, Operation::RevokeIdentity)
            .unwrap_err()
            .kind(),
        ErrorKind::Forbidden
    );
}

#[tokio::test]
async fn test_tofu_mismatch_fails_closed() {
    let honest = daemon(3);
    let impostor = daemon(3);
    let (_cli_dir, known) = cli_trust();

    bootstrap(DAEMON_ADDR, &LocalSource(honest.keys.clone()), &accept, Role::Reader, &known)
        .await
        .unwrap();

    let err = bootstrap(DAEMON_ADDR, &LocalSource(impostor.keys.clone()), &accept, Role::Reader, &known)
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::KeyMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
    assert_eq!(
        known.pinned(DAEMON_ADDR).unwrap().fingerprint,
        honest.keys.current().fingerprint()
    );

    // declining a new address pins nothing
    let (_other_dir, fresh) = cli_trust();
    assert!(matches!(
        bootstrap(DAEMON_ADDR, &LocalSource(honest.keys.clone()), &decline, Role::Reader, &fresh).await,
        Err(BootstrapError::Declined(_))
    ));
    assert!(fresh.pins().is_empty());
}

#[tokio::test]
async fn test_cli_follows_rotation_and_old_envelopes_still_open() {
    let daemon = daemon(2);
    let owner = daemon.enroll(Role::Owner, None);
    let (_cli_dir, known) = cli_trust();
    let source = LocalSource(daemon.keys.clone());

    let pinned = bootstrap(DAEMON_ADDR, &source, &accept, Role::Reader, &known)
        .await
        .unwrap()
        .pinned()
        .clone();
    let in_flight = seal(&owner, &pinned.key_id, &pinned.public_key, b"in flight", daemon.clock.now()).unwrap();

    daemon.keys.rotate().unwrap();

    // sealed before the rotation, still retained
    let opened = open(&in_flight, &daemon.keys, &daemon.trust, &daemon.clock, &daemon.guard).unwrap();
    assert_eq!(&opened.plaintext[..], b"in flight");

    let outcome = bootstrap(DAEMON_ADDR, &source, &decline, Role::Reader, &known).await.unwrap();
    assert!(matches!(outcome, BootstrapOutcome::Rotated { .. }));
    assert_eq!(outcome.pinned().key_id, daemon.keys.current().key_id());

    daemon.keys.rotate().unwrap();
    daemon.keys.rotate().unwrap();
    let stale = seal(&owner, &pinned.key_id, &pinned.public_key, b"too late", daemon.clock.now()).unwrap();
    let err = open(&stale, &daemon.keys, &daemon.trust, &daemon.clock, &daemon.guard).unwrap_err();
    assert!(matches!(err, EnvelopeError::Recipient(_)));
    assert_eq!(err.kind(), ErrorKind::KeyEvicted);
}

#[test]
fn test_replayed_envelope_is_denied_and_audited() {
    let daemon = daemon(3);
    let owner = daemon.enroll(Role::Owner, None);
    let audit = AuditLog::open(
        daemon.dir.path().join("audit.log"),
        daemon.keys.clone(),
        Arc::new(daemon.clock.clone()),
    )
    .unwrap();
    let current = daemon.keys.current();
    let envelope = seal(&owner, current.key_id(), &current.public_key(), b"once", daemon.clock.now()).unwrap();

    open(&envelope, &daemon.keys, &daemon.trust, &daemon.clock, &daemon.guard).unwrap();
    audit
        .append(AuditEvent::new("push_secrets", Outcome::Success).actor(owner.fingerprint()))
        .unwrap();

    let err = open(&envelope, &daemon.keys, &daemon.trust, &daemon.clock, &daemon.guard).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReplayDetected);
    assert!(err.kind().is_security_relevant());
    audit.append(AuditEvent::denied("push_secrets", &err)).unwrap();

    daemon.clock.advance(Duration::seconds(31));
    let fresh_guard = ::common::envelope::ReplayGuard::default();
    let err = open(&envelope, &daemon.keys, &daemon.trust, &daemon.clock, &fresh_guard).unwrap_err();
    assert!(matches!(err, EnvelopeError::Expired(_)));

    let entries = audit.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].record.event.outcome, Outcome::Denied);
    for entry in &entries {
        audit.verify(entry).unwrap();
    }
}
