//! Integration-Tests: mehrere Clients gegen einen gemeinsamen In-Memory-Schluesselserver

use std::collections::BTreeSet;
use std::sync::Arc;

use fluester_core::{ConversationId, MessageId, UserId};
use fluester_crypto::{
    derive_dm_key, envelope, Anzeige, CryptoError, E2eeClient, E2eeConfig,
    EingehendeNachricht, Envelope, InMemoryKeyServer, KeyPair, MemoryKeyStore, Nachrichteninhalt,
    SymmetricKey, VersuchStatus, WrappedKeyBlob, Ziel,
};

async fn client(server: &Arc<InMemoryKeyServer>) -> E2eeClient {
    E2eeClient::anmelden(
        UserId::new(),
        server.clone(),
        Arc::new(MemoryKeyStore::new()),
        E2eeConfig {
            rotation_backoff_ms: 1,
            ..E2eeConfig::default()
        },
    )
    .await
    .expect("Anmeldung fehlgeschlagen")
}

fn envelope_aus(text: &str) -> Envelope {
    match Nachrichteninhalt::from_text(text) {
        Nachrichteninhalt::Verschluesselt(env) => env,
        anderes => panic!("Envelope erwartet, bekommen: {anderes:?}"),
    }
}

fn gruppen_nachricht(
    von: &E2eeClient,
    conversation_id: ConversationId,
    key_version: u32,
    text: String,
) -> EingehendeNachricht {
    EingehendeNachricht {
        message_id: MessageId::new(),
        conversation_id,
        sender: von.user_id(),
        ziel: Ziel::Gruppe {
            conversation_id,
            key_version,
        },
        text,
    }
}

async fn senden(von: &E2eeClient, conversation_id: ConversationId, version: u32, text: &str) -> String {
    let ausgehend = von
        .ausgehend(
            &Ziel::Gruppe {
                conversation_id,
                key_version: version,
            },
            text,
        )
        .await
        .expect("Senden fehlgeschlagen");
    assert!(ausgehend.verschluesselt);
    ausgehend.text
}

// ---------------------------------------------------------------------------
// Grundeigenschaften
// ---------------------------------------------------------------------------

#[test]
fn round_trip_mit_beliebigem_schluessel() {
    let key = SymmetricKey::generate();
    for klartext in [&b""[..], b"hallo", &[0u8; 4096][..]] {
        let env = envelope::seal(klartext, &key, &Default::default()).unwrap();
        assert_eq!(envelope::open(&env, &key).unwrap(), klartext);
    }
}

#[test]
fn dm_schluessel_ist_symmetrisch() {
    for _ in 0..8 {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = derive_dm_key(&a, &b.public_key).unwrap();
        let ba = derive_dm_key(&b, &a.public_key).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }
}

// ---------------------------------------------------------------------------
// Szenario: DM ohne zusaetzliche Netzwerk-Anfragen
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dm_hallo_ohne_netzwerk_beim_empfaenger() {
    let server = Arc::new(InMemoryKeyServer::new());
    let alice = client(&server).await;
    let bob = client(&server).await;

    let ausgehend = alice
        .ausgehend(&Ziel::Dm { peer: bob.user_id() }, "hello")
        .await
        .unwrap();
    assert!(ausgehend.verschluesselt);
    assert!(!ausgehend.text.contains("hello"));

    let anfragen_vorher = server.anfragen();
    let nachricht = EingehendeNachricht {
        message_id: MessageId::new(),
        conversation_id: ConversationId::new(),
        sender: alice.user_id(),
        ziel: Ziel::Dm {
            peer: alice.user_id(),
        },
        text: ausgehend.text.clone(),
    };
    assert_eq!(
        bob.nachricht_lesen(&nachricht).await,
        Anzeige::Text("hello".into())
    );
    assert_eq!(server.anfragen(), anfragen_vorher);
}

#[tokio::test]
async fn dm_nach_rotation_des_empfaengers() {
    let server = Arc::new(InMemoryKeyServer::new());
    let alice = client(&server).await;
    let bob = client(&server).await;

    let alt = alice
        .ausgehend(&Ziel::Dm { peer: bob.user_id() }, "vorher")
        .await
        .unwrap();
    bob.rotate_identity().await.unwrap();

    // Alice verschluesselt mit dem noch gecachten alten Schluessel
    let neu = alice
        .ausgehend(&Ziel::Dm { peer: bob.user_id() }, "nachher")
        .await
        .unwrap();

    for (text, erwartet) in [(alt.text, "vorher"), (neu.text, "nachher")] {
        let nachricht = EingehendeNachricht {
            message_id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender: alice.user_id(),
            ziel: Ziel::Dm {
                peer: alice.user_id(),
            },
            text,
        };
        assert_eq!(
            bob.nachricht_lesen(&nachricht).await,
            Anzeige::Text(erwartet.into())
        );
    }
}

// ---------------------------------------------------------------------------
// Szenario: Gruppe mit drei Mitgliedern, C wird entfernt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn entferntes_mitglied_verliert_zukuenftigen_zugriff() {
    let server = Arc::new(InMemoryKeyServer::new());
    let a = client(&server).await;
    let b = client(&server).await;
    let c = client(&server).await;

    let gruppe = a
        .gruppe_erstellen(BTreeSet::from([b.user_id(), c.user_id()]))
        .await
        .unwrap();
    assert_eq!(gruppe.key_version, 1);
    let conv = gruppe.id;

    let text_v1 = senden(&a, conv, 1, "vor der rotation").await;
    let gruppe = a.mitglied_entfernen(conv, c.user_id()).await.unwrap();
    assert_eq!(gruppe.key_version, 2);
    assert!(!gruppe.ist_mitglied(c.user_id()));
    let text_v2 = senden(&a, conv, 2, "nach der rotation").await;

    // C: Epoch 2 bleibt verschlossen
    let env_v2 = envelope_aus(&text_v2);
    assert!(matches!(
        c.gruppen().decrypt_message(conv, 2, &env_v2).await,
        Err(CryptoError::DecryptionUnresolved { .. })
    ));
    assert_eq!(
        c.nachricht_lesen(&gruppen_nachricht(&a, conv, 2, text_v2.clone()))
            .await,
        Anzeige::Platzhalter
    );
    assert!(server.snapshot(conv).unwrap().wrap_fuer(2, c.user_id()).is_none());

    // A und B: beide Epochen lesbar
    for leser in [&a, &b] {
        assert_eq!(
            leser
                .nachricht_lesen(&gruppen_nachricht(&a, conv, 1, text_v1.clone()))
                .await,
            Anzeige::Text("vor der rotation".into())
        );
        assert_eq!(
            leser
                .nachricht_lesen(&gruppen_nachricht(&a, conv, 2, text_v2.clone()))
                .await,
            Anzeige::Text("nach der rotation".into())
        );
    }
}

#[tokio::test]
async fn rotation_erhaelt_historie_und_trennt_epochen() {
    let server = Arc::new(InMemoryKeyServer::new());
    let a = client(&server).await;
    let b = client(&server).await;
    let x = client(&server).await;

    let conv = a
        .gruppe_erstellen(BTreeSet::from([b.user_id(), x.user_id()]))
        .await
        .unwrap()
        .id;
    let env_v1 = envelope_aus(&senden(&a, conv, 1, "epoch eins").await);
    a.mitglied_entfernen(conv, x.user_id()).await.unwrap();

    // X hielt Epoch 1 und kann sie weiterhin lesen
    assert_eq!(
        x.gruppen().decrypt_message(conv, 1, &env_v1).await.unwrap(),
        b"epoch eins"
    );

    // Der Schluessel von Epoch 2 oeffnet Epoch 1 nicht
    let v2 = b.gruppen().ensure_group_key(conv, 2).await.unwrap();
    assert!(envelope::open(&env_v1, &v2.key).is_err());
}

#[tokio::test]
async fn neues_mitglied_erhaelt_alle_epochen() {
    let server = Arc::new(InMemoryKeyServer::new());
    let a = client(&server).await;
    let b = client(&server).await;
    let c = client(&server).await;
    let y = client(&server).await;

    let conv = a
        .gruppe_erstellen(BTreeSet::from([b.user_id(), c.user_id()]))
        .await
        .unwrap()
        .id;
    let text_v1 = senden(&a, conv, 1, "alt").await;
    a.mitglied_entfernen(conv, c.user_id()).await.unwrap();
    a.mitglied_entfernen(conv, b.user_id()).await.unwrap();

    let gruppe = a.mitglied_hinzufuegen(conv, y.user_id()).await.unwrap();
    assert_eq!(gruppe.key_version, 3);
    for version in 1..=3 {
        assert!(
            gruppe.wrap_fuer(version, y.user_id()).is_some(),
            "Wrap fuer Version {version} fehlt"
        );
    }
    assert_eq!(
        y.nachricht_lesen(&gruppen_nachricht(&a, conv, 1, text_v1))
            .await,
        Anzeige::Text("alt".into())
    );
}

#[tokio::test]
async fn eingewickelte_schluessel_bleiben_unveraendert() {
    let server = Arc::new(InMemoryKeyServer::new());
    let a = client(&server).await;
    let b = client(&server).await;
    let c = client(&server).await;
    let d = client(&server).await;

    let conv = a
        .gruppe_erstellen(BTreeSet::from([b.user_id(), c.user_id()]))
        .await
        .unwrap()
        .id;
    let vorher = server.snapshot(conv).unwrap();
    let wrap_b_v1 = vorher.wrap_fuer(1, b.user_id()).cloned().unwrap();

    a.mitglied_entfernen(conv, c.user_id()).await.unwrap();
    a.mitglied_hinzufuegen(conv, d.user_id()).await.unwrap();
    a.reparatur()
        .reparatur_durchlauf(conv)
        .await
        .unwrap();

    let nachher = server.snapshot(conv).unwrap();
    assert_eq!(nachher.wrap_fuer(1, b.user_id()), Some(&wrap_b_v1));
    for (version, wraps) in &vorher.encrypted_keys_by_version {
        for (user, wrap) in wraps {
            assert_eq!(nachher.wrap_fuer(*version, *user), Some(wrap));
        }
    }
}

// ---------------------------------------------------------------------------
// Begrenzte Versuche
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unerreichbarer_schluessel_wird_begrenzt_versucht() {
    let server = Arc::new(InMemoryKeyServer::new());
    let a = client(&server).await;
    let b = client(&server).await;
    let aussenstehend = client(&server).await;

    let conv = a
        .gruppe_erstellen(BTreeSet::from([b.user_id()]))
        .await
        .unwrap()
        .id;
    let nachricht = gruppen_nachricht(&a, conv, 1, senden(&a, conv, 1, "geheim").await);

    for _ in 0..20 {
        assert_eq!(
            aussenstehend.nachricht_lesen(&nachricht).await,
            Anzeige::Platzhalter
        );
    }
    let max = E2eeConfig::default().max_entschluesselungs_versuche;
    assert_eq!(aussenstehend.warteschlange().versuche(nachricht.message_id), max);
    assert_eq!(
        aussenstehend.warteschlange().status(nachricht.message_id),
        Some(VersuchStatus::Erschoepft)
    );

    // Erschoepft: keine weiteren Server-Anfragen
    let anfragen = server.anfragen();
    aussenstehend.nachricht_lesen(&nachricht).await;
    assert_eq!(server.anfragen(), anfragen);

    // Aufnahme plus eingetroffener Schluessel setzt den Zaehler zurueck
    a.mitglied_hinzufuegen(conv, aussenstehend.user_id())
        .await
        .unwrap();
    aussenstehend
        .gruppen()
        .ensure_group_key(conv, 1)
        .await
        .unwrap();
    assert_eq!(
        aussenstehend.nachricht_lesen(&nachricht).await,
        Anzeige::Text("geheim".into())
    );
}

#[tokio::test]
async fn unbrauchbarer_wrap_wird_begrenzt_versucht() {
    let server = Arc::new(InMemoryKeyServer::new());
    let a = client(&server).await;
    let b = client(&server).await;

    let conv = a
        .gruppe_erstellen(BTreeSet::from([b.user_id()]))
        .await
        .unwrap()
        .id;
    let nachricht = gruppen_nachricht(&a, conv, 1, senden(&a, conv, 1, "geheim").await);

    // Wrap existiert, laesst sich aber mit keinem Schluessel oeffnen.
    // Der Verteiler hat nicht rotiert, sein Schluessel im Verzeichnis ist unveraendert.
    server.wrap_ersetzen(
        conv,
        1,
        b.user_id(),
        WrappedKeyBlob {
            ciphertext: vec![0u8; 48],
            iv: vec![0u8; 12],
            sender_public_key: a.public_key().unwrap(),
            from: a.user_id(),
        },
    );

    let vorher = server.anfragen();
    for _ in 0..50 {
        assert_eq!(b.nachricht_lesen(&nachricht).await, Anzeige::Platzhalter);
    }
    let max = E2eeConfig::default().max_entschluesselungs_versuche;
    assert_eq!(b.warteschlange().versuche(nachricht.message_id), max);
    assert_eq!(
        b.warteschlange().status(nachricht.message_id),
        Some(VersuchStatus::Erschoepft)
    );
    // Pro Versuch: Unterhaltung laden, Verzeichnis, erzwungenes Verzeichnis
    assert!(server.anfragen() - vorher <= max as usize * 3);

    let anfragen = server.anfragen();
    b.nachricht_lesen(&nachricht).await;
    assert_eq!(server.anfragen(), anfragen);
}
