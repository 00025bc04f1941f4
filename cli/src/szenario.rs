//! End-to-End-Szenarien gegen den In-Memory-Schluesselserver
//!
//! Jeder Teilnehmer bekommt einen eigenen dateibasierten Schluessel-Speicher
//! unterhalb von `[speicher].verzeichnis`.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use fluester_core::{ConversationId, MessageId, UserId};
use fluester_crypto::{
    Anzeige, CryptoError, E2eeClient, EingehendeNachricht, FileKeyStore, InMemoryKeyServer,
    Nachrichteninhalt, Ziel,
};

use crate::config::CliConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Szenario {
    Dm,
    Gruppe,
    Alle,
}

impl FromStr for Szenario {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dm" => Ok(Self::Dm),
            "gruppe" => Ok(Self::Gruppe),
            "alle" => Ok(Self::Alle),
            anderes => bail!("Unbekanntes Szenario '{anderes}' (erlaubt: dm, gruppe, alle)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmBericht {
    pub empfangen: String,
    /// Server-Anfragen beim Empfaenger fuer das Entschluesseln
    pub anfragen_beim_empfang: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GruppenBericht {
    pub version_nach_rotation: u32,
    pub entferntes_mitglied_gesperrt: bool,
    /// Gelesene Texte der verbleibenden Mitglieder (vor und nach der Rotation)
    pub gelesen: Vec<String>,
}

async fn teilnehmer(server: &Arc<InMemoryKeyServer>, config: &CliConfig) -> Result<E2eeClient> {
    let user_id = UserId::new();
    let store = FileKeyStore::new(config.speicher.verzeichnis.join(user_id.inner().to_string()));
    E2eeClient::anmelden(user_id, server.clone(), Arc::new(store), config.e2ee.clone())
        .await
        .with_context(|| format!("Anmeldung von {user_id} fehlgeschlagen"))
}

fn eingehend(von: &E2eeClient, conversation_id: ConversationId, ziel: Ziel, text: String) -> EingehendeNachricht {
    EingehendeNachricht {
        message_id: MessageId::new(),
        conversation_id,
        sender: von.user_id(),
        ziel,
        text,
    }
}

/// Alice schickt Bob "hello"; Bob entschluesselt nur mit Envelope und eigenem Schluessel
pub async fn dm_szenario(config: &CliConfig) -> Result<DmBericht> {
    let server = Arc::new(InMemoryKeyServer::new());
    let alice = teilnehmer(&server, config).await?;
    let bob = teilnehmer(&server, config).await?;

    let ausgehend = alice
        .ausgehend(&Ziel::Dm { peer: bob.user_id() }, "hello")
        .await?;
    ensure!(ausgehend.verschluesselt, "DM wurde unverschluesselt gesendet");

    let vorher = server.anfragen();
    let nachricht = eingehend(
        &alice,
        ConversationId::new(),
        Ziel::Dm {
            peer: alice.user_id(),
        },
        ausgehend.text,
    );
    let anzeige = bob.nachricht_lesen(&nachricht).await;
    let bericht = DmBericht {
        empfangen: anzeige.als_text().to_string(),
        anfragen_beim_empfang: server.anfragen() - vorher,
    };
    tracing::info!(
        empfangen = %bericht.empfangen,
        anfragen = bericht.anfragen_beim_empfang,
        "DM-Szenario abgeschlossen"
    );
    Ok(bericht)
}

/// Gruppe A, B, C; A entfernt C. C scheitert an Epoch 2, A und B lesen beide Epochen.
pub async fn gruppen_szenario(config: &CliConfig) -> Result<GruppenBericht> {
    let server = Arc::new(InMemoryKeyServer::new());
    let a = teilnehmer(&server, config).await?;
    let b = teilnehmer(&server, config).await?;
    let c = teilnehmer(&server, config).await?;

    let gruppe = a
        .gruppe_erstellen(BTreeSet::from([b.user_id(), c.user_id()]))
        .await?;
    let conv = gruppe.id;
    let vor = a
        .ausgehend(
            &Ziel::Gruppe {
                conversation_id: conv,
                key_version: gruppe.key_version,
            },
            "vor der rotation",
        )
        .await?;

    let gruppe = a.mitglied_entfernen(conv, c.user_id()).await?;
    let ziel_neu = Ziel::Gruppe {
        conversation_id: conv,
        key_version: gruppe.key_version,
    };
    let nach = a.ausgehend(&ziel_neu, "nach der rotation").await?;

    let Nachrichteninhalt::Verschluesselt(env) = Nachrichteninhalt::from_text(&nach.text) else {
        bail!("Gruppennachricht ist nicht verschluesselt");
    };
    let entferntes_mitglied_gesperrt = matches!(
        c.gruppen()
            .decrypt_message(conv, gruppe.key_version, &env)
            .await,
        Err(CryptoError::DecryptionUnresolved { .. })
    );

    let mut gelesen = Vec::new();
    for leser in [&a, &b] {
        for (version, text) in [(1, &vor.text), (gruppe.key_version, &nach.text)] {
            let ziel = Ziel::Gruppe {
                conversation_id: conv,
                key_version: version,
            };
            match leser.nachricht_lesen(&eingehend(&a, conv, ziel, text.clone())).await {
                Anzeige::Text(klartext) => gelesen.push(klartext),
                andere => bail!("{} konnte Version {version} nicht lesen: {andere:?}", leser.user_id()),
            }
        }
    }

    let bericht = GruppenBericht {
        version_nach_rotation: gruppe.key_version,
        entferntes_mitglied_gesperrt,
        gelesen,
    };
    tracing::info!(
        conversation = %conv,
        version = bericht.version_nach_rotation,
        gesperrt = bericht.entferntes_mitglied_gesperrt,
        "Gruppen-Szenario abgeschlossen"
    );
    Ok(bericht)
}

pub async fn ausfuehren(szenario: Szenario, config: &CliConfig) -> Result<()> {
    if matches!(szenario, Szenario::Dm | Szenario::Alle) {
        let bericht = dm_szenario(config).await?;
        ensure!(bericht.empfangen == "hello", "DM falsch entschluesselt: {}", bericht.empfangen);
        println!(
            "dm: Bob liest \"{}\" mit {} zusaetzlichen Anfragen",
            bericht.empfangen, bericht.anfragen_beim_empfang
        );
    }
    if matches!(szenario, Szenario::Gruppe | Szenario::Alle) {
        let bericht = gruppen_szenario(config).await?;
        ensure!(
            bericht.entferntes_mitglied_gesperrt,
            "Entferntes Mitglied konnte Epoch {} lesen",
            bericht.version_nach_rotation
        );
        println!(
            "gruppe: Version {}, entferntes Mitglied gesperrt, {} Nachrichten gelesen",
            bericht.version_nach_rotation,
            bericht.gelesen.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> CliConfig {
        let mut config = CliConfig::default();
        config.speicher.verzeichnis = dir.path().to_path_buf();
        config.e2ee.rotation_backoff_ms = 1;
        config
    }

    #[test]
    fn szenario_parsen() {
        assert_eq!("dm".parse::<Szenario>().unwrap(), Szenario::Dm);
        assert_eq!("alle".parse::<Szenario>().unwrap(), Szenario::Alle);
        assert!("voice".parse::<Szenario>().is_err());
    }

    #[tokio::test]
    async fn dm_szenario_ohne_zusaetzliche_anfragen() {
        let dir = tempfile::tempdir().unwrap();
        let bericht = dm_szenario(&config_in(&dir)).await.unwrap();
        assert_eq!(bericht.empfangen, "hello");
        assert_eq!(bericht.anfragen_beim_empfang, 0);
    }

    #[tokio::test]
    async fn gruppen_szenario_sperrt_entferntes_mitglied() {
        let dir = tempfile::tempdir().unwrap();
        let bericht = gruppen_szenario(&config_in(&dir)).await.unwrap();
        assert_eq!(bericht.version_nach_rotation, 2);
        assert!(bericht.entferntes_mitglied_gesperrt);
        assert_eq!(
            bericht.gelesen,
            vec![
                "vor der rotation",
                "nach der rotation",
                "vor der rotation",
                "nach der rotation"
            ]
        );
    }

    #[tokio::test]
    async fn schluessel_landen_im_verzeichnis() {
        let dir = tempfile::tempdir().unwrap();
        ausfuehren(Szenario::Alle, &config_in(&dir)).await.unwrap();
        // Pro Teilnehmer ein Unterverzeichnis (2 aus dem DM-, 3 aus dem Gruppen-Szenario)
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 5);
    }
}
