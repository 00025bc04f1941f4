//! E2EE-Client fuer einen angemeldeten Benutzer
//!
//! Verbindet Identitaet, Verzeichnis, DM-Ableitung, Gruppen-Epochen,
//! Reparatur und Retry-Warteschlange. Die Transportschicht reicht nur Text
//! herein und bekommt Text heraus; Entschluesselungsfehler erscheinen nie
//! als Fehler, sondern als Platzhalter.

use std::collections::BTreeSet;
use std::sync::Arc;

use fluester_core::{ConversationId, MessageId, SchluesselEreignis, UserId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::aead;
use crate::config::E2eeConfig;
use crate::directory::PublicKeyDirectory;
use crate::dm::{DmCrypto, DmStrategie};
use crate::envelope::{Envelope, Nachrichteninhalt, StrukturierteNutzlast};
use crate::error::{CryptoError, CryptoResult};
use crate::identity::{IdentityStore, KeyRing, SharedKeyRing};
use crate::key_manager::GroupEpochManager;
use crate::repair::KeyHistoryRepairAgent;
use crate::retry::RetryWarteschlange;
use crate::server::KeyServer;
use crate::store::KeyStore;
use crate::types::{ConversationRecord, Kid, PublicKey};

/// Anzeigetext fuer (noch) nicht entschluesselbare Nachrichten
pub const PLATZHALTER_TEXT: &str = "Verschluesselte Nachricht...";

/// Ob diese Sitzung verschluesselt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerschluesselungsModus {
    EndeZuEnde,
    /// Krypto-Primitive fehlen; Nachrichten gehen ausdruecklich unverschluesselt raus
    Unverschluesselt { grund: String },
}

/// Empfaenger bzw. Herkunft einer Nachricht
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ziel {
    Dm {
        peer: UserId,
    },
    Gruppe {
        conversation_id: ConversationId,
        /// Version der Unterhaltung zum Sendezeitpunkt (0 = unverschluesselt)
        key_version: u32,
    },
}

/// Fertiger Text fuer die Transportschicht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AusgehendeNachricht {
    pub text: String,
    pub verschluesselt: bool,
}

/// Eingehende Nachricht, wie sie die Transportschicht liefert
#[derive(Debug, Clone)]
pub struct EingehendeNachricht {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub ziel: Ziel,
    pub text: String,
}

/// Was die Oberflaeche anzeigt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anzeige {
    Text(String),
    Anhaenge(StrukturierteNutzlast),
    /// Entschluesselung (noch) nicht moeglich; wird bei Schluessel-Ereignissen erneut versucht
    Platzhalter,
}

impl Anzeige {
    pub fn als_text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Anhaenge(nutzlast) => nutzlast.text.as_deref().unwrap_or_default(),
            Self::Platzhalter => PLATZHALTER_TEXT,
        }
    }
}

pub struct E2eeClient {
    user_id: UserId,
    modus: VerschluesselungsModus,
    identitaeten: IdentityStore,
    ring: SharedKeyRing,
    directory: Arc<PublicKeyDirectory>,
    dm: DmCrypto,
    gruppen: Arc<GroupEpochManager>,
    reparatur: Arc<KeyHistoryRepairAgent>,
    warteschlange: RetryWarteschlange,
    ereignisse: Mutex<broadcast::Receiver<SchluesselEreignis>>,
}

impl E2eeClient {
    /// Meldet einen Benutzer an: Selbsttest, Identitaet laden oder erzeugen,
    /// oeffentlichen Schluessel veroeffentlichen.
    pub async fn anmelden(
        user_id: UserId,
        server: Arc<dyn KeyServer>,
        store: Arc<dyn KeyStore>,
        config: E2eeConfig,
    ) -> CryptoResult<Self> {
        Self::aufbauen(user_id, server, store, config, aead::self_test()).await
    }

    async fn aufbauen(
        user_id: UserId,
        server: Arc<dyn KeyServer>,
        store: Arc<dyn KeyStore>,
        config: E2eeConfig,
        selbsttest: CryptoResult<()>,
    ) -> CryptoResult<Self> {
        let directory = Arc::new(PublicKeyDirectory::new(server.clone()));
        let identitaeten = IdentityStore::new(store.clone());

        let (modus, ring) = match selbsttest {
            Ok(()) => {
                let identitaet = identitaeten.load_or_create(user_id).await?;
                directory
                    .publish(user_id, &identitaet.key_pair.public_key)
                    .await?;
                tracing::info!(
                    user = %user_id,
                    kid = %identitaet.kid,
                    neu = identitaet.neu_erstellt,
                    "E2EE aktiv"
                );
                (VerschluesselungsModus::EndeZuEnde, identitaet.ring)
            }
            Err(e) => {
                tracing::warn!(user = %user_id, fehler = %e, "Kryptografie nicht verfuegbar, Sitzung unverschluesselt");
                (
                    VerschluesselungsModus::Unverschluesselt {
                        grund: e.to_string(),
                    },
                    KeyRing::new(),
                )
            }
        };

        let ring: SharedKeyRing = Arc::new(RwLock::new(ring));
        let warteschlange = RetryWarteschlange::new(config.max_entschluesselungs_versuche);
        let dm = DmCrypto::new(user_id, ring.clone(), directory.clone(), config.algorithmus);
        let gruppen = Arc::new(GroupEpochManager::new(
            user_id,
            ring.clone(),
            directory.clone(),
            server.clone(),
            store,
            config,
        ));
        let reparatur = Arc::new(KeyHistoryRepairAgent::new(gruppen.clone(), server));
        let ereignisse = Mutex::new(gruppen.abonnieren());

        Ok(Self {
            user_id,
            modus,
            identitaeten,
            ring,
            directory,
            dm,
            gruppen,
            reparatur,
            warteschlange,
            ereignisse,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn modus(&self) -> &VerschluesselungsModus {
        &self.modus
    }

    pub fn ist_verschluesselt(&self) -> bool {
        self.modus == VerschluesselungsModus::EndeZuEnde
    }

    /// Aktueller oeffentlicher Schluessel (None im unverschluesselten Modus)
    pub fn public_key(&self) -> Option<PublicKey> {
        self.ring.read().current().map(|p| p.public_key)
    }

    pub fn kid(&self) -> Option<Kid> {
        self.ring.read().current().map(|p| p.kid.clone())
    }

    pub fn gruppen(&self) -> &Arc<GroupEpochManager> {
        &self.gruppen
    }

    pub fn reparatur(&self) -> &Arc<KeyHistoryRepairAgent> {
        &self.reparatur
    }

    pub fn directory(&self) -> &PublicKeyDirectory {
        &self.directory
    }

    pub fn warteschlange(&self) -> &RetryWarteschlange {
        &self.warteschlange
    }

    fn krypto_pruefen(&self) -> CryptoResult<()> {
        match &self.modus {
            VerschluesselungsModus::EndeZuEnde => Ok(()),
            VerschluesselungsModus::Unverschluesselt { grund } => {
                Err(CryptoError::CryptoUnavailable(grund.clone()))
            }
        }
    }

    /// Rotiert die eigene Identitaet; alte Generationen bleiben im KeyRing
    pub async fn rotate_identity(&self) -> CryptoResult<Kid> {
        self.krypto_pruefen()?;
        let neu = self.identitaeten.rotate(self.user_id).await?;
        self.ring.write().push(neu.key_pair.clone());
        self.directory
            .publish(self.user_id, &neu.key_pair.public_key)
            .await?;
        self.gruppen
            .ereignis_senden(SchluesselEreignis::IdentitaetRotiert {
                user_id: self.user_id,
            });
        Ok(neu.kid)
    }

    // -----------------------------------------------------------------------
    // Senden
    // -----------------------------------------------------------------------

    /// Verschluesselt fuer ein Ziel. Im unverschluesselten Modus:
    /// [`CryptoError::CryptoUnavailable`], nie Klartext.
    pub async fn verschluesseln(&self, ziel: &Ziel, klartext: &[u8]) -> CryptoResult<Envelope> {
        self.krypto_pruefen()?;
        match *ziel {
            Ziel::Dm { peer } => self.dm.encrypt(peer, klartext).await,
            Ziel::Gruppe {
                conversation_id,
                key_version,
            } => {
                self.gruppen
                    .encrypt_message(conversation_id, key_version, klartext)
                    .await
            }
        }
    }

    /// Text fuer die Transportschicht.
    ///
    /// Unverschluesselt nur, wenn die Sitzung oder die Gruppe (Version 0)
    /// ausdruecklich unverschluesselt ist; `verschluesselt` sagt es dem Aufrufer.
    pub async fn ausgehend(&self, ziel: &Ziel, text: &str) -> CryptoResult<AusgehendeNachricht> {
        let unverschluesselte_gruppe = matches!(ziel, Ziel::Gruppe { key_version: 0, .. });
        if !self.ist_verschluesselt() || unverschluesselte_gruppe {
            return Ok(AusgehendeNachricht {
                text: text.to_string(),
                verschluesselt: false,
            });
        }

        let env = self.verschluesseln(ziel, text.as_bytes()).await?;
        Ok(AusgehendeNachricht {
            text: Nachrichteninhalt::Verschluesselt(env).to_text()?,
            verschluesselt: true,
        })
    }

    /// Nachricht mit Anhaengen; die Nutzlast wird wie Text verschluesselt
    pub async fn ausgehend_mit_anhaengen(
        &self,
        ziel: &Ziel,
        nutzlast: &StrukturierteNutzlast,
    ) -> CryptoResult<AusgehendeNachricht> {
        let json = Nachrichteninhalt::Strukturiert(nutzlast.clone()).to_text()?;
        self.ausgehend(ziel, &json).await
    }

    // -----------------------------------------------------------------------
    // Empfangen
    // -----------------------------------------------------------------------

    /// Leert den Ereignis-Kanal und setzt betroffene Retry-Zaehler zurueck
    pub fn ereignisse_verarbeiten(&self) -> usize {
        let mut empfaenger = self.ereignisse.lock();
        let mut verarbeitet = 0;
        loop {
            match empfaenger.try_recv() {
                Ok(ereignis) => {
                    self.warteschlange.auf_ereignis(&ereignis);
                    verarbeitet += 1;
                }
                Err(TryRecvError::Lagged(verpasst)) => {
                    // Unbekannt, was verpasst wurde: alles zuruecksetzen
                    tracing::debug!(verpasst, "Schluessel-Ereignisse verpasst");
                    self.warteschlange
                        .auf_ereignis(&SchluesselEreignis::IdentitaetRotiert {
                            user_id: self.user_id,
                        });
                    verarbeitet += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        verarbeitet
    }

    /// Bereitet eine eingehende Nachricht fuer die Anzeige auf.
    ///
    /// Liefert nie einen Fehler: was nicht entschluesselt werden kann, wird
    /// zum Platzhalter und im Rahmen des Retry-Budgets spaeter erneut versucht.
    pub async fn nachricht_lesen(&self, nachricht: &EingehendeNachricht) -> Anzeige {
        self.ereignisse_verarbeiten();

        let env = match Nachrichteninhalt::from_text(&nachricht.text) {
            Nachrichteninhalt::Klartext(text) => return Anzeige::Text(text),
            Nachrichteninhalt::Strukturiert(nutzlast) => return Anzeige::Anhaenge(nutzlast),
            Nachrichteninhalt::Verschluesselt(env) => env,
        };

        if !self.ist_verschluesselt() {
            return Anzeige::Platzhalter;
        }
        if !self.warteschlange.versuch_starten(
            nachricht.message_id,
            nachricht.conversation_id,
            Some(nachricht.sender),
        ) {
            return Anzeige::Platzhalter;
        }

        match self.entschluesseln(nachricht, &env).await {
            Ok(klartext) => {
                self.warteschlange.erfolg(nachricht.message_id);
                match Nachrichteninhalt::from_text(&klartext) {
                    Nachrichteninhalt::Strukturiert(nutzlast) => Anzeige::Anhaenge(nutzlast),
                    _ => Anzeige::Text(klartext),
                }
            }
            Err(e) => {
                let status = self.warteschlange.fehlschlag(nachricht.message_id);
                tracing::debug!(
                    message = %nachricht.message_id,
                    ?status,
                    fehler = %e,
                    "Nachricht bleibt verschluesselt"
                );
                Anzeige::Platzhalter
            }
        }
    }

    async fn entschluesseln(
        &self,
        nachricht: &EingehendeNachricht,
        env: &Envelope,
    ) -> CryptoResult<String> {
        let bytes = match nachricht.ziel {
            Ziel::Dm { peer } => {
                let ergebnis = self.dm.decrypt(peer, env).await?;
                if ergebnis.strategie == DmStrategie::Aktualisiert {
                    self.gruppen
                        .ereignis_senden(SchluesselEreignis::PeerAktualisiert { user_id: peer });
                }
                ergebnis.klartext
            }
            Ziel::Gruppe {
                conversation_id,
                key_version,
            } => {
                self.gruppen
                    .decrypt_message(conversation_id, key_version, env)
                    .await?
            }
        };
        String::from_utf8(bytes).map_err(|e| CryptoError::DecryptionUnresolved {
            grund: format!("Klartext ist kein UTF-8: {e}"),
        })
    }

    // -----------------------------------------------------------------------
    // Gruppen
    // -----------------------------------------------------------------------

    pub async fn gruppe_erstellen(
        &self,
        mitglieder: BTreeSet<UserId>,
    ) -> CryptoResult<ConversationRecord> {
        self.krypto_pruefen()?;
        self.gruppen.create_group(mitglieder).await
    }

    pub async fn mitglied_hinzufuegen(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> CryptoResult<ConversationRecord> {
        self.krypto_pruefen()?;
        self.gruppen.add_member(conversation_id, user_id).await
    }

    pub async fn mitglied_entfernen(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> CryptoResult<ConversationRecord> {
        self.krypto_pruefen()?;
        self.gruppen.remove_member(conversation_id, user_id).await
    }

    /// Eine Gruppe wurde geoeffnet. Verwaltet dieser Benutzer sie, wird ein
    /// entprellter Reparatur-Durchlauf geplant.
    pub fn gruppe_geoeffnet(&self, gruppe: &ConversationRecord) -> Option<JoinHandle<()>> {
        if !self.ist_verschluesselt()
            || !gruppe.ist_verschluesselt()
            || !gruppe.ist_administrator(self.user_id)
        {
            return None;
        }
        Some(self.reparatur.planen(gruppe.id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::{encrypt_file, AnhangReferenz};
    use crate::server::InMemoryKeyServer;
    use crate::store::MemoryKeyStore;

    async fn client(server: &Arc<InMemoryKeyServer>) -> E2eeClient {
        E2eeClient::anmelden(
            UserId::new(),
            server.clone(),
            Arc::new(MemoryKeyStore::new()),
            E2eeConfig::default(),
        )
        .await
        .unwrap()
    }

    fn eingehend(von: &E2eeClient, ziel: Ziel, conversation_id: ConversationId, text: String) -> EingehendeNachricht {
        EingehendeNachricht {
            message_id: MessageId::new(),
            conversation_id,
            sender: von.user_id(),
            ziel,
            text,
        }
    }

    #[tokio::test]
    async fn anmelden_veroeffentlicht_schluessel() {
        let server = Arc::new(InMemoryKeyServer::new());
        let alice = client(&server).await;
        assert!(alice.ist_verschluesselt());
        assert_eq!(
            server.fetch_public_key(alice.user_id()).await.unwrap(),
            alice.public_key()
        );
    }

    #[tokio::test]
    async fn ohne_krypto_ist_der_modus_ausdruecklich() {
        let server = Arc::new(InMemoryKeyServer::new());
        let client = E2eeClient::aufbauen(
            UserId::new(),
            server.clone(),
            Arc::new(MemoryKeyStore::new()),
            E2eeConfig::default(),
            Err(CryptoError::CryptoUnavailable("kein AES".into())),
        )
        .await
        .unwrap();

        assert!(matches!(client.modus(), VerschluesselungsModus::Unverschluesselt { .. }));
        let ziel = Ziel::Dm { peer: UserId::new() };
        assert!(matches!(
            client.verschluesseln(&ziel, b"x").await,
            Err(CryptoError::CryptoUnavailable(_))
        ));
        let nachricht = client.ausgehend(&ziel, "hallo").await.unwrap();
        assert!(!nachricht.verschluesselt);
        assert_eq!(nachricht.text, "hallo");
    }

    #[tokio::test]
    async fn dm_mit_anhang() {
        let server = Arc::new(InMemoryKeyServer::new());
        let alice = client(&server).await;
        let bob = client(&server).await;

        let (ciphertext, schluessel) = encrypt_file(b"Urlaubsfoto").unwrap();
        let nutzlast = StrukturierteNutzlast::anhaenge(
            Some("Schau mal".into()),
            vec![AnhangReferenz::neu("f1", "foto.jpg", "image/jpeg", 11, &schluessel)],
        );
        let ausgehend = alice
            .ausgehend_mit_anhaengen(&Ziel::Dm { peer: bob.user_id() }, &nutzlast)
            .await
            .unwrap();
        assert!(ausgehend.verschluesselt);
        assert!(!ausgehend.text.contains("foto.jpg"));

        let nachricht = eingehend(
            &alice,
            Ziel::Dm { peer: alice.user_id() },
            ConversationId::new(),
            ausgehend.text,
        );
        let Anzeige::Anhaenge(empfangen) = bob.nachricht_lesen(&nachricht).await else {
            panic!("Anhaenge erwartet");
        };
        assert_eq!(empfangen.text.as_deref(), Some("Schau mal"));
        assert_eq!(empfangen.attachments[0].entschluesseln(&ciphertext).unwrap(), b"Urlaubsfoto");
    }

    #[tokio::test]
    async fn unlesbare_nachricht_wird_platzhalter() {
        let server = Arc::new(InMemoryKeyServer::new());
        let alice = client(&server).await;
        let bob = client(&server).await;
        let eve = client(&server).await;

        let ausgehend = alice
            .ausgehend(&Ziel::Dm { peer: bob.user_id() }, "nur fuer bob")
            .await
            .unwrap();
        let nachricht = eingehend(
            &alice,
            Ziel::Dm { peer: alice.user_id() },
            ConversationId::new(),
            ausgehend.text,
        );

        let anzeige = eve.nachricht_lesen(&nachricht).await;
        assert_eq!(anzeige, Anzeige::Platzhalter);
        assert_eq!(anzeige.als_text(), PLATZHALTER_TEXT);
    }

    #[tokio::test]
    async fn identitaets_rotation_behaelt_alte_dms_lesbar() {
        let server = Arc::new(InMemoryKeyServer::new());
        let alice = client(&server).await;
        let bob = client(&server).await;

        let alt = alice
            .ausgehend(&Ziel::Dm { peer: bob.user_id() }, "vor der rotation")
            .await
            .unwrap();
        let alter_kid = bob.kid().unwrap();
        let neuer_kid = bob.rotate_identity().await.unwrap();
        assert_ne!(alter_kid, neuer_kid);
        assert_eq!(server.fetch_public_key(bob.user_id()).await.unwrap(), bob.public_key());

        let nachricht = eingehend(
            &alice,
            Ziel::Dm { peer: alice.user_id() },
            ConversationId::new(),
            alt.text,
        );
        assert_eq!(
            bob.nachricht_lesen(&nachricht).await,
            Anzeige::Text("vor der rotation".into())
        );
    }

    #[tokio::test]
    async fn unverschluesselte_gruppe_sendet_klartext() {
        let server = Arc::new(InMemoryKeyServer::new());
        let alice = client(&server).await;
        let ziel = Ziel::Gruppe {
            conversation_id: ConversationId::new(),
            key_version: 0,
        };
        let nachricht = alice.ausgehend(&ziel, "offen").await.unwrap();
        assert_eq!(
            nachricht,
            AusgehendeNachricht {
                text: "offen".into(),
                verschluesselt: false
            }
        );
    }
}
