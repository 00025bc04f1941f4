//! Gruppen-Epoch-Verwaltung (Key Manager)
//!
//! Verwaltet die versionierten Gruppen-Schluessel eines lokalen Benutzers:
//! - Erstellen (Version 1) mit Wraps fuer alle Start-Mitglieder
//! - Hinzufuegen eines Mitglieds (keine neue Version, optional Historie)
//! - Entfernen eines Mitglieds (Rotation auf Version N+1)
//! - Beschaffen eines Epoch-Schluessels: Cache, lokaler Speicher, Server
//!
//! Alte Epochen werden nie geloescht. Entfernte Mitglieder verlieren nur
//! den Zugriff auf neue Epochen.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fluester_core::{ConversationId, SchluesselEreignis, UserId};
use tokio::sync::{broadcast, Mutex};

use crate::cache::KeyCache;
use crate::config::{E2eeConfig, HistorienFreigabe};
use crate::directory::PublicKeyDirectory;
use crate::envelope::{self, Envelope, EnvelopeKontext};
use crate::error::{CryptoError, CryptoResult};
use crate::group_key::{
    create_group_key, import_group_key, unwrap_key_for_recipient, wrap_key_for_recipient,
    GroupKeyRecord,
};
use crate::identity::{KeyPair, SharedKeyRing};
use crate::server::{GruppenAnlage, KeyServer, MitgliedEntfernen, MitgliedHinzufuegen};
use crate::store::{KeyScope, KeyStore};
use crate::types::{ConversationRecord, PublicKey, WrappedKeyBlob, WrappedKeyMap};

/// Kapazitaet des Ereignis-Kanals
const EREIGNIS_KAPAZITAET: usize = 256;

type InflightMap = DashMap<(ConversationId, u32), Arc<Mutex<()>>>;

/// Anteil an einer laufenden Beschaffung. Der letzte Beteiligte entfernt
/// die Sperre aus der Map, auch wenn sein Future abgebrochen wurde.
struct InflightEintrag<'a> {
    inflight: &'a InflightMap,
    schluessel: (ConversationId, u32),
    sperre: Arc<Mutex<()>>,
}

impl<'a> InflightEintrag<'a> {
    fn betreten(inflight: &'a InflightMap, schluessel: (ConversationId, u32)) -> Self {
        let sperre = inflight.entry(schluessel).or_default().clone();
        Self {
            inflight,
            schluessel,
            sperre,
        }
    }
}

impl Drop for InflightEintrag<'_> {
    fn drop(&mut self) {
        // Referenzen werden nur unter der Shard-Sperre gezaehlt
        let sperre = std::mem::take(&mut self.sperre);
        if let Entry::Occupied(eintrag) = self.inflight.entry(self.schluessel) {
            let gleich = Arc::ptr_eq(eintrag.get(), &sperre);
            drop(sperre);
            if gleich && Arc::strong_count(eintrag.get()) == 1 {
                eintrag.remove();
            }
        }
    }
}

/// Verwaltet Gruppen-Schluessel aller Unterhaltungen eines Benutzers
pub struct GroupEpochManager {
    user_id: UserId,
    ring: SharedKeyRing,
    directory: Arc<PublicKeyDirectory>,
    server: Arc<dyn KeyServer>,
    store: Arc<dyn KeyStore>,
    /// Entpackte Schluessel pro (Unterhaltung, Version)
    cache: KeyCache<(ConversationId, u32), GroupKeyRecord>,
    /// Laufende Beschaffungen; parallele Aufrufe warten auf dieselbe Sperre
    inflight: InflightMap,
    config: E2eeConfig,
    ereignisse: broadcast::Sender<SchluesselEreignis>,
}

impl GroupEpochManager {
    pub fn new(
        user_id: UserId,
        ring: SharedKeyRing,
        directory: Arc<PublicKeyDirectory>,
        server: Arc<dyn KeyServer>,
        store: Arc<dyn KeyStore>,
        config: E2eeConfig,
    ) -> Self {
        let (ereignisse, _) = broadcast::channel(EREIGNIS_KAPAZITAET);
        Self {
            user_id,
            ring,
            directory,
            server,
            store,
            cache: KeyCache::new(),
            inflight: DashMap::new(),
            config,
            ereignisse,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn config(&self) -> &E2eeConfig {
        &self.config
    }

    /// Empfaenger fuer Schluessel-Ereignisse (neue Epoch-Schluessel, Peer-Aktualisierungen)
    pub fn abonnieren(&self) -> broadcast::Receiver<SchluesselEreignis> {
        self.ereignisse.subscribe()
    }

    pub(crate) fn ereignis_senden(&self, ereignis: SchluesselEreignis) {
        // Ohne Empfaenger geht das Ereignis verloren, das ist in Ordnung
        let _ = self.ereignisse.send(ereignis);
    }

    pub(crate) fn eigenes_paar(&self) -> CryptoResult<KeyPair> {
        self.ring
            .read()
            .current()
            .cloned()
            .ok_or(CryptoError::KeineIdentitaet(self.user_id))
    }

    /// Aktueller Datensatz einer Unterhaltung vom Server
    pub async fn gruppe_laden(
        &self,
        conversation_id: ConversationId,
    ) -> CryptoResult<ConversationRecord> {
        Ok(self
            .server
            .fetch_conversation(self.user_id, conversation_id)
            .await?)
    }

    // -----------------------------------------------------------------------
    // Mitglieder-Aenderungen
    // -----------------------------------------------------------------------

    /// Erstellt eine verschluesselte Gruppe (Version 1).
    ///
    /// Bricht ab, bevor der Server etwas sieht, wenn ein Mitglied keinen
    /// oeffentlichen Schluessel hat.
    pub async fn create_group(
        &self,
        member_ids: BTreeSet<UserId>,
    ) -> CryptoResult<ConversationRecord> {
        let mut mitglieder = member_ids;
        mitglieder.insert(self.user_id);

        let record = create_group_key(1);
        let wraps = {
            let (mitglieder, record) = (&mitglieder, &record);
            self.mit_wiederholung("create_group", move || {
                self.wraps_erzeugen(mitglieder, record)
            })
            .await?
        };

        let gruppe = self
            .server
            .create_group(
                self.user_id,
                GruppenAnlage {
                    member_ids: mitglieder,
                    encrypted_keys: Some(wraps),
                    key_version: Some(record.version),
                },
            )
            .await?;

        self.schluessel_merken(gruppe.id, record).await?;
        tracing::info!(
            conversation = %gruppe.id,
            mitglieder = gruppe.members.len(),
            "Verschluesselte Gruppe erstellt"
        );
        Ok(gruppe)
    }

    /// Fuegt ein Mitglied hinzu, ohne die Version zu aendern.
    ///
    /// Der Wrap der aktuellen Epoch ist Pflicht; ohne ihn wird nichts an den
    /// Server geschickt. Mit [`HistorienFreigabe::Voll`] bekommt das neue
    /// Mitglied zusaetzlich alle frueheren Epochen.
    pub async fn add_member(
        &self,
        conversation_id: ConversationId,
        neues_mitglied: UserId,
    ) -> CryptoResult<ConversationRecord> {
        let gruppe = self.gruppe_mit_wiederholung(conversation_id).await?;
        self.administrator_pruefen(&gruppe)?;

        let aktuell = gruppe.key_version;
        let mut anfrage = MitgliedHinzufuegen {
            user_id: neues_mitglied,
            encrypted_key_for_new_member: None,
            encrypted_keys_for_new_member_by_version: BTreeMap::new(),
        };

        if aktuell > 0 {
            let paar = self.eigenes_paar()?;
            let empfaenger = {
                let paar = &paar;
                self.mit_wiederholung("add_member", move || {
                    self.empfaenger_schluessel(neues_mitglied, paar)
                })
                .await?
            };

            let record = self.ensure_group_key(conversation_id, aktuell).await?;
            anfrage.encrypted_key_for_new_member = Some(wrap_key_for_recipient(
                &paar,
                self.user_id,
                &empfaenger,
                &record,
            )?);

            if self.config.historien_freigabe == HistorienFreigabe::Voll {
                for version in 1..aktuell {
                    match self.ensure_group_key(conversation_id, version).await {
                        Ok(alt) => {
                            let blob =
                                wrap_key_for_recipient(&paar, self.user_id, &empfaenger, &alt)?;
                            anfrage
                                .encrypted_keys_for_new_member_by_version
                                .insert(version, blob);
                        }
                        Err(e) => {
                            // Die Reparatur traegt die Epoch spaeter nach
                            tracing::warn!(
                                conversation = %conversation_id,
                                version,
                                fehler = %e,
                                "Fruehere Epoch nicht verfuegbar"
                            );
                        }
                    }
                }
            }
        }

        let historie = anfrage.encrypted_keys_for_new_member_by_version.len();
        let aktualisiert = self
            .server
            .add_member(self.user_id, conversation_id, anfrage)
            .await?;
        tracing::info!(
            conversation = %conversation_id,
            user = %neues_mitglied,
            version = aktuell,
            historie,
            "Mitglied hinzugefuegt"
        );
        Ok(aktualisiert)
    }

    /// Entfernt ein Mitglied und rotiert auf Version N+1.
    ///
    /// Epoch N bleibt unveraendert auf dem Server und im lokalen Speicher.
    pub async fn remove_member(
        &self,
        conversation_id: ConversationId,
        mitglied: UserId,
    ) -> CryptoResult<ConversationRecord> {
        let gruppe = self.gruppe_mit_wiederholung(conversation_id).await?;
        self.administrator_pruefen(&gruppe)?;

        if !gruppe.ist_verschluesselt() {
            let anfrage = MitgliedEntfernen {
                user_id: mitglied,
                rotated_encrypted_keys: None,
                rotated_key_version: None,
            };
            return Ok(self
                .server
                .remove_member(self.user_id, conversation_id, anfrage)
                .await?);
        }

        let verbleibend: BTreeSet<UserId> = gruppe
            .members
            .iter()
            .copied()
            .filter(|m| *m != mitglied)
            .collect();
        let neu = create_group_key(gruppe.key_version + 1);

        let wraps = {
            let (verbleibend, neu) = (&verbleibend, &neu);
            self.mit_wiederholung("remove_member", move || {
                self.wraps_erzeugen(verbleibend, neu)
            })
            .await?
        };

        let aktualisiert = self
            .server
            .remove_member(
                self.user_id,
                conversation_id,
                MitgliedEntfernen {
                    user_id: mitglied,
                    rotated_encrypted_keys: Some(wraps),
                    rotated_key_version: Some(neu.version),
                },
            )
            .await?;

        let version = neu.version;
        if mitglied != self.user_id {
            self.schluessel_merken(conversation_id, neu).await?;
        }
        tracing::info!(
            conversation = %conversation_id,
            user = %mitglied,
            version,
            "Mitglied entfernt, Schluessel rotiert"
        );
        Ok(aktualisiert)
    }

    fn administrator_pruefen(&self, gruppe: &ConversationRecord) -> CryptoResult<()> {
        if gruppe.ist_administrator(self.user_id) {
            Ok(())
        } else {
            Err(CryptoError::KeineBerechtigung(format!(
                "{} verwaltet {} nicht",
                self.user_id, gruppe.id
            )))
        }
    }

    async fn gruppe_mit_wiederholung(
        &self,
        conversation_id: ConversationId,
    ) -> CryptoResult<ConversationRecord> {
        self.mit_wiederholung("gruppe_laden", move || self.gruppe_laden(conversation_id))
            .await
    }

    /// Wiederholt voruebergehende Fehler mit linearem Backoff.
    ///
    /// Sind alle Versuche verbraucht: [`CryptoError::KeyRotationRace`].
    /// Andere Fehler (z.B. fehlender Empfaenger-Schluessel) brechen sofort ab.
    async fn mit_wiederholung<T, F, Fut>(&self, vorgang: &'static str, mut op: F) -> CryptoResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CryptoResult<T>>,
    {
        let max = self.config.rotation_versuche.max(1);
        let mut versuch = 1;
        loop {
            match op().await {
                Ok(wert) => return Ok(wert),
                Err(e) if e.ist_wiederholbar() => {
                    if versuch >= max {
                        tracing::warn!(vorgang, versuche = versuch, fehler = %e, "Schluesselmaterial nicht rechtzeitig verfuegbar");
                        return Err(CryptoError::KeyRotationRace {
                            versuche: versuch,
                            grund: e.to_string(),
                        });
                    }
                    tracing::debug!(vorgang, versuch, fehler = %e, "Neuer Versuch");
                    tokio::time::sleep(self.config.rotation_backoff(versuch)).await;
                    versuch += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Oeffentlicher Schluessel eines Mitglieds; der eigene kommt aus dem KeyRing
    async fn empfaenger_schluessel(
        &self,
        user_id: UserId,
        eigenes: &KeyPair,
    ) -> CryptoResult<PublicKey> {
        if user_id == self.user_id {
            return Ok(eigenes.public_key);
        }
        self.directory.require(user_id, false).await
    }

    async fn wraps_erzeugen(
        &self,
        empfaenger: &BTreeSet<UserId>,
        record: &GroupKeyRecord,
    ) -> CryptoResult<WrappedKeyMap> {
        let paar = self.eigenes_paar()?;
        let mut wraps = WrappedKeyMap::new();
        for user_id in empfaenger {
            let pk = self.empfaenger_schluessel(*user_id, &paar).await?;
            wraps.insert(
                *user_id,
                wrap_key_for_recipient(&paar, self.user_id, &pk, record)?,
            );
        }
        Ok(wraps)
    }

    /// Wrap fuer ein einzelnes Mitglied; `None` wenn es keinen oeffentlichen Schluessel hat
    pub(crate) async fn wrap_fuer_mitglied(
        &self,
        user_id: UserId,
        record: &GroupKeyRecord,
    ) -> CryptoResult<Option<WrappedKeyBlob>> {
        let paar = self.eigenes_paar()?;
        match self.empfaenger_schluessel(user_id, &paar).await {
            Ok(pk) => Ok(Some(wrap_key_for_recipient(
                &paar,
                self.user_id,
                &pk,
                record,
            )?)),
            Err(CryptoError::MissingRecipientKey { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Schluessel beschaffen
    // -----------------------------------------------------------------------

    /// Stellt den Schluessel einer Epoch bereit.
    ///
    /// Reihenfolge: Speicher-Cache, lokaler KeyStore, Wrap vom Server
    /// (erst mit dem eingebetteten Absender-Schluessel, dann ueber das
    /// Verzeichnis). Parallele Aufrufe fuer dieselbe Epoch teilen sich
    /// eine Beschaffung.
    pub async fn ensure_group_key(
        &self,
        conversation_id: ConversationId,
        version: u32,
    ) -> CryptoResult<GroupKeyRecord> {
        let schluessel = (conversation_id, version);
        if let Some(record) = self.cache.get(&schluessel) {
            return Ok(record);
        }

        let eintrag = InflightEintrag::betreten(&self.inflight, schluessel);
        let _guard = eintrag.sperre.lock().await;
        if let Some(record) = self.cache.get(&schluessel) {
            return Ok(record);
        }

        self.schluessel_beschaffen(conversation_id, version).await
    }

    async fn schluessel_beschaffen(
        &self,
        conversation_id: ConversationId,
        version: u32,
    ) -> CryptoResult<GroupKeyRecord> {
        let scope = KeyScope::GroupKey {
            user_id: self.user_id,
            conversation_id,
            version,
        };

        if let Some(bytes) = self.store.load(&scope).await? {
            let importiert = std::str::from_utf8(&bytes)
                .map_err(|e| CryptoError::UngueltigeDaten(e.to_string()))
                .and_then(|s| import_group_key(s, version));
            match importiert {
                Ok(record) => {
                    self.cache.put((conversation_id, version), record.clone());
                    return Ok(record);
                }
                Err(e) => {
                    tracing::warn!(
                        conversation = %conversation_id,
                        version,
                        fehler = %e,
                        "Lokaler Epoch-Schluessel unlesbar"
                    );
                }
            }
        }

        let gruppe = self.gruppe_laden(conversation_id).await?;
        let blob = gruppe
            .wrap_fuer(version, self.user_id)
            .cloned()
            .ok_or(CryptoError::KeinSchluessel {
                conversation_id,
                version,
            })?;

        let record = self
            .entpacken(&blob, version)
            .await
            .ok_or(CryptoError::KeinSchluessel {
                conversation_id,
                version,
            })?;

        self.schluessel_merken(conversation_id, record.clone())
            .await?;
        tracing::debug!(conversation = %conversation_id, version, "Epoch-Schluessel entpackt");
        Ok(record)
    }

    /// Versucht alle eigenen Generationen (neueste zuerst) gegen den
    /// eingebetteten Absender-Schluessel, dann gegen das Verzeichnis.
    async fn entpacken(&self, blob: &WrappedKeyBlob, version: u32) -> Option<GroupKeyRecord> {
        let paare: Vec<KeyPair> = self.ring.read().newest_first().cloned().collect();
        let versuchen = |absender: &PublicKey| {
            paare
                .iter()
                .find_map(|paar| unwrap_key_for_recipient(paar, blob, absender, version).ok())
        };

        if let Some(record) = versuchen(&blob.sender_public_key) {
            return Some(record);
        }

        match self.directory.get_public_key(blob.from, false).await {
            Ok(Some(pk)) if pk != blob.sender_public_key => {
                if let Some(record) = versuchen(&pk) {
                    return Some(record);
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(user = %blob.from, fehler = %e, "Verzeichnis nicht erreichbar");
            }
        }

        // Nur ein tatsaechlich neuer Schluessel ist ein Ereignis. Sonst
        // wuerde jeder Fehlschlag die Versuchszaehler zuruecksetzen.
        match self.directory.neu_laden(blob.from).await {
            Ok((Some(pk), geaendert)) => {
                if geaendert {
                    self.ereignis_senden(SchluesselEreignis::PeerAktualisiert {
                        user_id: blob.from,
                    });
                }
                if pk != blob.sender_public_key {
                    if let Some(record) = versuchen(&pk) {
                        return Some(record);
                    }
                }
            }
            Ok((None, _)) => {}
            Err(e) => {
                tracing::warn!(user = %blob.from, fehler = %e, "Verzeichnis nicht erreichbar");
            }
        }
        None
    }

    /// Persistiert einen Epoch-Schluessel lokal und legt ihn in den Cache
    pub(crate) async fn schluessel_merken(
        &self,
        conversation_id: ConversationId,
        record: GroupKeyRecord,
    ) -> CryptoResult<()> {
        let version = record.version;
        let scope = KeyScope::GroupKey {
            user_id: self.user_id,
            conversation_id,
            version,
        };
        self.store.save(&scope, record.key_string.as_bytes()).await?;
        self.cache.put((conversation_id, version), record);
        self.ereignis_senden(SchluesselEreignis::SchluesselEingetroffen {
            conversation_id,
            version,
        });
        Ok(())
    }

    /// Versionen, fuer die ein Schluessel im lokalen Speicher liegt
    pub async fn lokale_versionen(
        &self,
        conversation_id: ConversationId,
    ) -> CryptoResult<Vec<u32>> {
        let praefix = KeyScope::gruppen_praefix(self.user_id, conversation_id);
        let mut versionen: Vec<u32> = self
            .store
            .list(&praefix)
            .await?
            .iter()
            .filter_map(|pfad| KeyScope::version_aus_pfad(pfad))
            .collect();
        versionen.sort_unstable();
        versionen.dedup();
        Ok(versionen)
    }

    // -----------------------------------------------------------------------
    // Nachrichten
    // -----------------------------------------------------------------------

    /// Verschluesselt fuer eine Epoch (normalerweise die aktuelle)
    pub async fn encrypt_message(
        &self,
        conversation_id: ConversationId,
        version: u32,
        plaintext: &[u8],
    ) -> CryptoResult<Envelope> {
        let record = self.ensure_group_key(conversation_id, version).await?;
        envelope::seal(
            plaintext,
            &record.key,
            &EnvelopeKontext::gruppe(version, self.config.algorithmus),
        )
    }

    /// Entschluesselt eine Gruppennachricht.
    ///
    /// Ohne `keyVersion` im Envelope gilt `version_beim_senden`. Jeder
    /// Fehlschlag wird zu [`CryptoError::DecryptionUnresolved`].
    pub async fn decrypt_message(
        &self,
        conversation_id: ConversationId,
        version_beim_senden: u32,
        env: &Envelope,
    ) -> CryptoResult<Vec<u8>> {
        let version = env.key_version.unwrap_or(version_beim_senden);
        if version == 0 {
            return Err(CryptoError::DecryptionUnresolved {
                grund: "Nachricht ohne Epoch in unverschluesselter Gruppe".into(),
            });
        }

        let record = self
            .ensure_group_key(conversation_id, version)
            .await
            .map_err(|e| CryptoError::DecryptionUnresolved {
                grund: e.to_string(),
            })?;
        envelope::open(env, &record.key).map_err(|e| CryptoError::DecryptionUnresolved {
            grund: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
