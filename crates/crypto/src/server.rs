//! Server-Schnittstelle des Krypto-Kerns
//!
//! Der Server speichert nur Ciphertext und eingewickelte Schluessel. Das
//! `KeyServer`-Trait beschreibt die Endpunkte, auf die sich der Kern stuetzt:
//!
//! | Methode                    | Endpunkt                                          |
//! |----------------------------|---------------------------------------------------|
//! | `publish_public_key`       | `POST /users/keys`                                |
//! | `fetch_public_key`         | `GET /users/{id}/public-key`                      |
//! | `create_group`             | `POST /conversations/group`                       |
//! | `fetch_conversation`       | `GET /conversations/{id}`                         |
//! | `add_member`               | `POST /conversations/{id}/add-member`             |
//! | `remove_member`            | `POST /conversations/{id}/remove-member`          |
//! | `upsert_key_history`       | `POST /conversations/{id}/key-history/upsert`     |
//! | `patch_user_key_history`   | `POST /conversations/{id}/key-history/patch-user` |
//!
//! `InMemoryKeyServer` implementiert die Atomaritaetsregeln des Servers und
//! dient Tests und der CLI als Gegenstelle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fluester_core::{ConversationId, FluesterError, Result, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{ConversationRecord, KeyHistory, PublicKey, WrappedKeyBlob, WrappedKeyMap};

/// Anfrage: Gruppe anlegen
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GruppenAnlage {
    pub member_ids: BTreeSet<UserId>,
    pub encrypted_keys: Option<WrappedKeyMap>,
    pub key_version: Option<u32>,
}

/// Anfrage: Mitglied hinzufuegen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitgliedHinzufuegen {
    pub user_id: UserId,
    pub encrypted_key_for_new_member: Option<WrappedKeyBlob>,
    #[serde(default)]
    pub encrypted_keys_for_new_member_by_version: BTreeMap<u32, WrappedKeyBlob>,
}

/// Anfrage: Mitglied entfernen (mit Rotation)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitgliedEntfernen {
    pub user_id: UserId,
    pub rotated_encrypted_keys: Option<WrappedKeyMap>,
    pub rotated_key_version: Option<u32>,
}

/// Server-Endpunkte, auf die sich der Krypto-Kern stuetzt.
///
/// `actor` ist der authentifizierte Aufrufer.
#[async_trait]
pub trait KeyServer: Send + Sync {
    /// Veroeffentlicht (oder ersetzt) den oeffentlichen Schluessel des Aufrufers
    async fn publish_public_key(&self, actor: UserId, public_key: &PublicKey) -> Result<()>;

    /// Aktueller oeffentlicher Schluessel; `None` wenn nie veroeffentlicht
    async fn fetch_public_key(&self, user_id: UserId) -> Result<Option<PublicKey>>;

    async fn create_group(&self, actor: UserId, anfrage: GruppenAnlage)
        -> Result<ConversationRecord>;

    async fn fetch_conversation(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationRecord>;

    /// Atomar: wird abgelehnt, wenn Schluesselmaterial der aktuellen Epoch fehlt
    async fn add_member(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        anfrage: MitgliedHinzufuegen,
    ) -> Result<ConversationRecord>;

    /// Atomare Rotation: Version und Wraps nur gemeinsam
    async fn remove_member(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        anfrage: MitgliedEntfernen,
    ) -> Result<ConversationRecord>;

    /// Fuegt eine komplette Epoch hinzu, falls sie fehlt. Gibt true zurueck wenn eingefuegt.
    async fn upsert_key_history(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        version: u32,
        encrypted_keys: WrappedKeyMap,
    ) -> Result<bool>;

    /// Ergaenzt fehlende Wraps eines Mitglieds. Gibt die Anzahl neuer Wraps zurueck.
    async fn patch_user_key_history(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
        versions: BTreeMap<u32, WrappedKeyBlob>,
    ) -> Result<usize>;
}

#[derive(Debug, Default)]
struct ServerZustand {
    public_keys: HashMap<UserId, PublicKey>,
    conversations: HashMap<ConversationId, ConversationRecord>,
}

/// In-Memory-Server mit Anfragezaehler und Fehlerinjektion
#[derive(Debug, Default)]
pub struct InMemoryKeyServer {
    zustand: Mutex<ServerZustand>,
    anfragen: AtomicUsize,
    injizierte_fehler: AtomicUsize,
    latenz_ms: AtomicU64,
}

impl InMemoryKeyServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anzahl bisher bearbeiteter Anfragen
    pub fn anfragen(&self) -> usize {
        self.anfragen.load(Ordering::SeqCst)
    }

    /// Die naechsten `anzahl` Anfragen schlagen mit einem Zeitlimit fehl
    pub fn fehler_injizieren(&self, anzahl: usize) {
        self.injizierte_fehler.store(anzahl, Ordering::SeqCst);
    }

    /// Direkter Blick auf einen Datensatz (ohne Anfragezaehlung)
    pub fn snapshot(&self, conversation_id: ConversationId) -> Option<ConversationRecord> {
        self.zustand.lock().conversations.get(&conversation_id).cloned()
    }

    /// Jede folgende Anfrage wartet so lange, bevor sie bearbeitet wird
    pub fn latenz_setzen(&self, latenz: Duration) {
        self.latenz_ms.store(latenz.as_millis() as u64, Ordering::SeqCst);
    }

    /// Simuliert einen verlorenen Wrap (z.B. nach fehlerhafter Migration)
    pub fn wrap_verlieren(&self, conversation_id: ConversationId, version: u32, user_id: UserId) {
        let mut zustand = self.zustand.lock();
        if let Some(record) = zustand.conversations.get_mut(&conversation_id) {
            if let Some(map) = record.encrypted_keys_by_version.get_mut(&version) {
                map.remove(&user_id);
            }
            if version == record.key_version {
                record.encrypted_keys.remove(&user_id);
            }
        }
    }

    /// Ersetzt den Wrap eines Mitglieds (z.B. durch einen unbrauchbaren)
    pub fn wrap_ersetzen(
        &self,
        conversation_id: ConversationId,
        version: u32,
        user_id: UserId,
        blob: WrappedKeyBlob,
    ) {
        let mut zustand = self.zustand.lock();
        if let Some(record) = zustand.conversations.get_mut(&conversation_id) {
            if version == record.key_version {
                record.encrypted_keys.insert(user_id, blob.clone());
            }
            record
                .encrypted_keys_by_version
                .entry(version)
                .or_default()
                .insert(user_id, blob);
        }
    }

    /// Simuliert eine Epoch, die nur noch lokal existiert
    pub fn epoche_verlieren(&self, conversation_id: ConversationId, version: u32) {
        let mut zustand = self.zustand.lock();
        if let Some(record) = zustand.conversations.get_mut(&conversation_id) {
            record.encrypted_keys_by_version.remove(&version);
            if version == record.key_version {
                record.encrypted_keys.clear();
            }
        }
    }

    async fn anfrage_beginnen(&self) -> Result<()> {
        self.anfragen.fetch_add(1, Ordering::SeqCst);
        let latenz = self.latenz_ms.load(Ordering::SeqCst);
        if latenz > 0 {
            tokio::time::sleep(Duration::from_millis(latenz)).await;
        }
        let verbleibend = self.injizierte_fehler.load(Ordering::SeqCst);
        if verbleibend > 0 {
            self.injizierte_fehler.store(verbleibend - 1, Ordering::SeqCst);
            return Err(FluesterError::Zeitlimit("injizierter Fehler".into()));
        }
        Ok(())
    }
}

fn gruppe_mut<'a>(
    zustand: &'a mut ServerZustand,
    actor: UserId,
    conversation_id: ConversationId,
    admin_noetig: bool,
) -> Result<&'a mut ConversationRecord> {
    let record = zustand
        .conversations
        .get_mut(&conversation_id)
        .ok_or_else(|| FluesterError::UnterhaltungNichtGefunden(conversation_id.to_string()))?;
    if admin_noetig && !record.ist_administrator(actor) {
        return Err(FluesterError::ZugriffVerweigert(format!(
            "{actor} verwaltet {conversation_id} nicht"
        )));
    }
    Ok(record)
}

#[async_trait]
impl KeyServer for InMemoryKeyServer {
    async fn publish_public_key(&self, actor: UserId, public_key: &PublicKey) -> Result<()> {
        self.anfrage_beginnen().await?;
        self.zustand.lock().public_keys.insert(actor, *public_key);
        Ok(())
    }

    async fn fetch_public_key(&self, user_id: UserId) -> Result<Option<PublicKey>> {
        self.anfrage_beginnen().await?;
        Ok(self.zustand.lock().public_keys.get(&user_id).copied())
    }

    async fn create_group(
        &self,
        actor: UserId,
        anfrage: GruppenAnlage,
    ) -> Result<ConversationRecord> {
        self.anfrage_beginnen().await?;

        let mut members = anfrage.member_ids;
        members.insert(actor);

        let (key_version, encrypted_keys) = match (anfrage.encrypted_keys, anfrage.key_version) {
            (Some(keys), Some(version)) if version >= 1 => {
                if let Some(fehlend) = members.iter().find(|m| !keys.contains_key(m)) {
                    return Err(FluesterError::Abgelehnt(format!(
                        "Kein eingewickelter Schluessel fuer {fehlend}"
                    )));
                }
                (version, keys)
            }
            (None, None) => (0, WrappedKeyMap::new()),
            _ => {
                return Err(FluesterError::UngueltigeAnfrage(
                    "encryptedKeys und keyVersion nur gemeinsam".into(),
                ))
            }
        };

        let mut history = KeyHistory::new();
        if key_version > 0 {
            history.insert(key_version, encrypted_keys.clone());
        }

        let record = ConversationRecord {
            id: ConversationId::new(),
            members,
            owner: actor,
            admins: [actor].into_iter().collect(),
            key_version,
            encrypted_keys,
            encrypted_keys_by_version: history,
        };
        self.zustand
            .lock()
            .conversations
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn fetch_conversation(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationRecord> {
        self.anfrage_beginnen().await?;
        let mut record = self
            .zustand
            .lock()
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| FluesterError::UnterhaltungNichtGefunden(conversation_id.to_string()))?;

        // Ehemalige Mitglieder sehen nur Wraps, die fuer sie bestimmt waren
        if !record.ist_mitglied(actor) {
            record.encrypted_keys.retain(|u, _| *u == actor);
            for map in record.encrypted_keys_by_version.values_mut() {
                map.retain(|u, _| *u == actor);
            }
        }
        Ok(record)
    }

    async fn add_member(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        anfrage: MitgliedHinzufuegen,
    ) -> Result<ConversationRecord> {
        self.anfrage_beginnen().await?;
        let mut zustand = self.zustand.lock();
        let record = gruppe_mut(&mut zustand, actor, conversation_id, true)?;

        if record.ist_mitglied(anfrage.user_id) {
            return Err(FluesterError::UngueltigeAnfrage(format!(
                "{} ist bereits Mitglied",
                anfrage.user_id
            )));
        }

        let aktuell = record.key_version;
        if aktuell > 0 {
            let Some(blob) = anfrage.encrypted_key_for_new_member else {
                return Err(FluesterError::Abgelehnt(
                    "Schluesselmaterial der aktuellen Epoch fehlt".into(),
                ));
            };
            record
                .encrypted_keys
                .entry(anfrage.user_id)
                .or_insert_with(|| blob.clone());
            record
                .encrypted_keys_by_version
                .entry(aktuell)
                .or_default()
                .entry(anfrage.user_id)
                .or_insert(blob);

            for (version, blob) in anfrage.encrypted_keys_for_new_member_by_version {
                if version == 0 || version > aktuell {
                    continue;
                }
                record
                    .encrypted_keys_by_version
                    .entry(version)
                    .or_default()
                    .entry(anfrage.user_id)
                    .or_insert(blob);
            }
        }

        record.members.insert(anfrage.user_id);
        Ok(record.clone())
    }

    async fn remove_member(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        anfrage: MitgliedEntfernen,
    ) -> Result<ConversationRecord> {
        self.anfrage_beginnen().await?;
        let mut zustand = self.zustand.lock();
        let record = gruppe_mut(&mut zustand, actor, conversation_id, true)?;

        if !record.ist_mitglied(anfrage.user_id) {
            return Err(FluesterError::UngueltigeAnfrage(format!(
                "{} ist kein Mitglied",
                anfrage.user_id
            )));
        }

        let verbleibend: BTreeSet<UserId> = record
            .members
            .iter()
            .copied()
            .filter(|m| *m != anfrage.user_id)
            .collect();

        if record.key_version > 0 {
            let (Some(keys), Some(version)) =
                (anfrage.rotated_encrypted_keys, anfrage.rotated_key_version)
            else {
                return Err(FluesterError::Abgelehnt(
                    "Rotation erfordert rotatedEncryptedKeys und rotatedKeyVersion".into(),
                ));
            };
            if version != record.key_version + 1 {
                return Err(FluesterError::Abgelehnt(format!(
                    "Rotationsversion {version} folgt nicht auf {}",
                    record.key_version
                )));
            }
            if keys.contains_key(&anfrage.user_id) {
                return Err(FluesterError::Abgelehnt(
                    "Rotierter Schluessel darf nicht fuer das entfernte Mitglied gelten".into(),
                ));
            }
            if let Some(fehlend) = verbleibend.iter().find(|m| !keys.contains_key(m)) {
                return Err(FluesterError::Abgelehnt(format!(
                    "Kein rotierter Schluessel fuer {fehlend}"
                )));
            }

            record.key_version = version;
            record.encrypted_keys = keys.clone();
            record.encrypted_keys_by_version.entry(version).or_insert(keys);
        }

        record.members = verbleibend;
        record.admins.remove(&anfrage.user_id);
        Ok(record.clone())
    }

    async fn upsert_key_history(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        version: u32,
        encrypted_keys: WrappedKeyMap,
    ) -> Result<bool> {
        self.anfrage_beginnen().await?;
        let mut zustand = self.zustand.lock();
        let record = gruppe_mut(&mut zustand, actor, conversation_id, true)?;

        if version == 0 || version > record.key_version {
            return Err(FluesterError::UngueltigeAnfrage(format!(
                "Version {version} liegt ausserhalb 1..={}",
                record.key_version
            )));
        }
        if record.encrypted_keys_by_version.contains_key(&version) {
            return Ok(false);
        }

        if version == record.key_version {
            for (user, blob) in &encrypted_keys {
                record.encrypted_keys.entry(*user).or_insert_with(|| blob.clone());
            }
        }
        record.encrypted_keys_by_version.insert(version, encrypted_keys);
        Ok(true)
    }

    async fn patch_user_key_history(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
        versions: BTreeMap<u32, WrappedKeyBlob>,
    ) -> Result<usize> {
        self.anfrage_beginnen().await?;
        let mut zustand = self.zustand.lock();
        let record = gruppe_mut(&mut zustand, actor, conversation_id, true)?;

        if !record.ist_mitglied(user_id) {
            return Err(FluesterError::UngueltigeAnfrage(format!(
                "{user_id} ist kein Mitglied"
            )));
        }

        let mut neu = 0;
        for (version, blob) in versions {
            if version == 0 || version > record.key_version {
                continue;
            }
            if version == record.key_version {
                record
                    .encrypted_keys
                    .entry(user_id)
                    .or_insert_with(|| blob.clone());
            }
            let map = record.encrypted_keys_by_version.entry(version).or_default();
            if !map.contains_key(&user_id) {
                map.insert(user_id, blob);
                neu += 1;
            }
        }
        Ok(neu)
    }
}
