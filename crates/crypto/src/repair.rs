//! Reparatur der Schluessel-Historie
//!
//! Zwei Ablaeufe, beide nur fuer Eigentuemer und Admins:
//! - **Backfill**: Epochen, die lokal vorliegen, auf dem Server aber ganz
//!   fehlen, werden mit frischen Wraps hochgeladen.
//! - **Patch**: Mitgliedern, denen fuer eine Epoch der Wrap fehlt, wird er
//!   nachgereicht (ein Patch pro Mitglied).
//!
//! Jede (Unterhaltung, Version, Ablauf)-Kombination wird pro Prozess nur
//! einmal versucht. Ein Durchlauf pro Unterhaltung gleichzeitig; geplante
//! Durchlaeufe werden entprellt.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use fluester_core::{ConversationId, UserId};
use tokio::task::JoinHandle;

use crate::config::HistorienFreigabe;
use crate::error::CryptoResult;
use crate::key_manager::GroupEpochManager;
use crate::server::KeyServer;
use crate::types::{ConversationRecord, WrappedKeyBlob, WrappedKeyMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Ablauf {
    Backfill,
    Patch,
}

/// Ergebnis eines Reparatur-Durchlaufs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReparaturBericht {
    /// Epochen, die per Upsert hochgeladen wurden
    pub hochgeladene_epochen: Vec<u32>,
    /// Anzahl neu angelegter Wraps per Patch
    pub gepatchte_wraps: usize,
    /// Kein Durchlauf (laeuft schon, oder keine Verwaltungsrechte)
    pub uebersprungen: bool,
}

/// Entfernt die Unterhaltung beim Verlassen des Durchlaufs aus `laufend`
struct LaufSperre<'a> {
    laufend: &'a DashSet<ConversationId>,
    conversation_id: ConversationId,
}

impl Drop for LaufSperre<'_> {
    fn drop(&mut self) {
        self.laufend.remove(&self.conversation_id);
    }
}

/// Hintergrund-Abgleich der Epoch-Historie mit dem Server
pub struct KeyHistoryRepairAgent {
    manager: Arc<GroupEpochManager>,
    server: Arc<dyn KeyServer>,
    versucht: DashSet<(ConversationId, u32, Ablauf)>,
    laufend: DashSet<ConversationId>,
    /// Zaehler fuer das Entprellen geplanter Durchlaeufe
    generation: DashMap<ConversationId, u64>,
    verzoegerung: Duration,
}

impl KeyHistoryRepairAgent {
    pub fn new(manager: Arc<GroupEpochManager>, server: Arc<dyn KeyServer>) -> Self {
        let verzoegerung = manager.config().reparatur_verzoegerung();
        Self {
            manager,
            server,
            versucht: DashSet::new(),
            laufend: DashSet::new(),
            generation: DashMap::new(),
            verzoegerung,
        }
    }

    /// Einmal-Versuch fuer diese Kombination reservieren
    fn reservieren(&self, conversation_id: ConversationId, version: u32, ablauf: Ablauf) -> bool {
        self.versucht.insert((conversation_id, version, ablauf))
    }

    /// Vergisst alle bisherigen Versuche (z.B. nach einer Neuanmeldung)
    pub fn versuche_vergessen(&self) {
        self.versucht.clear();
    }

    /// Laedt lokal vorhandene Epochen hoch, von denen der Server nichts weiss
    pub async fn backfill(&self, gruppe: &ConversationRecord) -> CryptoResult<Vec<u32>> {
        let user_id = self.manager.user_id();
        if !gruppe.ist_administrator(user_id) {
            return Ok(Vec::new());
        }

        let mut hochgeladen = Vec::new();
        for version in self.manager.lokale_versionen(gruppe.id).await? {
            if version == 0
                || version > gruppe.key_version
                || gruppe.encrypted_keys_by_version.contains_key(&version)
            {
                continue;
            }
            if !self.reservieren(gruppe.id, version, Ablauf::Backfill) {
                continue;
            }

            match self.epoche_hochladen(gruppe, version).await {
                Ok(true) => hochgeladen.push(version),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(conversation = %gruppe.id, version, fehler = %e, "Backfill fehlgeschlagen");
                }
            }
        }
        Ok(hochgeladen)
    }

    async fn epoche_hochladen(&self, gruppe: &ConversationRecord, version: u32) -> CryptoResult<bool> {
        let record = self.manager.ensure_group_key(gruppe.id, version).await?;
        let mut wraps = WrappedKeyMap::new();
        for mitglied in &gruppe.members {
            match self.manager.wrap_fuer_mitglied(*mitglied, &record).await? {
                Some(blob) => {
                    wraps.insert(*mitglied, blob);
                }
                None => {
                    tracing::debug!(conversation = %gruppe.id, version, user = %mitglied, "Mitglied ohne oeffentlichen Schluessel");
                }
            }
        }
        if wraps.is_empty() {
            return Ok(false);
        }

        let eingefuegt = self
            .server
            .upsert_key_history(self.manager.user_id(), gruppe.id, version, wraps)
            .await?;
        if eingefuegt {
            tracing::info!(conversation = %gruppe.id, version, "Epoch auf dem Server nachgetragen");
        }
        Ok(eingefuegt)
    }

    /// Reicht fehlende Wraps einzelner Mitglieder nach
    pub async fn patch_missing(&self, gruppe: &ConversationRecord) -> CryptoResult<usize> {
        let user_id = self.manager.user_id();
        if !gruppe.ist_administrator(user_id) || !gruppe.ist_verschluesselt() {
            return Ok(0);
        }

        let erste = match self.manager.config().historien_freigabe {
            HistorienFreigabe::Voll => 1,
            HistorienFreigabe::AbBeitritt => gruppe.key_version,
        };

        let mut fehlend: BTreeMap<UserId, BTreeMap<u32, WrappedKeyBlob>> = BTreeMap::new();
        for version in erste..=gruppe.key_version {
            let ohne_wrap: Vec<UserId> = gruppe
                .members
                .iter()
                .copied()
                .filter(|m| gruppe.wrap_fuer(version, *m).is_none())
                .collect();
            if ohne_wrap.is_empty() || !self.reservieren(gruppe.id, version, Ablauf::Patch) {
                continue;
            }

            let record = match self.manager.ensure_group_key(gruppe.id, version).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(conversation = %gruppe.id, version, fehler = %e, "Epoch fuer Patch nicht verfuegbar");
                    continue;
                }
            };
            let mut voruebergehend = false;
            for mitglied in ohne_wrap {
                match self.manager.wrap_fuer_mitglied(mitglied, &record).await {
                    Ok(Some(blob)) => {
                        fehlend.entry(mitglied).or_default().insert(version, blob);
                    }
                    Ok(None) => {
                        tracing::debug!(conversation = %gruppe.id, version, user = %mitglied, "Mitglied ohne oeffentlichen Schluessel");
                    }
                    Err(e) => {
                        voruebergehend |= e.ist_wiederholbar();
                        tracing::warn!(conversation = %gruppe.id, version, user = %mitglied, fehler = %e, "Wrap fuer Patch fehlgeschlagen");
                    }
                }
            }
            // Transportfehler: Version fuer den naechsten Durchlauf freigeben
            if voruebergehend {
                self.versucht.remove(&(gruppe.id, version, Ablauf::Patch));
            }
        }

        let mut gepatcht = 0;
        for (mitglied, versionen) in fehlend {
            match self
                .server
                .patch_user_key_history(user_id, gruppe.id, mitglied, versionen)
                .await
            {
                Ok(neu) => gepatcht += neu,
                Err(e) => {
                    // Die Luecke bleibt fuer den naechsten Durchlauf
                    tracing::warn!(conversation = %gruppe.id, user = %mitglied, fehler = %e, "Patch fehlgeschlagen");
                }
            }
        }
        if gepatcht > 0 {
            tracing::info!(conversation = %gruppe.id, wraps = gepatcht, "Fehlende Wraps nachgereicht");
        }
        Ok(gepatcht)
    }

    /// Ein vollstaendiger Durchlauf (Backfill, dann Patch)
    pub async fn reparatur_durchlauf(
        &self,
        conversation_id: ConversationId,
    ) -> CryptoResult<ReparaturBericht> {
        if !self.laufend.insert(conversation_id) {
            tracing::debug!(conversation = %conversation_id, "Reparatur laeuft bereits");
            return Ok(ReparaturBericht {
                uebersprungen: true,
                ..ReparaturBericht::default()
            });
        }
        let _sperre = LaufSperre {
            laufend: &self.laufend,
            conversation_id,
        };

        let mut gruppe = self.manager.gruppe_laden(conversation_id).await?;
        if !gruppe.ist_administrator(self.manager.user_id()) {
            return Ok(ReparaturBericht {
                uebersprungen: true,
                ..ReparaturBericht::default()
            });
        }

        let hochgeladene_epochen = self.backfill(&gruppe).await?;
        if !hochgeladene_epochen.is_empty() {
            gruppe = self.manager.gruppe_laden(conversation_id).await?;
        }
        let gepatchte_wraps = self.patch_missing(&gruppe).await?;

        Ok(ReparaturBericht {
            hochgeladene_epochen,
            gepatchte_wraps,
            uebersprungen: false,
        })
    }

    /// Plant einen entprellten Durchlauf. Ein erneutes Planen innerhalb der
    /// Verzoegerung ersetzt den vorherigen.
    pub fn planen(self: &Arc<Self>, conversation_id: ConversationId) -> JoinHandle<()> {
        let generation = {
            let mut eintrag = self.generation.entry(conversation_id).or_insert(0);
            *eintrag += 1;
            *eintrag
        };

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(agent.verzoegerung).await;
            let aktuell = agent
                .generation
                .get(&conversation_id)
                .map(|g| *g)
                .unwrap_or(0);
            if aktuell != generation {
                return;
            }

            match agent.reparatur_durchlauf(conversation_id).await {
                Ok(bericht) => {
                    tracing::debug!(conversation = %conversation_id, ?bericht, "Reparatur abgeschlossen");
                }
                Err(e) => {
                    tracing::warn!(conversation = %conversation_id, fehler = %e, "Reparatur fehlgeschlagen");
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
