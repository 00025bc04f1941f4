//! Begrenzte Entschluesselungs-Versuche
//!
//! Jede Nachricht bekommt hoechstens `max` Versuche. Danach bleibt sie als
//! Platzhalter stehen, bis ein [`SchluesselEreignis`] sie betrifft und ihren
//! Zaehler zuruecksetzt. Erfolgreich entschluesselte Nachrichten verlassen
//! die Warteschlange.

use dashmap::DashMap;
use fluester_core::{ConversationId, MessageId, SchluesselEreignis, UserId};

/// Zustand einer Nachricht in der Warteschlange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersuchStatus {
    /// Weitere Versuche erlaubt
    Ausstehend { versuche: u32 },
    /// Budget verbraucht, wartet auf ein Schluessel-Ereignis
    Erschoepft,
}

/// Retry-Zustand einer einzelnen Nachricht
#[derive(Debug, Clone)]
pub struct EntschluesselungsVersuch {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    /// Absender (fuer Peer-Ereignisse)
    pub sender: Option<UserId>,
    versuche: u32,
    max: u32,
}

impl EntschluesselungsVersuch {
    pub fn new(
        message_id: MessageId,
        conversation_id: ConversationId,
        sender: Option<UserId>,
        max: u32,
    ) -> Self {
        Self {
            message_id,
            conversation_id,
            sender,
            versuche: 0,
            max,
        }
    }

    pub fn darf_versuchen(&self) -> bool {
        self.versuche < self.max
    }

    pub fn versuche(&self) -> u32 {
        self.versuche
    }

    pub fn status(&self) -> VersuchStatus {
        if self.versuche >= self.max {
            VersuchStatus::Erschoepft
        } else {
            VersuchStatus::Ausstehend {
                versuche: self.versuche,
            }
        }
    }

    /// Zaehlt einen Versuch; false wenn das Budget schon verbraucht war
    fn beginnen(&mut self) -> bool {
        if !self.darf_versuchen() {
            return false;
        }
        self.versuche += 1;
        true
    }

    pub fn zuruecksetzen(&mut self) {
        self.versuche = 0;
    }

    /// Ob sich nach diesem Ereignis ein neuer Versuch lohnt
    pub fn betroffen_von(&self, ereignis: &SchluesselEreignis) -> bool {
        match ereignis {
            SchluesselEreignis::PeerAktualisiert { user_id } => self.sender == Some(*user_id),
            andere => andere.betrifft(self.conversation_id),
        }
    }
}

/// Alle Nachrichten, deren Entschluesselung noch aussteht
#[derive(Debug)]
pub struct RetryWarteschlange {
    eintraege: DashMap<MessageId, EntschluesselungsVersuch>,
    max: u32,
}

impl RetryWarteschlange {
    pub fn new(max: u32) -> Self {
        Self {
            eintraege: DashMap::new(),
            max,
        }
    }

    /// Meldet einen Versuch an. Gibt false zurueck, wenn das Budget verbraucht
    /// ist; der Aufrufer zeigt dann den Platzhalter ohne zu entschluesseln.
    pub fn versuch_starten(
        &self,
        message_id: MessageId,
        conversation_id: ConversationId,
        sender: Option<UserId>,
    ) -> bool {
        self.eintraege
            .entry(message_id)
            .or_insert_with(|| {
                EntschluesselungsVersuch::new(message_id, conversation_id, sender, self.max)
            })
            .beginnen()
    }

    /// Fehlschlag des laufenden Versuchs
    pub fn fehlschlag(&self, message_id: MessageId) -> Option<VersuchStatus> {
        let status = self.eintraege.get(&message_id).map(|e| e.status());
        if status == Some(VersuchStatus::Erschoepft) {
            tracing::debug!(message = %message_id, max = self.max, "Entschluesselungs-Versuche erschoepft");
        }
        status
    }

    pub fn erfolg(&self, message_id: MessageId) {
        self.eintraege.remove(&message_id);
    }

    /// Setzt die Zaehler aller betroffenen Nachrichten zurueck und gibt sie zurueck
    pub fn auf_ereignis(&self, ereignis: &SchluesselEreignis) -> Vec<MessageId> {
        let mut zurueckgesetzt = Vec::new();
        for mut eintrag in self.eintraege.iter_mut() {
            if eintrag.betroffen_von(ereignis) {
                eintrag.zuruecksetzen();
                zurueckgesetzt.push(*eintrag.key());
            }
        }
        if !zurueckgesetzt.is_empty() {
            tracing::debug!(anzahl = zurueckgesetzt.len(), ?ereignis, "Entschluesselungs-Zaehler zurueckgesetzt");
        }
        zurueckgesetzt
    }

    pub fn status(&self, message_id: MessageId) -> Option<VersuchStatus> {
        self.eintraege.get(&message_id).map(|e| e.status())
    }

    pub fn versuche(&self, message_id: MessageId) -> u32 {
        self.eintraege
            .get(&message_id)
            .map(|e| e.versuche())
            .unwrap_or(0)
    }

    /// Anzahl der Nachrichten, die noch auf einen Schluessel warten
    pub fn len(&self) -> usize {
        self.eintraege.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eintraege.is_empty()
    }
}
