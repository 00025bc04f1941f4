//! Schluessel-Ereignisse
//!
//! Ereignisse, nach denen sich ein erneuter Entschluesselungs-Versuch lohnt.
//! Der Client verteilt sie ueber einen tokio-Broadcast-Kanal; die
//! Retry-Warteschlange setzt daraufhin die Zaehler betroffener Nachrichten zurueck.

use crate::types::{ConversationId, UserId};
use serde::{Deserialize, Serialize};

/// Aenderungen am lokalen oder entfernten Schluesselzustand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchluesselEreignis {
    /// Die eigene Identitaet wurde rotiert (neuer Eintrag im KeyRing)
    IdentitaetRotiert { user_id: UserId },

    /// Neues Schluesselmaterial fuer eine Unterhaltung liegt vor
    /// (Epoch-Schluessel entpackt, Rotation, Reparatur)
    SchluesselEingetroffen {
        conversation_id: ConversationId,
        version: u32,
    },

    /// Der oeffentliche Schluessel eines Peers wurde erzwungen neu geladen
    PeerAktualisiert { user_id: UserId },
}

impl SchluesselEreignis {
    /// Gibt zurueck ob das Ereignis eine bestimmte Unterhaltung betrifft.
    ///
    /// Identitaets- und Peer-Ereignisse betreffen potentiell alle Unterhaltungen.
    pub fn betrifft(&self, conversation_id: ConversationId) -> bool {
        match self {
            Self::SchluesselEingetroffen {
                conversation_id: id,
                ..
            } => *id == conversation_id,
            Self::IdentitaetRotiert { .. } | Self::PeerAktualisiert { .. } => true,
        }
    }
}
