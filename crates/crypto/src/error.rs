//! Fehlertypen fuer das Kryptografie-Subsystem

use fluester_core::{ConversationId, FluesterError, UserId};
use thiserror::Error;

/// Fehler im Kryptografie-Subsystem
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Ein Peer hat (noch) keinen oeffentlichen Schluessel veroeffentlicht.
    /// Die ausloesende Operation wird abgebrochen, nie auf Klartext herabgestuft.
    #[error("Kein oeffentlicher Schluessel fuer {user_id}: bitte den Empfaenger bitten, sich einmal anzumelden")]
    MissingRecipientKey { user_id: UserId },

    /// Alle Entschluesselungs-Strategien fuer eine Nachricht sind erschoepft
    #[error("Nachricht konnte nicht entschluesselt werden: {grund}")]
    DecryptionUnresolved { grund: String },

    /// Mitglieder-Aenderung abgebrochen, weil das Schluesselmaterial nicht
    /// rechtzeitig erzeugt werden konnte
    #[error("Schluesselrotation nach {versuche} Versuchen abgebrochen: {grund}")]
    KeyRotationRace { versuche: u32, grund: String },

    /// AEAD/ECDH-Primitive stehen nicht zur Verfuegung
    #[error("Kryptografie nicht verfuegbar: {0}")]
    CryptoUnavailable(String),

    #[error("Schluessel-Generierung fehlgeschlagen: {0}")]
    SchluesselGenerierung(String),

    #[error("Verschluesselung fehlgeschlagen: {0}")]
    Verschluesselung(String),

    #[error("Entschluesselung fehlgeschlagen: {0}")]
    Entschluesselung(String),

    #[error("Ungueltige Schluessel-Laenge: erwartet {erwartet}, erhalten {erhalten}")]
    UngueltigeSchluesselLaenge { erwartet: usize, erhalten: usize },

    #[error("Ungueltige Nonce-Laenge: erwartet {erwartet}, erhalten {erhalten}")]
    UngueltigeNonce { erwartet: usize, erhalten: usize },

    #[error("Feld '{feld}' zu lang: {laenge} Zeichen (Maximum: {max})")]
    FeldZuLang {
        feld: &'static str,
        laenge: usize,
        max: usize,
    },

    #[error("Ungueltige Daten: {0}")]
    UngueltigeDaten(String),

    #[error("Key Derivation fehlgeschlagen: {0}")]
    KeyDerivation(String),

    #[error("Kein Schluessel fuer {conversation_id} (Version {version})")]
    KeinSchluessel {
        conversation_id: ConversationId,
        version: u32,
    },

    #[error("Keine lokale Identitaet fuer {0}: zuerst anmelden")]
    KeineIdentitaet(UserId),

    #[error("Keine Berechtigung: {0}")]
    KeineBerechtigung(String),

    #[error("Server-Fehler: {0}")]
    Server(#[from] FluesterError),

    #[error("Base64-Dekodierung fehlgeschlagen: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Serialisierung fehlgeschlagen: {0}")]
    Serialisierung(#[from] serde_json::Error),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// Gibt true zurueck wenn ein erneuter Versuch sinnvoll ist
    /// (voruebergehende Netzwerkfehler beim Server).
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(self, Self::Server(e) if e.ist_wiederholbar())
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehlender_empfaenger_schluessel_ist_handlungsorientiert() {
        let e = CryptoError::MissingRecipientKey {
            user_id: UserId::new(),
        };
        assert!(e.to_string().contains("anzumelden"));
    }

    #[test]
    fn nur_transportfehler_sind_wiederholbar() {
        assert!(CryptoError::Server(FluesterError::Zeitlimit("x".into())).ist_wiederholbar());
        assert!(!CryptoError::Server(FluesterError::Abgelehnt("x".into())).ist_wiederholbar());
        assert!(!CryptoError::MissingRecipientKey {
            user_id: UserId::new()
        }
        .ist_wiederholbar());
    }
}
