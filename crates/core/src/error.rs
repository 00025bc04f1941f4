//! Fehlertypen fuer Fluester
//!
//! Zentraler Fehler-Enum fuer alles, was beim Gespraech mit dem Server
//! schiefgehen kann. Das Krypto-Crate definiert eigene Fehler und
//! konvertiert diesen via `#[from]`.

use thiserror::Error;

/// Globaler Result-Alias fuer Fluester
pub type Result<T> = std::result::Result<T, FluesterError>;

/// Alle Fehler der Server-Schnittstelle
#[derive(Debug, Error)]
pub enum FluesterError {
    // --- Verbindung & Netzwerk ---
    #[error("Verbindung fehlgeschlagen: {0}")]
    Verbindung(String),

    #[error("Zeitlimit ueberschritten: {0}")]
    Zeitlimit(String),

    // --- Autorisierung ---
    #[error("Zugriff verweigert: {0}")]
    ZugriffVerweigert(String),

    // --- Ressourcen ---
    #[error("Unterhaltung nicht gefunden: {0}")]
    UnterhaltungNichtGefunden(String),

    // --- Anfragen ---
    #[error("Anfrage abgelehnt: {0}")]
    Abgelehnt(String),

    #[error("Ungueltige Anfrage: {0}")]
    UngueltigeAnfrage(String),
}

impl FluesterError {
    /// Gibt true zurueck wenn der Fehler wiederholbar sein koennte
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(self, Self::Zeitlimit(_) | Self::Verbindung(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = FluesterError::Abgelehnt("Schluesselmaterial fehlt".into());
        assert_eq!(e.to_string(), "Anfrage abgelehnt: Schluesselmaterial fehlt");
    }

    #[test]
    fn wiederholbar_erkennung() {
        assert!(FluesterError::Zeitlimit("test".into()).ist_wiederholbar());
        assert!(FluesterError::Verbindung("test".into()).ist_wiederholbar());
        assert!(!FluesterError::ZugriffVerweigert("test".into()).ist_wiederholbar());
        assert!(!FluesterError::Abgelehnt("test".into()).ist_wiederholbar());
    }
}
