//! E2EE-Konfiguration
//!
//! Alle Felder haben Standardwerte; ein fehlender `[e2ee]`-Abschnitt in der
//! TOML-Datei ergibt das Standardverhalten.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::AeadAlgorithm;

/// Welche Epochen ein neues Mitglied erhaelt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistorienFreigabe {
    /// Alle Epochen 1..=aktuell: neue Mitglieder lesen den ganzen Verlauf
    #[default]
    Voll,
    /// Nur die aktuelle Epoch: Verlauf vor dem Beitritt bleibt verschlossen
    AbBeitritt,
}

/// Einstellungen des Krypto-Kerns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct E2eeConfig {
    /// Maximale Entschluesselungs-Versuche pro Nachricht bis zum naechsten Schluessel-Ereignis
    pub max_entschluesselungs_versuche: u32,
    /// Wartezeit bevor ein Reparatur-Durchlauf startet
    pub reparatur_verzoegerung_ms: u64,
    /// Versuche fuer das Erzeugen von Schluesselmaterial bei Mitglieder-Aenderungen
    pub rotation_versuche: u32,
    /// Basis-Wartezeit zwischen diesen Versuchen (linear steigend)
    pub rotation_backoff_ms: u64,
    pub historien_freigabe: HistorienFreigabe,
    /// AEAD fuer Nachrichten-Envelopes
    pub algorithmus: AeadAlgorithm,
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self {
            max_entschluesselungs_versuche: 5,
            reparatur_verzoegerung_ms: 2000,
            rotation_versuche: 3,
            rotation_backoff_ms: 250,
            historien_freigabe: HistorienFreigabe::Voll,
            algorithmus: AeadAlgorithm::Aes256Gcm,
        }
    }
}

impl E2eeConfig {
    pub fn reparatur_verzoegerung(&self) -> Duration {
        Duration::from_millis(self.reparatur_verzoegerung_ms)
    }

    /// Wartezeit vor dem `versuch`-ten Wiederholen (1-basiert)
    pub fn rotation_backoff(&self, versuch: u32) -> Duration {
        Duration::from_millis(self.rotation_backoff_ms.saturating_mul(u64::from(versuch)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standardwerte() {
        let config = E2eeConfig::default();
        assert_eq!(config.max_entschluesselungs_versuche, 5);
        assert_eq!(config.reparatur_verzoegerung(), Duration::from_secs(2));
        assert_eq!(config.historien_freigabe, HistorienFreigabe::Voll);
    }

    #[test]
    fn teilweise_json_konfiguration() {
        let config: E2eeConfig = serde_json::from_str(
            r#"{"historien_freigabe": "ab_beitritt", "algorithmus": "chacha20-poly1305"}"#,
        )
        .unwrap();
        assert_eq!(config.historien_freigabe, HistorienFreigabe::AbBeitritt);
        assert_eq!(config.algorithmus, AeadAlgorithm::ChaCha20Poly1305);
        assert_eq!(config.rotation_versuche, 3);
    }

    #[test]
    fn backoff_steigt_linear() {
        let config = E2eeConfig::default();
        assert_eq!(config.rotation_backoff(1), Duration::from_millis(250));
        assert_eq!(config.rotation_backoff(3), Duration::from_millis(750));
    }
}
