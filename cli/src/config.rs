//! CLI-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! Standardwerte, eine fehlende Datei ist kein Fehler.

use std::path::PathBuf;

use fluester_crypto::E2eeConfig;
use fluester_observability::LoggingConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub logging: LoggingConfig,
    pub speicher: SpeicherEinstellungen,
    pub e2ee: E2eeConfig,
}

/// Lokaler Schluessel-Speicher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeicherEinstellungen {
    /// Basisverzeichnis; jeder Benutzer bekommt ein Unterverzeichnis
    pub verzeichnis: PathBuf,
}

impl Default for SpeicherEinstellungen {
    fn default() -> Self {
        Self {
            verzeichnis: PathBuf::from(".fluester/schluessel"),
        }
    }
}

impl CliConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Logging ist hier noch nicht initialisiert
                eprintln!("Konfigurationsdatei '{pfad}' nicht gefunden, verwende Standardwerte");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluester_crypto::{AeadAlgorithm, HistorienFreigabe};
    use fluester_observability::LogFormat;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = CliConfig::default();
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.e2ee.max_entschluesselungs_versuche, 5);
        assert_eq!(cfg.speicher.verzeichnis, PathBuf::from(".fluester/schluessel"));
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [logging]
            format = "json"

            [speicher]
            verzeichnis = "/tmp/fluester"

            [e2ee]
            historien_freigabe = "ab_beitritt"
            algorithmus = "chacha20-poly1305"
        "#;
        let cfg: CliConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.speicher.verzeichnis, PathBuf::from("/tmp/fluester"));
        assert_eq!(cfg.e2ee.historien_freigabe, HistorienFreigabe::AbBeitritt);
        assert_eq!(cfg.e2ee.algorithmus, AeadAlgorithm::ChaCha20Poly1305);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.e2ee.reparatur_verzoegerung_ms, 2000);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn fehlende_datei_ergibt_standard() {
        let cfg = CliConfig::laden("/nicht/vorhanden/fluester.toml").unwrap();
        assert_eq!(cfg.e2ee.rotation_versuche, 3);
    }

    #[test]
    fn kaputte_datei_ist_ein_fehler() {
        let dir = tempfile::tempdir().unwrap();
        let pfad = dir.path().join("fluester.toml");
        std::fs::write(&pfad, "[e2ee]\nrotation_versuche = \"viele\"").unwrap();
        assert!(CliConfig::laden(pfad.to_str().unwrap()).is_err());
    }
}
