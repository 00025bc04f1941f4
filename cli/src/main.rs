//! Fluester CLI – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging und spielt die
//! E2EE-Szenarien durch (`fluester [dm|gruppe|alle]`).

use anyhow::Result;
use fluester_cli::{config::CliConfig, szenario};
use fluester_observability::logging_initialisieren;

#[tokio::main]
async fn main() -> Result<()> {
    // Konfigurationsdatei-Pfad aus Umgebungsvariable oder Standard
    let config_pfad = std::env::var("FLUESTER_CONFIG").unwrap_or_else(|_| "fluester.toml".into());

    // Konfiguration laden (Standardwerte falls Datei fehlt)
    let config = CliConfig::laden(&config_pfad)?;
    logging_initialisieren(&config.logging.clone().mit_umgebung()?)?;

    let auswahl: szenario::Szenario = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "alle".into())
        .parse()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        szenario = ?auswahl,
        speicher = %config.speicher.verzeichnis.display(),
        "Fluester CLI gestartet"
    );

    szenario::ausfuehren(auswahl, &config).await
}
