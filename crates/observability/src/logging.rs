//! Structured Logging Setup via tracing-subscriber
//!
//! Konfigurierbar per Datei (`[logging]`) und Umgebungsvariable:
//! - `FL_LOG_LEVEL`: Filter-Direktive (z.B. `info` oder `info,fluester_crypto=debug`), Standard: info
//! - `FL_LOG_FORMAT`: Format (text/json), Standard: text
//!
//! Umgebungsvariablen haben Vorrang vor der Datei.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

pub const ENV_LOG_LEVEL: &str = "FL_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "FL_LOG_FORMAT";

#[derive(Debug, thiserror::Error)]
pub enum LoggingFehler {
    #[error("Ungueltiger Log-Filter '{filter}': {grund}")]
    UngueltigerFilter { filter: String, grund: String },

    #[error("Unbekanntes Log-Format '{0}' (erlaubt: text, json)")]
    UnbekanntesFormat(String),

    #[error("Logging bereits initialisiert: {0}")]
    BereitsInitialisiert(String),
}

/// Ausgabeformat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingFehler;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            anderes => Err(LoggingFehler::UnbekanntesFormat(anderes.to_string())),
        }
    }
}

/// `[logging]`-Abschnitt der Konfiguration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Uebernimmt `FL_LOG_LEVEL` / `FL_LOG_FORMAT`, falls gesetzt
    pub fn mit_umgebung(self) -> Result<Self, LoggingFehler> {
        self.mit_quelle(|name| std::env::var(name).ok())
    }

    fn mit_quelle(
        mut self,
        quelle: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, LoggingFehler> {
        if let Some(level) = quelle(ENV_LOG_LEVEL) {
            self.level = level;
        }
        if let Some(format) = quelle(ENV_LOG_FORMAT) {
            self.format = format.parse()?;
        }
        Ok(self)
    }

    pub fn filter(&self) -> Result<EnvFilter, LoggingFehler> {
        EnvFilter::try_new(&self.level).map_err(|e| LoggingFehler::UngueltigerFilter {
            filter: self.level.clone(),
            grund: e.to_string(),
        })
    }
}

/// Initialisiert den globalen Subscriber.
///
/// Darf pro Prozess nur einmal aufgerufen werden; ein zweiter Aufruf
/// liefert [`LoggingFehler::BereitsInitialisiert`].
pub fn logging_initialisieren(config: &LoggingConfig) -> Result<(), LoggingFehler> {
    let filter = config.filter()?;

    let ergebnis = match config.format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(true).try_init(),
    };
    ergebnis.map_err(|e| LoggingFehler::BereitsInitialisiert(e.to_string()))
}
