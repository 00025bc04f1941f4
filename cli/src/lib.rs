//! fluester-cli – Konfiguration und Szenarien der Kommandozeile

pub mod config;
pub mod szenario;
