//! # fluester-observability
//!
//! Structured Logging fuer Fluester via tracing-subscriber.
//! Text fuer Entwicklung, JSON fuer den Betrieb.

pub mod logging;

pub use logging::{logging_initialisieren, LogFormat, LoggingConfig, LoggingFehler};
