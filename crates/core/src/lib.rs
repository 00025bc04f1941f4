//! fluester-core – Gemeinsame Typen, Fehler und Ereignisse
//!
//! Dieses Crate stellt die Bausteine bereit, die der Krypto-Kern und die
//! Anwendung gemeinsam nutzen: ID-Newtypes, den Transport-Fehler und die
//! Schluessel-Ereignisse, die Entschluesselungs-Versuche zuruecksetzen.

pub mod error;
pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{FluesterError, Result};
pub use event::SchluesselEreignis;
pub use types::{ConversationId, MessageId, UserId};
