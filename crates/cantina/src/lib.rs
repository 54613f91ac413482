//! CantinaOS - real-time orchestration core for an interactive animatronic
//! DJ character.
//!
//! A dozen long-lived services coordinate around one in-process event bus
//! (`cantinabus`) and a global IDLE / AMBIENT / INTERACTIVE mode machine:
//! voice capture and dialog, music playback with ducking and crossfade, a
//! DJ auto-sequencer with generated commentary, an LED controller on a
//! serial link, and a web bridge for browser dashboards (`marquee`).

pub mod dispatch;
pub mod dj;
pub mod eyelights;
pub mod logsink;
pub mod mode;
pub mod music;
pub mod supervisor;
pub mod telemetry;
pub mod voice;

pub use supervisor::{Collaborators, Supervisor};
