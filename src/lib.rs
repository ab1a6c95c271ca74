//! Digitize rasterized 12-lead ECG images — scanned paper tracings, device
//! screenshots, photographs — into calibrated microvolt waveforms.
//!
//! The pipeline discovers grid geometry, segments the page into lead
//! panels, infers calibration from the 1 mV reference pulse, traces each
//! waveform pixel-by-pixel, and reconstructs uniformly sampled signals.
//! An optional large-vision-model oracle contributes panel labels and
//! layout hints; every oracle failure degrades softly to the rule-based
//! detectors.
//!
//! ```no_run
//! use ecg_digitizer::{Digitizer, DigitizerConfig, EcgImage};
//!
//! let image = EcgImage::from_rgba8(1200, 900, vec![255; 1200 * 900 * 4]).unwrap();
//! let digitizer = Digitizer::new(DigitizerConfig::default());
//! let outcome = digitizer.digitize(image);
//! if let Some(signal) = &outcome.signal {
//!     for (lead, samples) in &signal.leads {
//!         println!("{lead}: {} samples", samples.len());
//!     }
//! }
//! ```

pub mod baseline;
pub mod bits;
pub mod calibration;
pub mod config;
pub mod digitizer;
pub mod error;
pub mod geom;
pub mod grid;
pub mod image;
pub mod layout;
pub mod lead;
pub mod merge;
pub mod normalize;
pub mod oracle;
pub mod panel;
pub mod quality;
pub mod report;
pub mod signal;
pub mod trace;

pub use calibration::{Calibration, CalibrationSource};
pub use config::{CacheConfig, DigitizerConfig, OracleConfig, TracerConfig};
pub use digitizer::{CancelFlag, DigitizeInput, Digitizer};
pub use error::DigitizeError;
pub use geom::{Bounds, Color};
pub use grid::GridInfo;
pub use image::EcgImage;
pub use lead::Lead;
pub use panel::{EcgFormat, LeadSource, Panel};
pub use report::{DigitizeMethod, DigitizeOutcome, Issue, IssueCode, Severity, StageStatus};
pub use signal::EcgSignal;
