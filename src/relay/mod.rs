//! Ingest → evaluate → dispatch pipeline for kiln temperature readings.

pub mod engine;
pub mod error;
pub mod handle;
pub mod reading;

pub use engine::{RelaySettings, RelayStatus, TemperatureAlertRelay};
pub use error::RelayError;
pub use handle::RelayHandle;
pub use reading::{Classification, SensorReading};
