#![warn(missing_docs)]

//! ofswitch QoS subsystem: three-color markers, OpenFlow meters, egress
//! policers, and per-port priority queue scheduling.

pub mod clock;
pub mod error;
pub mod meter;
pub mod policer;
pub mod sched;
pub mod srtcm;
pub mod trtcm;

pub use clock::MeterClock;
pub use error::{QosError, QosResult};
pub use meter::{BandType, Meter, MeterBandConfig, MeterOutcome, MeterTable};
pub use policer::{Policer, PolicerActionKind, PolicerConfig};
pub use sched::{PortScheduler, QueueConfig, QueueRate};
pub use srtcm::{SrTcm, SrTcmConfig};
pub use trtcm::{TrTcm, TrTcmConfig};
