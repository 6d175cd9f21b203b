#![warn(missing_docs)]

//! ofswitch dataplane runtime: lockless SPSC rings, lcore roles,
//! fifoness dispatch, and the busy-poll RX/worker/TX pipeline.

pub mod affinity;
pub mod classifier;
pub mod config;
pub mod error;
pub mod io;
pub mod lcore;
pub mod ring;
pub mod runtime;
pub mod worker;

pub use classifier::select_worker;
pub use config::{DataplaneConfig, Fifoness};
pub use error::{DataplaneError, DataplaneResult};
pub use lcore::{LcoreAssignment, LcoreRole};
pub use ring::{ring, RingConsumer, RingProducer};
pub use runtime::PipelineRuntime;
