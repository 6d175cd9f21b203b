#![warn(missing_docs)]

//! ofswitch protocol subsystem: flowtable, flow cache, groups,
//! OpenFlow 1.3 match-and-action execution, and the switch object model
//! (interface, port, bridge).

pub mod bridge;
pub mod cache;
pub mod error;
pub mod execute;
pub mod flow;
pub mod flowdb;
pub mod group;
pub mod interface;
pub mod l2;
pub mod ofp;
pub mod packet_in;
pub mod port;
pub mod prefetch;

pub use bridge::Bridge;
pub use cache::{fingerprint, ActionPlan, CacheStats, FlowCache};
pub use error::{OfprotoError, OfprotoResult};
pub use execute::{Kernel, OutputSink, VecSink};
pub use flow::{Action, FlowEntry, FlowMatch, Instruction, SetField};
pub use flowdb::FlowDb;
pub use group::{Bucket, Group, GroupTable, GroupType};
pub use interface::Interface;
pub use packet_in::{PacketIn, PacketInQueue, PacketInReason};
pub use port::{Port, PortStats, PortTable};
