//! OpenFlow 1.3 wire constants used by the pipeline.

/// Largest assignable port number.
pub const OFPP_MAX: u32 = 0xffff_ff00;
/// Send back out the ingress port.
pub const OFPP_IN_PORT: u32 = 0xffff_fff8;
/// Re-submit to the pipeline's first table; packet-out only.
pub const OFPP_TABLE: u32 = 0xffff_fff9;
/// Forward with the learning-bridge (normal L2) semantics.
pub const OFPP_NORMAL: u32 = 0xffff_fffa;
/// Flood every port except the ingress and blocked ones.
pub const OFPP_FLOOD: u32 = 0xffff_fffb;
/// Send to every port except the ingress.
pub const OFPP_ALL: u32 = 0xffff_fffc;
/// Punt to the controller channel.
pub const OFPP_CONTROLLER: u32 = 0xffff_fffd;
/// The switch-local port; unused by this pipeline.
pub const OFPP_LOCAL: u32 = 0xffff_fffe;
/// Wildcard in requests; never a destination.
pub const OFPP_ANY: u32 = 0xffff_ffff;

/// Port is administratively down.
pub const OFPPC_PORT_DOWN: u32 = 1 << 0;
/// Drop everything received on the port.
pub const OFPPC_NO_RECV: u32 = 1 << 2;
/// Never forward out of this port.
pub const OFPPC_NO_FWD: u32 = 1 << 5;
/// Do not send packet-in messages for this port.
pub const OFPPC_NO_PACKET_IN: u32 = 1 << 6;

/// No physical link.
pub const OFPPS_LINK_DOWN: u32 = 1 << 0;
/// Blocked by a protocol outside OpenFlow.
pub const OFPPS_BLOCKED: u32 = 1 << 1;
/// Live for fast-failover selection.
pub const OFPPS_LIVE: u32 = 1 << 2;

/// Number of flow tables the pipeline provisions per bridge.
pub const N_FLOW_TABLES: usize = 8;

/// Goto-table and plan-walk depth bound.
pub const MAX_PIPELINE_DEPTH: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ports_above_max() {
        for p in [
            OFPP_IN_PORT,
            OFPP_TABLE,
            OFPP_NORMAL,
            OFPP_FLOOD,
            OFPP_ALL,
            OFPP_CONTROLLER,
            OFPP_LOCAL,
            OFPP_ANY,
        ] {
            assert!(p > OFPP_MAX);
        }
    }
}
