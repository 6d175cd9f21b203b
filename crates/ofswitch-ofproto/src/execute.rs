//! The match-and-action kernel.
//!
//! [`Kernel::process_batch`] runs the pipeline for one dequeued burst:
//! port and bridge resolution, standalone fallback, flow-cache probe,
//! flowtable match on miss, and instruction execution including meters,
//! groups, and every output form. Egress packets are handed to the
//! caller's [`OutputSink`]; the kernel never touches rings or drivers.

use std::sync::Arc;

use ofswitch_packet::headers::{
    self, classify, reclassify, ETHERTYPE_IP, ETHERTYPE_IPV6, ETH_HLEN, MPLS_HLEN, VLAN_HLEN,
};
use ofswitch_packet::meta::CSUM_RECALC_IPV4;
use ofswitch_packet::Mbuf;
use ofswitch_qos::{MeterClock, MeterOutcome};
use tracing::trace;

use crate::bridge::Bridge;
use crate::cache::{fingerprint, ActionPlan, FlowCache, PlanOp};
use crate::flow::{Action, SetField};
use crate::ofp::{
    MAX_PIPELINE_DEPTH, OFPP_ALL, OFPP_CONTROLLER, OFPP_FLOOD, OFPP_IN_PORT, OFPP_LOCAL,
    OFPP_MAX, OFPP_NORMAL, OFPP_TABLE,
};
use crate::packet_in::{PacketIn, PacketInReason};
use crate::port::{Port, PortTable};
use crate::prefetch::prefetch_read;

/// Where the kernel delivers egress packets. The dataplane implements
/// this with its TX pending arrays; tests collect into vectors.
pub trait OutputSink {
    /// Takes ownership of one packet destined for `port`.
    fn output(&mut self, port: Arc<Port>, m: Mbuf);
}

/// Collects (port index, packet) pairs; the test sink.
#[derive(Default)]
pub struct VecSink {
    /// Captured egress packets.
    pub packets: Vec<(u32, Mbuf)>,
}

impl OutputSink for VecSink {
    fn output(&mut self, port: Arc<Port>, m: Mbuf) {
        self.packets.push((port.index(), m));
    }
}

/// The action set accumulated by write-actions instructions, executed
/// when the pipeline ends without a goto.
#[derive(Default)]
struct ActionSet {
    copy_ttl_in: bool,
    pop_vlan: bool,
    pop_mpls: Option<u16>,
    pop_pbb: bool,
    push_mpls: Option<u16>,
    push_pbb: Option<u16>,
    push_vlan: Option<u16>,
    copy_ttl_out: bool,
    dec_mpls_ttl: bool,
    set_mpls_ttl: Option<u8>,
    dec_nw_ttl: bool,
    set_nw_ttl: Option<u8>,
    set_fields: Vec<SetField>,
    set_queue: Option<u32>,
    group: Option<u32>,
    output: Option<u32>,
}

impl ActionSet {
    fn write(&mut self, actions: &[Action]) {
        for a in actions {
            match *a {
                Action::CopyTtlIn => self.copy_ttl_in = true,
                Action::PopVlan => self.pop_vlan = true,
                Action::PopMpls(t) => self.pop_mpls = Some(t),
                Action::PopPbb => self.pop_pbb = true,
                Action::PushMpls(t) => self.push_mpls = Some(t),
                Action::PushPbb(t) => self.push_pbb = Some(t),
                Action::PushVlan(t) => self.push_vlan = Some(t),
                Action::CopyTtlOut => self.copy_ttl_out = true,
                Action::DecMplsTtl => self.dec_mpls_ttl = true,
                Action::SetMplsTtl(t) => self.set_mpls_ttl = Some(t),
                Action::DecNwTtl => self.dec_nw_ttl = true,
                Action::SetNwTtl(t) => self.set_nw_ttl = Some(t),
                Action::SetField(f) => self.set_fields.push(f),
                Action::SetQueue(q) => self.set_queue = Some(q),
                Action::Group(g) => self.group = Some(g),
                Action::Output(p) => self.output = Some(p),
            }
        }
    }

    fn clear(&mut self) {
        *self = ActionSet::default();
    }

    /// Expands into an action list in the OpenFlow action-set execution
    /// order. A group suppresses the output action.
    fn into_actions(self) -> Vec<Action> {
        let mut out = Vec::new();
        if self.copy_ttl_in {
            out.push(Action::CopyTtlIn);
        }
        if self.pop_vlan {
            out.push(Action::PopVlan);
        }
        if let Some(t) = self.pop_mpls {
            out.push(Action::PopMpls(t));
        }
        if self.pop_pbb {
            out.push(Action::PopPbb);
        }
        if let Some(t) = self.push_mpls {
            out.push(Action::PushMpls(t));
        }
        if let Some(t) = self.push_pbb {
            out.push(Action::PushPbb(t));
        }
        if let Some(t) = self.push_vlan {
            out.push(Action::PushVlan(t));
        }
        if self.copy_ttl_out {
            out.push(Action::CopyTtlOut);
        }
        if self.dec_mpls_ttl {
            out.push(Action::DecMplsTtl);
        }
        if let Some(t) = self.set_mpls_ttl {
            out.push(Action::SetMplsTtl(t));
        }
        if self.dec_nw_ttl {
            out.push(Action::DecNwTtl);
        }
        if let Some(t) = self.set_nw_ttl {
            out.push(Action::SetNwTtl(t));
        }
        for f in self.set_fields {
            out.push(Action::SetField(f));
        }
        if let Some(q) = self.set_queue {
            out.push(Action::SetQueue(q));
        }
        match (self.group, self.output) {
            (Some(g), _) => out.push(Action::Group(g)),
            (None, Some(p)) => out.push(Action::Output(p)),
            (None, None) => {}
        }
        out
    }
}

/// The worker-side pipeline kernel.
pub struct Kernel {
    ports: Arc<PortTable>,
    clock: MeterClock,
}

impl Kernel {
    /// Creates a kernel over the global port table.
    pub fn new(ports: Arc<PortTable>) -> Self {
        Self {
            ports,
            clock: MeterClock::new(),
        }
    }

    /// The kernel's meter clock; the TX path shares it so queue markers
    /// and meters agree on time.
    pub fn clock(&self) -> &MeterClock {
        &self.clock
    }

    /// Processes one dequeued burst through match-and-action.
    pub fn process_batch(
        &self,
        mbufs: Vec<Mbuf>,
        cache: &mut FlowCache,
        sink: &mut dyn OutputSink,
    ) {
        let mut iter = mbufs.into_iter().peekable();
        while let Some(mut m) = iter.next() {
            if let Some(next) = iter.peek() {
                prefetch_read(next.data());
            }
            let port = match self.ports.get(m.meta().in_port) {
                Some(p) => p,
                None => continue, // unknown ingress: drop
            };
            let bridge = match port.bridge() {
                Some(b) => b,
                None => {
                    port.counters()
                        .rx_dropped
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    continue;
                }
            };
            if !port.may_recv() {
                port.counters()
                    .rx_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            }
            classify(&mut m);

            if bridge.is_standalone() {
                self.forward_normal(&bridge, &port, m, sink);
                continue;
            }

            let generation = bridge.flowdb.generation();
            let fp = fingerprint(&m);
            let plan = match cache.lookup(fp, generation) {
                Some(plan) => plan,
                None => {
                    // Miss: match under the flowtable read lock, held
                    // only for this packet's resolution.
                    let guard = bridge.flowdb.read();
                    match guard.lookup(0, &m) {
                        Some(entry) => {
                            let plan = Arc::new(ActionPlan::materialize(entry));
                            cache.insert(fp, generation, Arc::clone(&plan));
                            plan
                        }
                        None => {
                            // Table miss with no miss entry: drop.
                            port.counters()
                                .rx_dropped
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            continue;
                        }
                    }
                }
            };
            self.execute_plan(&bridge, &port, &plan, m, sink);
        }
    }

    /// Executes a materialized plan, following goto-table chains.
    pub fn execute_plan(
        &self,
        bridge: &Arc<Bridge>,
        in_port: &Arc<Port>,
        plan: &ActionPlan,
        m: Mbuf,
        sink: &mut dyn OutputSink,
    ) {
        plan.entry.account(m.len() as u64);
        self.execute_ops(bridge, in_port, plan.ops.clone(), m, sink, 0);
    }

    fn execute_ops(
        &self,
        bridge: &Arc<Bridge>,
        in_port: &Arc<Port>,
        mut ops: Vec<PlanOp>,
        mut m: Mbuf,
        sink: &mut dyn OutputSink,
        mut depth: usize,
    ) {
        let mut set = ActionSet::default();
        'tables: loop {
            let mut goto_table: Option<u8> = None;
            for op in &ops {
                match op {
                    PlanOp::Meter(id) => {
                        let outcome = match bridge.meters.lookup(*id) {
                            Some(meter) => meter
                                .lock()
                                .meter_packet(self.clock.now_ns(), m.len() as u64),
                            None => MeterOutcome::Pass,
                        };
                        match outcome {
                            MeterOutcome::Drop => return,
                            MeterOutcome::Remark { prec_level } => {
                                raise_drop_precedence(&mut m, prec_level);
                            }
                            MeterOutcome::Pass | MeterOutcome::Experimenter { .. } => {}
                        }
                    }
                    PlanOp::Apply(actions) => {
                        m = match self.apply_actions(bridge, in_port, actions, m, sink, depth) {
                            Some(m) => m,
                            None => return,
                        };
                    }
                    PlanOp::ClearSet => set.clear(),
                    PlanOp::WriteSet(actions) => set.write(actions),
                    PlanOp::WriteMetadata { value, mask } => {
                        let meta = m.meta_mut();
                        meta.metadata = (meta.metadata & !mask) | (value & mask);
                    }
                    PlanOp::Goto(t) => goto_table = Some(*t),
                }
            }

            match goto_table {
                Some(t) => {
                    depth += 1;
                    if depth >= MAX_PIPELINE_DEPTH {
                        trace!("goto chain exceeded pipeline depth, dropping");
                        return;
                    }
                    let next = {
                        let guard = bridge.flowdb.read();
                        guard.lookup(t, &m)
                    };
                    match next {
                        Some(entry) => {
                            entry.account(m.len() as u64);
                            ops = ActionPlan::materialize(entry).ops;
                            continue 'tables;
                        }
                        None => return, // miss mid-pipeline: drop
                    }
                }
                None => break 'tables,
            }
        }

        // Pipeline over: run the accumulated action set.
        let actions = set.into_actions();
        if actions.is_empty() {
            return; // no output action anywhere: drop
        }
        let _ = self.apply_actions(bridge, in_port, &actions, m, sink, depth);
    }

    /// Applies an action list in order. Returns the packet unless an
    /// action consumed it (final output/group, drop, invalid TTL).
    fn apply_actions(
        &self,
        bridge: &Arc<Bridge>,
        in_port: &Arc<Port>,
        actions: &[Action],
        mut m: Mbuf,
        sink: &mut dyn OutputSink,
        depth: usize,
    ) -> Option<Mbuf> {
        let last = actions.len().saturating_sub(1);
        for (i, action) in actions.iter().enumerate() {
            match *action {
                Action::Output(port_no) => {
                    if i == last {
                        self.do_output(bridge, in_port, port_no, m, sink, depth);
                        return None;
                    }
                    let copy = m.copy();
                    self.do_output(bridge, in_port, port_no, copy, sink, depth);
                }
                Action::Group(group_id) => {
                    if i == last {
                        self.run_group(bridge, in_port, group_id, m, sink, depth);
                        return None;
                    }
                    let copy = m.copy();
                    self.run_group(bridge, in_port, group_id, copy, sink, depth);
                }
                Action::SetQueue(q) => m.meta_mut().queue_id = q,
                Action::SetField(f) => apply_set_field(&mut m, f),
                Action::PushVlan(tpid) => push_vlan(&mut m, tpid),
                Action::PopVlan => pop_vlan(&mut m),
                Action::PushMpls(ethertype) => push_mpls(&mut m, ethertype),
                Action::PopMpls(ethertype) => pop_mpls(&mut m, ethertype),
                Action::PushPbb(ethertype) => push_pbb(&mut m, ethertype),
                Action::PopPbb => pop_pbb(&mut m),
                Action::DecNwTtl => {
                    if !dec_nw_ttl(&mut m) {
                        // TTL exhausted: punt and drop.
                        bridge.packet_in.push(PacketIn {
                            reason: PacketInReason::InvalidTtl,
                            in_port: in_port.index(),
                            table_id: 0,
                            cookie: 0,
                            data: m.data().to_vec(),
                        });
                        return None;
                    }
                }
                Action::SetNwTtl(ttl) => set_nw_ttl(&mut m, ttl),
                Action::DecMplsTtl => {
                    let ttl = headers::mpls_ttl(&m).unwrap_or(0);
                    if ttl <= 1 {
                        return None;
                    }
                    headers::set_mpls_ttl(&mut m, ttl - 1);
                }
                Action::SetMplsTtl(ttl) => headers::set_mpls_ttl(&mut m, ttl),
                Action::CopyTtlOut => copy_ttl_out(&mut m),
                Action::CopyTtlIn => copy_ttl_in(&mut m),
            }
        }
        Some(m)
    }

    fn run_group(
        &self,
        bridge: &Arc<Bridge>,
        in_port: &Arc<Port>,
        group_id: u32,
        m: Mbuf,
        sink: &mut dyn OutputSink,
        depth: usize,
    ) {
        if depth >= MAX_PIPELINE_DEPTH {
            return;
        }
        let group = match bridge.groups.lookup(group_id) {
            Some(g) => g,
            None => return,
        };
        use crate::group::GroupType;
        let depth = depth + 1;
        match group.kind {
            GroupType::All => {
                if group.buckets.is_empty() {
                    return;
                }
                let last = group.buckets.len() - 1;
                for bucket in &group.buckets[..last] {
                    let copy = m.copy();
                    let _ = self.apply_actions(bridge, in_port, &bucket.actions, copy, sink, depth);
                }
                let _ = self.apply_actions(bridge, in_port, &group.buckets[last].actions, m, sink, depth);
            }
            GroupType::Select => {
                let hash = fingerprint(&m);
                if let Some(bucket) = group.select_bucket(hash) {
                    let _ = self.apply_actions(bridge, in_port, &bucket.actions, m, sink, depth);
                }
            }
            GroupType::Indirect => {
                if let Some(bucket) = group.buckets.first() {
                    let _ = self.apply_actions(bridge, in_port, &bucket.actions, m, sink, depth);
                }
            }
            GroupType::FastFailover => {
                for bucket in &group.buckets {
                    let alive = match bucket.watch_port {
                        Some(no) => bridge
                            .port_by_number(no)
                            .map(|p| p.is_live())
                            .unwrap_or(false),
                        None => true,
                    };
                    if alive {
                        let _ = self.apply_actions(bridge, in_port, &bucket.actions, m, sink, depth);
                        return;
                    }
                }
            }
        }
    }

    fn do_output(
        &self,
        bridge: &Arc<Bridge>,
        in_port: &Arc<Port>,
        port_no: u32,
        m: Mbuf,
        sink: &mut dyn OutputSink,
        depth: usize,
    ) {
        match port_no {
            OFPP_ALL | OFPP_FLOOD => self.flood(bridge, in_port.of_port_no(), m, sink),
            OFPP_CONTROLLER => {
                bridge.packet_in.push(PacketIn {
                    reason: PacketInReason::Action,
                    in_port: in_port.index(),
                    table_id: 0,
                    cookie: 0,
                    data: m.data().to_vec(),
                });
            }
            OFPP_NORMAL => self.forward_normal(bridge, in_port, m, sink),
            OFPP_IN_PORT => self.unicast(in_port.of_port_no(), bridge, m, sink),
            OFPP_TABLE => {
                // Packet-out resubmission: one pass through table 0.
                if depth >= MAX_PIPELINE_DEPTH {
                    return;
                }
                let entry = {
                    let guard = bridge.flowdb.read();
                    guard.lookup(0, &m)
                };
                if let Some(entry) = entry {
                    entry.account(m.len() as u64);
                    let ops = ActionPlan::materialize(entry).ops;
                    self.execute_ops(bridge, in_port, ops, m, sink, depth + 1);
                }
            }
            OFPP_LOCAL => {} // no local port on this pipeline
            n if n <= OFPP_MAX => self.unicast(n, bridge, m, sink),
            _ => {} // OFPP_ANY and friends are never destinations
        }
    }

    fn unicast(&self, number: u32, bridge: &Arc<Bridge>, m: Mbuf, sink: &mut dyn OutputSink) {
        match bridge.port_by_number(number) {
            Some(port) if port.may_forward() => sink.output(port, m),
            Some(port) => {
                port.counters()
                    .tx_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            None => {}
        }
    }

    fn flood(&self, bridge: &Arc<Bridge>, in_port_no: u32, m: Mbuf, sink: &mut dyn OutputSink) {
        let targets: Vec<Arc<Port>> = bridge
            .ports
            .iter()
            .filter(|e| *e.key() != in_port_no && e.value().may_forward())
            .map(|e| Arc::clone(e.value()))
            .collect();
        if targets.is_empty() {
            return;
        }
        let last = targets.len() - 1;
        for port in &targets[..last] {
            sink.output(Arc::clone(port), m.copy());
        }
        sink.output(Arc::clone(&targets[last]), m);
    }

    /// Learning-bridge forwarding: OFPP_NORMAL and the standalone mode.
    fn forward_normal(
        &self,
        bridge: &Arc<Bridge>,
        in_port: &Arc<Port>,
        m: Mbuf,
        sink: &mut dyn OutputSink,
    ) {
        if m.len() < ETH_HLEN {
            return;
        }
        let now = self.clock.now_ns();
        let vlan = headers::vlan_vid(&m).unwrap_or(0);
        let src = headers::eth_src(&m);
        let dst = headers::eth_dst(&m);
        let in_no = in_port.of_port_no();
        if src[0] & 1 == 0 {
            bridge.l2.learn(now, vlan, src, in_no);
        }
        if dst[0] & 1 != 0 {
            // Broadcast or multicast.
            self.flood(bridge, in_no, m, sink);
            return;
        }
        match bridge.l2.lookup(now, vlan, dst) {
            Some(no) if no == in_no => {} // hairpin: drop
            Some(no) => self.unicast(no, bridge, m, sink),
            None => self.flood(bridge, in_no, m, sink),
        }
    }
}

fn apply_set_field(m: &mut Mbuf, f: SetField) {
    match f {
        SetField::EthDst(mac) => headers::set_eth_dst(m, &mac),
        SetField::EthSrc(mac) => headers::set_eth_src(m, &mac),
        SetField::VlanVid(vid) => headers::set_vlan_vid(m, vid),
        SetField::VlanPcp(pcp) => headers::set_vlan_pcp(m, pcp),
        SetField::Ipv4Src(a) => {
            headers::set_ipv4_src(m, a);
            m.meta_mut().mark_l3_dirty();
        }
        SetField::Ipv4Dst(a) => {
            headers::set_ipv4_dst(m, a);
            m.meta_mut().mark_l3_dirty();
        }
        SetField::Ipv6Src(a) => {
            headers::set_ipv6_src(m, &a);
            m.meta_mut().mark_l3_dirty();
        }
        SetField::Ipv6Dst(a) => {
            headers::set_ipv6_dst(m, &a);
            m.meta_mut().mark_l3_dirty();
        }
        SetField::IpDscp(dscp) => {
            match m.meta().ether_type {
                ETHERTYPE_IP => headers::set_ipv4_dscp(m, dscp),
                ETHERTYPE_IPV6 => headers::set_ipv6_dscp(m, dscp),
                _ => {}
            }
            if m.meta().ether_type == ETHERTYPE_IP {
                m.meta_mut().csum_flags |= CSUM_RECALC_IPV4;
            }
        }
        SetField::L4Src(p) => {
            headers::set_l4_src_port(m, p);
            m.meta_mut().mark_l3_dirty();
        }
        SetField::L4Dst(p) => {
            headers::set_l4_dst_port(m, p);
            m.meta_mut().mark_l3_dirty();
        }
        SetField::MplsLabel(label) => headers::set_mpls_label(m, label),
        SetField::MplsTc(tc) => headers::set_mpls_tc(m, tc),
        SetField::Metadata(v) => m.meta_mut().metadata = v,
        SetField::TunnelId(v) => m.meta_mut().tunnel_id = v,
    }
}

/// DSCP remark from a meter band: raise the drop precedence, clamped to
/// the 6-bit field.
fn raise_drop_precedence(m: &mut Mbuf, prec_level: u8) {
    match m.meta().ether_type {
        ETHERTYPE_IP => {
            if let Some(dscp) = headers::ipv4_dscp(m) {
                headers::set_ipv4_dscp(m, (dscp + prec_level).min(63));
                m.meta_mut().csum_flags |= CSUM_RECALC_IPV4;
            }
        }
        ETHERTYPE_IPV6 => {
            if let Some(dscp) = headers::ipv6_dscp(m) {
                headers::set_ipv6_dscp(m, (dscp + prec_level).min(63));
            }
        }
        _ => {}
    }
}

fn push_vlan(m: &mut Mbuf, tpid: u16) {
    if m.len() < ETH_HLEN {
        return;
    }
    let existing_tci = if m.meta().vlan_depth > 0 {
        headers::be16(m.data(), ETH_HLEN)
    } else {
        0
    };
    if m.prepend(VLAN_HLEN).is_err() {
        m.meta_mut().drop = true;
        return;
    }
    let data = m.data_mut();
    // Move the MAC addresses forward, then splice the tag behind them.
    data.copy_within(VLAN_HLEN..VLAN_HLEN + 12, 0);
    headers::put_be16(data, 12, tpid);
    headers::put_be16(data, 14, existing_tci);
    reclassify(m);
}

fn pop_vlan(m: &mut Mbuf) {
    if m.meta().vlan_depth == 0 || m.len() < ETH_HLEN + VLAN_HLEN {
        return;
    }
    let data = m.data_mut();
    data.copy_within(0..12, VLAN_HLEN);
    let _ = m.adj(VLAN_HLEN);
    reclassify(m);
}

fn push_mpls(m: &mut Mbuf, ethertype: u16) {
    let hdr = headers::l2_payload_off(m.meta());
    if m.len() < hdr {
        return;
    }
    // Inherit label and TTL from an existing stack, else seed from IP.
    let (label, tc, ttl) = if m.meta().has_mpls {
        (
            headers::mpls_label(m).unwrap_or(0),
            headers::mpls_tc(m).unwrap_or(0),
            headers::mpls_ttl(m).unwrap_or(64),
        )
    } else {
        let ttl = match m.meta().ether_type {
            ETHERTYPE_IP => headers::ipv4_ttl(m).unwrap_or(64),
            ETHERTYPE_IPV6 => headers::ipv6_hop_limit(m).unwrap_or(64),
            _ => 64,
        };
        (0, 0, ttl)
    };
    let bos = !m.meta().has_mpls;
    if m.prepend(MPLS_HLEN).is_err() {
        m.meta_mut().drop = true;
        return;
    }
    let data = m.data_mut();
    data.copy_within(MPLS_HLEN..MPLS_HLEN + hdr, 0);
    // Rewrite the ethertype in front of the new stack entry.
    headers::put_be16(data, hdr - 2, ethertype);
    let word =
        (label & 0xfffff) << 12 | ((tc as u32 & 0x7) << 9) | ((bos as u32) << 8) | ttl as u32;
    headers::put_be32(data, hdr, word);
    reclassify(m);
}

fn pop_mpls(m: &mut Mbuf, ethertype: u16) {
    if !m.meta().has_mpls {
        return;
    }
    let hdr = headers::l2_payload_off(m.meta());
    if m.len() < hdr + MPLS_HLEN {
        return;
    }
    let data = m.data_mut();
    data.copy_within(0..hdr, MPLS_HLEN);
    let _ = m.adj(MPLS_HLEN);
    let hdr = headers::l2_payload_off(m.meta());
    headers::put_be16(m.data_mut(), hdr - 2, ethertype);
    reclassify(m);
}

/// Provider-backbone header: outer MACs, 0x88e7, and a 4-byte I-TAG.
const PBB_HLEN: usize = 18;

fn push_pbb(m: &mut Mbuf, ethertype: u16) {
    if m.len() < ETH_HLEN {
        return;
    }
    let dst = headers::eth_dst(m);
    let src = headers::eth_src(m);
    if m.prepend(PBB_HLEN).is_err() {
        m.meta_mut().drop = true;
        return;
    }
    let data = m.data_mut();
    data[0..6].copy_from_slice(&dst);
    data[6..12].copy_from_slice(&src);
    headers::put_be16(data, 12, ethertype);
    headers::put_be32(data, 14, 0); // I-TAG: zero I-SID until set
    reclassify(m);
}

fn pop_pbb(m: &mut Mbuf) {
    if m.meta().ether_type != headers::ETHERTYPE_PBB || m.len() < PBB_HLEN + ETH_HLEN {
        return;
    }
    let _ = m.adj(PBB_HLEN);
    reclassify(m);
}

/// Decrements the IP TTL. Returns false when the packet must not be
/// forwarded (TTL was 0 or 1).
fn dec_nw_ttl(m: &mut Mbuf) -> bool {
    match m.meta().ether_type {
        ETHERTYPE_IP => match headers::ipv4_ttl(m) {
            Some(ttl) if ttl > 1 => {
                headers::set_ipv4_ttl(m, ttl - 1);
                m.meta_mut().csum_flags |= CSUM_RECALC_IPV4;
                true
            }
            Some(_) => false,
            None => true,
        },
        ETHERTYPE_IPV6 => match headers::ipv6_hop_limit(m) {
            Some(hl) if hl > 1 => {
                headers::set_ipv6_hop_limit(m, hl - 1);
                true
            }
            Some(_) => false,
            None => true,
        },
        _ => true,
    }
}

fn set_nw_ttl(m: &mut Mbuf, ttl: u8) {
    match m.meta().ether_type {
        ETHERTYPE_IP => {
            headers::set_ipv4_ttl(m, ttl);
            m.meta_mut().csum_flags |= CSUM_RECALC_IPV4;
        }
        ETHERTYPE_IPV6 => headers::set_ipv6_hop_limit(m, ttl),
        _ => {}
    }
}

/// Copies the inner IP TTL outward into the MPLS stack entry.
fn copy_ttl_out(m: &mut Mbuf) {
    if !m.meta().has_mpls {
        return;
    }
    // The IP header behind the stack is not classified; refresh from
    // the values captured at push time is all the pipeline offers.
    if let Some(ttl) = headers::mpls_ttl(m) {
        headers::set_mpls_ttl(m, ttl);
    }
}

/// Copies the MPLS TTL inward to the IP header underneath, when the
/// bottom of stack is directly above it.
fn copy_ttl_in(m: &mut Mbuf) {
    if !m.meta().has_mpls {
        // Without MPLS this is between IP headers; single-IP packets
        // keep their TTL.
        return;
    }
    let Some(ttl) = headers::mpls_ttl(m) else {
        return;
    };
    if headers::mpls_bos(m) != Some(true) {
        return;
    }
    let ip_off = headers::l2_payload_off(m.meta()) + MPLS_HLEN;
    if m.len() <= ip_off {
        return;
    }
    let version = m.data()[ip_off] >> 4;
    match version {
        4 if m.len() >= ip_off + 20 => {
            m.data_mut()[ip_off + 8] = ttl;
        }
        6 if m.len() >= ip_off + 40 => {
            m.data_mut()[ip_off + 7] = ttl;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowEntry, FlowMatch, Instruction};
    use crate::packet_in::PacketInQueue;
    use ofswitch_packet::headers::IPPROTO_TCP;

    fn tcp_frame() -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]);
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        f.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());
        f.push(0x45);
        f.push(0);
        f.extend_from_slice(&40u16.to_be_bytes());
        f.extend_from_slice(&[0, 0, 0, 0]);
        f.push(64);
        f.push(IPPROTO_TCP);
        f.extend_from_slice(&[0, 0]);
        f.extend_from_slice(&0x0a000001u32.to_be_bytes());
        f.extend_from_slice(&0x0a000002u32.to_be_bytes());
        f.extend_from_slice(&1234u16.to_be_bytes());
        f.extend_from_slice(&80u16.to_be_bytes());
        f.extend_from_slice(&[0u8; 16]);
        f
    }

    struct Fixture {
        ports: Arc<PortTable>,
        bridge: Arc<Bridge>,
        kernel: Kernel,
    }

    /// Two-port bridge, controller mode, both links up.
    fn fixture() -> Fixture {
        let ports = Arc::new(PortTable::new(8));
        let bridge = Bridge::new("br0", 1, PacketInQueue::default());
        for name in ["p1", "p2"] {
            let p = ports.create(name).unwrap();
            p.set_link_up(true);
            bridge.attach_port(&p, 0).unwrap();
        }
        bridge.set_standalone(false);
        let kernel = Kernel::new(Arc::clone(&ports));
        Fixture {
            ports,
            bridge,
            kernel,
        }
    }

    fn ingress(fx: &Fixture, data: &[u8]) -> Mbuf {
        let mut m = Mbuf::from_slice(data);
        // Dataplane index of p1 is 0.
        m.meta_mut().in_port = fx.ports.get(0).unwrap().index();
        m
    }

    #[test]
    fn test_match_and_output() {
        let fx = fixture();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    10,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![Action::Output(2)])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert_eq!(sink.packets.len(), 1);
        // p2 has dataplane index 1.
        assert_eq!(sink.packets[0].0, 1);
    }

    #[test]
    fn test_table_miss_drops() {
        let fx = fixture();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert!(sink.packets.is_empty());
        let p1 = fx.ports.get(0).unwrap();
        assert_eq!(p1.stats().rx_dropped, 1);
    }

    #[test]
    fn test_cache_hit_on_second_packet() {
        let fx = fixture();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![Action::Output(2)])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel.process_batch(
            vec![ingress(&fx, &tcp_frame()), ingress(&fx, &tcp_frame())],
            &mut cache,
            &mut sink,
        );
        assert_eq!(sink.packets.len(), 2);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_flow_change_invalidates_cache() {
        let fx = fixture();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![Action::Output(2)])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        // Retarget the flow to drop (no actions).
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(1, FlowMatch::default(), vec![]),
            )
            .unwrap();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        // The second packet saw the new generation: no stale output.
        assert_eq!(sink.packets.len(), 1);
    }

    #[test]
    fn test_no_recv_port_drops() {
        let fx = fixture();
        let p1 = fx.ports.get(0).unwrap();
        p1.set_config_bits(crate::ofp::OFPPC_NO_RECV);
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert!(sink.packets.is_empty());
        assert_eq!(p1.stats().rx_dropped, 1);
    }

    #[test]
    fn test_standalone_floods_unknown_dst() {
        let fx = fixture();
        fx.bridge.set_standalone(true);
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        // Unknown unicast floods to the only other port.
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].0, 1);
    }

    #[test]
    fn test_standalone_learns_and_unicasts() {
        let fx = fixture();
        fx.bridge.set_standalone(true);
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();

        // First: A→B from p1, learns A on port 1, floods.
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        sink.packets.clear();

        // Reply B→A arriving on p2 must unicast to p1.
        let mut reply = tcp_frame();
        reply[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]); // dst = A
        reply[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]);
        let mut m = Mbuf::from_slice(&reply);
        m.meta_mut().in_port = 1;
        fx.kernel.process_batch(vec![m], &mut cache, &mut sink);
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].0, 0);
    }

    #[test]
    fn test_flood_copies_to_all_but_ingress() {
        let fx = fixture();
        // A third port to make flooding visible.
        let p3 = fx.ports.create("p3").unwrap();
        p3.set_link_up(true);
        fx.bridge.attach_port(&p3, 0).unwrap();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![Action::Output(OFPP_FLOOD)])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        let mut outs: Vec<u32> = sink.packets.iter().map(|(idx, _)| *idx).collect();
        outs.sort_unstable();
        assert_eq!(outs, vec![1, 2]);
    }

    #[test]
    fn test_output_controller_punts() {
        let fx = fixture();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![Action::Output(
                        OFPP_CONTROLLER,
                    )])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert!(sink.packets.is_empty());
        let punted = fx.bridge.packet_in.drain();
        assert_eq!(punted.len(), 1);
        assert_eq!(punted[0].reason, PacketInReason::Action);
    }

    #[test]
    fn test_goto_table_chains() {
        let fx = fixture();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![
                        Instruction::WriteMetadata {
                            value: 0x5,
                            mask: 0xf,
                        },
                        Instruction::GotoTable(1),
                    ],
                ),
            )
            .unwrap();
        fx.bridge
            .flowdb
            .add_flow(
                1,
                FlowEntry::new(
                    1,
                    FlowMatch {
                        metadata: Some((0x5, 0xf)),
                        ..Default::default()
                    },
                    vec![Instruction::ApplyActions(vec![Action::Output(2)])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert_eq!(sink.packets.len(), 1);
    }

    #[test]
    fn test_write_actions_run_at_pipeline_end() {
        let fx = fixture();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![
                        Instruction::WriteActions(vec![Action::Output(2)]),
                        Instruction::GotoTable(1),
                    ],
                ),
            )
            .unwrap();
        fx.bridge
            .flowdb
            .add_flow(
                1,
                FlowEntry::new(1, FlowMatch::default(), vec![]),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert_eq!(sink.packets.len(), 1);
    }

    #[test]
    fn test_vlan_push_pop_roundtrip() {
        let fx = fixture();
        let frame = tcp_frame();
        let mut m = Mbuf::from_slice(&frame);
        classify(&mut m);
        push_vlan(&mut m, headers::ETHERTYPE_VLAN);
        assert_eq!(m.meta().vlan_depth, 1);
        assert_eq!(m.len(), frame.len() + 4);
        assert_eq!(headers::vlan_vid(&m), Some(0));
        headers::set_vlan_vid(&mut m, 300);
        pop_vlan(&mut m);
        assert_eq!(m.meta().vlan_depth, 0);
        assert_eq!(m.data(), &frame[..]);
        let _ = fx;
    }

    #[test]
    fn test_mpls_push_preserves_ip_ttl() {
        let frame = tcp_frame();
        let mut m = Mbuf::from_slice(&frame);
        classify(&mut m);
        push_mpls(&mut m, headers::ETHERTYPE_MPLS);
        assert!(m.meta().has_mpls);
        assert_eq!(headers::mpls_ttl(&m), Some(64));
        assert_eq!(headers::mpls_bos(&m), Some(true));
        pop_mpls(&mut m, ETHERTYPE_IP);
        assert!(!m.meta().has_mpls);
        assert_eq!(m.data(), &frame[..]);
    }

    #[test]
    fn test_dec_ttl_exhaustion_punts() {
        let fx = fixture();
        let mut frame = tcp_frame();
        frame[22] = 1; // IPv4 TTL
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![
                        Action::DecNwTtl,
                        Action::Output(2),
                    ])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &frame)], &mut cache, &mut sink);
        assert!(sink.packets.is_empty());
        let punted = fx.bridge.packet_in.drain();
        assert_eq!(punted.len(), 1);
        assert_eq!(punted[0].reason, PacketInReason::InvalidTtl);
    }

    #[test]
    fn test_group_all_replicates() {
        let fx = fixture();
        let p3 = fx.ports.create("p3").unwrap();
        p3.set_link_up(true);
        fx.bridge.attach_port(&p3, 0).unwrap();
        fx.bridge
            .groups
            .add(crate::group::Group {
                group_id: 5,
                kind: crate::group::GroupType::All,
                buckets: vec![
                    crate::group::Bucket {
                        weight: 1,
                        watch_port: None,
                        actions: vec![Action::Output(2)],
                    },
                    crate::group::Bucket {
                        weight: 1,
                        watch_port: None,
                        actions: vec![Action::Output(3)],
                    },
                ],
            })
            .unwrap();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![Action::Group(5)])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert_eq!(sink.packets.len(), 2);
    }

    #[test]
    fn test_fast_failover_skips_dead_bucket() {
        let fx = fixture();
        let p2 = fx.bridge.port_by_number(2).unwrap();
        p2.set_link_up(false);
        let p3 = fx.ports.create("p3").unwrap();
        p3.set_link_up(true);
        fx.bridge.attach_port(&p3, 0).unwrap();
        fx.bridge
            .groups
            .add(crate::group::Group {
                group_id: 9,
                kind: crate::group::GroupType::FastFailover,
                buckets: vec![
                    crate::group::Bucket {
                        weight: 1,
                        watch_port: Some(2),
                        actions: vec![Action::Output(2)],
                    },
                    crate::group::Bucket {
                        weight: 1,
                        watch_port: Some(3),
                        actions: vec![Action::Output(3)],
                    },
                ],
            })
            .unwrap();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![Action::Group(9)])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert_eq!(sink.packets.len(), 1);
        // p3 has dataplane index 2.
        assert_eq!(sink.packets[0].0, 2);
    }

    #[test]
    fn test_meter_drop_band() {
        let fx = fixture();
        fx.bridge
            .meters
            .add(
                1,
                ofswitch_qos::meter::METER_FLAG_KBPS | ofswitch_qos::meter::METER_FLAG_STATS,
                &[ofswitch_qos::MeterBandConfig {
                    kind: ofswitch_qos::BandType::Drop,
                    rate: 8, // 1000 B/s bucket
                    burst_size: 0,
                    prec_level: 0,
                    experimenter: 0,
                }],
            )
            .unwrap();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![
                        Instruction::Meter(1),
                        Instruction::ApplyActions(vec![Action::Output(2)]),
                    ],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        // 60-byte frames: the first several pass, sustained input drops.
        let batch: Vec<Mbuf> = (0..40).map(|_| ingress(&fx, &tcp_frame())).collect();
        fx.kernel.process_batch(batch, &mut cache, &mut sink);
        assert!(sink.packets.len() < 40);
        assert!(!sink.packets.is_empty());
    }

    #[test]
    fn test_set_field_rewrites_and_flags_csum() {
        let fx = fixture();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![
                        Action::SetField(SetField::Ipv4Dst(0xc0a80a0a)),
                        Action::Output(2),
                    ])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert_eq!(sink.packets.len(), 1);
        let (_, out) = &sink.packets[0];
        assert_eq!(headers::ipv4_dst(out), Some(0xc0a80a0a));
        assert!(out.meta().needs_csum());
    }

    #[test]
    fn test_output_in_port_hairpins() {
        let fx = fixture();
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![Action::Output(
                        OFPP_IN_PORT,
                    )])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].0, 0);
    }

    #[test]
    fn test_output_to_link_down_port_counts_drop() {
        let fx = fixture();
        let p2 = fx.bridge.port_by_number(2).unwrap();
        p2.set_link_up(false);
        fx.bridge
            .flowdb
            .add_flow(
                0,
                FlowEntry::new(
                    1,
                    FlowMatch::default(),
                    vec![Instruction::ApplyActions(vec![Action::Output(2)])],
                ),
            )
            .unwrap();
        let mut cache = FlowCache::new(16);
        let mut sink = VecSink::default();
        fx.kernel
            .process_batch(vec![ingress(&fx, &tcp_frame())], &mut cache, &mut sink);
        assert!(sink.packets.is_empty());
        assert_eq!(p2.stats().tx_dropped, 1);
    }
}
