//! Conservative fill-path policy: decides which lower level receives a
//! miss, honoring the route the routing engine picked, and keeps bypassed
//! prefetchers warm by escalating hit/miss events to them.

use crate::cache::{Downstream, QueueKind};
use crate::packet::{Packet, Route};
use crate::prefetch::Descriptor;

/// Node ids of the levels a cache may forward to.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathTargets {
    /// The conventional next level.
    pub lower: Option<usize>,
    pub l2c: Option<usize>,
    pub llc: Option<usize>,
    pub dram: Option<usize>,
}

/// The node a packet goes to next, given its route.
///
/// Routed packets (from L1D/SDC) may skip levels; everything else follows
/// the conventional path.
#[must_use]
pub fn next_hop(targets: &PathTargets, packet: &Packet) -> Option<usize> {
    match packet.route {
        Some(Route::Dram) => targets.dram,
        Some(Route::LlcDram) => targets.llc.or(targets.dram),
        Some(Route::L2cDram) | None => targets.lower.or(targets.dram),
    }
}

/// Forwards a miss along its fill path. The packet comes back on rejection
/// so the caller can model the stall.
pub fn forward_miss(
    targets: &PathTargets,
    self_id: usize,
    down: &mut dyn Downstream,
    mut packet: Packet,
    queue: QueueKind,
) -> Result<(), Packet> {
    let Some(target) = next_hop(targets, &packet) else {
        return Err(packet);
    };
    packet.bypassed_l2c_llc = matches!(packet.route, Some(Route::Dram));
    // Writebacks are fire-and-forget; everything else fills back here.
    packet.requester = if packet.kind == crate::packet::AccessKind::Writeback {
        crate::packet::Requester::None
    } else {
        crate::packet::Requester::Cache(self_id)
    };
    down.try_send(target, queue, packet)
}

/// Invokes the prefetcher of a level the packet bypassed, so its pattern
/// state keeps learning the access stream it no longer sees.
pub fn escalate_prefetch(
    targets: &PathTargets,
    down: &mut dyn Downstream,
    packet: &Packet,
    hit: bool,
    cycle: u64,
) {
    if !matches!(packet.route, Some(Route::Dram | Route::LlcDram)) {
        return;
    }
    let Some(l2c) = targets.l2c else { return };
    down.escalate_prefetch(
        l2c,
        Descriptor {
            hit,
            offchip_pred: packet.went_offchip_pred,
            kind: packet.kind,
            cpu: packet.cpu,
            addr: packet.full_addr,
            v_addr: packet.v_addr,
            ip: packet.ip,
            size: packet.size,
            cycle,
            mshr_size: 0,
            mshr_occupancy: 0,
            pq_size: 0,
            pq_occupancy: 0,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::{next_hop, PathTargets};
    use crate::packet::{AccessKind, Packet, Route};

    fn targets() -> PathTargets {
        PathTargets {
            lower: Some(3),
            l2c: Some(3),
            llc: Some(5),
            dram: Some(6),
        }
    }

    #[test]
    fn routes_map_to_nodes() {
        let targets = targets();
        let mut packet = Packet::new(0, AccessKind::Load, 0x1000, 0x1000);

        packet.route = None;
        assert_eq!(next_hop(&targets, &packet), Some(3));
        packet.route = Some(Route::L2cDram);
        assert_eq!(next_hop(&targets, &packet), Some(3));
        packet.route = Some(Route::LlcDram);
        assert_eq!(next_hop(&targets, &packet), Some(5));
        packet.route = Some(Route::Dram);
        assert_eq!(next_hop(&targets, &packet), Some(6));
    }
}
