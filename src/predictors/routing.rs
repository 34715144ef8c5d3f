use crate::packet::{Packet, Route};
use strum::IntoEnumIterator;

/// Where a block actually was when the routed access left the L1D;
/// the basis for attributing optimal routes.
#[derive(Debug, Clone, Copy)]
pub struct Residency {
    pub in_l2c: bool,
    pub in_llc: bool,
}

impl Residency {
    #[must_use]
    pub fn optimal_route(self) -> Route {
        if self.in_l2c {
            Route::L2cDram
        } else if self.in_llc {
            Route::LlcDram
        } else {
            Route::Dram
        }
    }
}

/// Chooses among alternative fill paths by periodically "sniffing" each
/// route with a measured packet and predicting the route with the lowest
/// mean service latency.
pub struct RoutingEngine {
    packet_count: u64,
    sniffing_periodicity: u64,
    flush_periods: u64,

    means: Vec<u64>,
    latest_prediction: Option<Route>,
    pub stats: stats::Routing,
}

impl RoutingEngine {
    #[must_use]
    pub fn new(sniffing_periodicity: u64, flush_periods: u64) -> Self {
        let mut stats = stats::Routing::default();
        for route in Route::iter() {
            stats.sniffs.insert(route.to_string(), 0);
            stats.accurate_per_route.insert(route.to_string(), (0, 0));
            stats.optimal_per_route.insert(route.to_string(), 0);
            for other in Route::iter() {
                stats
                    .prediction_changes
                    .insert((route.to_string(), other.to_string()), 0);
            }
        }
        Self {
            packet_count: 0,
            sniffing_periodicity: sniffing_periodicity.max(1),
            flush_periods: flush_periods.max(1),
            means: vec![0; Route::iter().count()],
            latest_prediction: None,
            stats,
        }
    }

    #[must_use]
    pub fn should_sniff(&self) -> bool {
        self.packet_count % self.sniffing_periodicity == 0
    }

    /// Deterministically assigns the next route in round-robin order and
    /// stamps the packet for latency measurement.
    pub fn mark_sniffer(&self, packet: &mut Packet, cycle: u64) {
        let routes: Vec<Route> = Route::iter().collect();
        let slot = (self.packet_count / self.sniffing_periodicity) as usize % routes.len();
        packet.sniffer = true;
        packet.birth_cycle = cycle;
        packet.route = Some(routes[slot]);
    }

    /// Folds a completed sniffer's service latency into its route's mean.
    pub fn collect_sniffer(&mut self, packet: &Packet) {
        let Some(route) = packet.route else { return };
        let latency = packet.death_cycle.saturating_sub(packet.birth_cycle);
        self.means[route as usize] += latency;
        *self.stats.sniffs.entry(route.to_string()).or_insert(0) += 1;
    }

    /// Route with the smallest mean; ties break in enumeration order.
    pub fn predict(&mut self) -> Route {
        let routes: Vec<Route> = Route::iter().collect();
        let best = routes
            .iter()
            .copied()
            .min_by_key(|&route| self.means[route as usize])
            .unwrap();

        if let Some(prev) = self.latest_prediction {
            if prev != best {
                *self
                    .stats
                    .prediction_changes
                    .entry((prev.to_string(), best.to_string()))
                    .or_insert(0) += 1;
            }
        }
        self.latest_prediction = Some(best);
        best
    }

    #[must_use]
    pub fn latest_prediction(&self) -> Option<Route> {
        self.latest_prediction
    }

    /// Counts one routed packet; every `flush_periods` sniffing windows the
    /// means are normalised to stop unbounded growth while keeping their
    /// relative order.
    pub fn inc_packet_counter(&mut self) {
        self.packet_count += 1;
        if self.packet_count % (self.flush_periods * self.sniffing_periodicity) == 0 {
            self.normalise();
        }
    }

    fn normalise(&mut self) {
        if self.packet_count == 0 {
            self.means.fill(0);
            return;
        }
        let winner = self.predict();
        let mut shifts = 0u32;
        while self.means[winner as usize] > 1 {
            self.means[winner as usize] >>= 1;
            shifts += 1;
        }
        for (i, mean) in self.means.iter_mut().enumerate() {
            if i != winner as usize {
                *mean >>= shifts;
            }
        }
    }

    /// Attributes the prediction against the oracle's residency probe.
    pub fn check_prediction(&mut self, predicted: Route, residency: Residency) {
        let optimal = residency.optimal_route();
        if predicted == optimal {
            self.stats.accurate += 1;
            if let Some(counts) = self.stats.accurate_per_route.get_mut(&predicted.to_string()) {
                counts.0 += 1;
            }
        } else {
            self.stats.inaccurate += 1;
            if let Some(counts) = self.stats.accurate_per_route.get_mut(&predicted.to_string()) {
                counts.1 += 1;
            }
        }
        *self
            .stats
            .optimal_per_route
            .entry(optimal.to_string())
            .or_insert(0) += 1;
    }

    pub fn clear_stats(&mut self) {
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{Residency, RoutingEngine};
    use crate::packet::{AccessKind, Packet, Route};

    fn sniffed(engine: &mut RoutingEngine, latency: u64) -> Packet {
        let mut packet = Packet::new(0, AccessKind::Load, 0x1000, 0x1000);
        engine.mark_sniffer(&mut packet, 100);
        packet.death_cycle = 100 + latency;
        packet
    }

    #[test]
    fn round_robin_sniffing() {
        // periodicity 3: packets 0, 3, 6 sniff routes 0, 1, 2.
        let mut engine = RoutingEngine::new(3, 1000);
        let mut routes = Vec::new();
        for i in 0..9u64 {
            if engine.should_sniff() {
                let mut packet = Packet::new(0, AccessKind::Load, 0x1000, 0x1000);
                engine.mark_sniffer(&mut packet, i);
                routes.push(packet.route.unwrap());
            }
            engine.inc_packet_counter();
        }
        assert_eq!(routes, vec![Route::Dram, Route::L2cDram, Route::LlcDram]);
    }

    #[test]
    fn predicts_the_cheapest_route() {
        let mut engine = RoutingEngine::new(1, 1 << 30);
        for (slot, latency) in [10u64, 20, 30].into_iter().enumerate() {
            let mut packet = sniffed(&mut engine, latency);
            packet.route = Some([Route::Dram, Route::L2cDram, Route::LlcDram][slot]);
            engine.collect_sniffer(&packet);
        }
        assert_eq!(engine.predict(), Route::Dram);
    }

    #[test]
    fn normalisation_preserves_order() {
        let mut engine = RoutingEngine::new(1, 1);
        for (route, latency) in [
            (Route::Dram, 400u64),
            (Route::L2cDram, 100),
            (Route::LlcDram, 200),
        ] {
            let mut packet = sniffed(&mut engine, latency);
            packet.route = Some(route);
            engine.collect_sniffer(&packet);
        }
        engine.inc_packet_counter();
        // L2cDram stays the winner after shifting.
        assert_eq!(engine.predict(), Route::L2cDram);
    }

    #[test]
    fn oracle_attribution() {
        let mut engine = RoutingEngine::new(4, 1000);
        engine.check_prediction(
            Route::L2cDram,
            Residency {
                in_l2c: true,
                in_llc: true,
            },
        );
        engine.check_prediction(
            Route::Dram,
            Residency {
                in_l2c: false,
                in_llc: true,
            },
        );
        assert_eq!(engine.stats.accurate, 1);
        assert_eq!(engine.stats.inaccurate, 1);
    }
}
