pub mod berti;
pub mod ip_stride;
pub mod ipcp;
pub mod next_line;
pub mod no_op;
pub mod spp;
pub mod spp_ppf;

use crate::packet::{AccessKind, FillLevel, Level};
use crate::address;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown prefetcher {0:?}")]
    Unknown(String),

    #[error("prefetcher {name:?} bound to {level} cache")]
    Mismatch { name: String, level: Level },

    #[error("bad knobs for {name:?}: {source}")]
    Knobs {
        name: String,
        source: serde_json::Error,
    },
}

/// One prefetch opportunity as seen by a policy.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub hit: bool,
    pub offchip_pred: bool,
    pub kind: AccessKind,
    pub cpu: usize,
    /// Physical address of the triggering access.
    pub addr: address,
    pub v_addr: address,
    pub ip: u64,
    pub size: u32,
    pub cycle: u64,
    pub mshr_size: usize,
    pub mshr_occupancy: usize,
    pub pq_size: usize,
    pub pq_occupancy: usize,
}

/// Fill notification for policies that track in-flight latency or evictions.
#[derive(Debug, Clone, Copy)]
pub struct FillEvent {
    pub cpu: usize,
    pub addr: address,
    pub v_addr: address,
    pub ip: u64,
    pub set: usize,
    pub way: usize,
    pub prefetch: bool,
    pub victim_addr: Option<address>,
    pub cycle: u64,
}

/// A prefetch the policy wants issued; the owning cache validates capacity
/// and attributes the origin level.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub cpu: usize,
    pub size: u32,
    pub ip: u64,
    pub base_addr: address,
    pub pf_addr: address,
    pub fill_level: FillLevel,
    pub offchip_pred: bool,
}

/// Collects the requests of one `operate` call.
#[derive(Debug, Default)]
pub struct IssueBuffer {
    pub requests: Vec<Request>,
}

impl IssueBuffer {
    pub fn push(&mut self, request: Request) {
        self.requests.push(request);
    }
}

pub trait Prefetcher {
    fn name(&self) -> &'static str;

    /// Called on every demand hit/miss opportunity.
    fn operate(&mut self, desc: &Descriptor, issue: &mut IssueBuffer);

    /// Called when a block fills into the owning cache.
    fn fill(&mut self, _event: &FillEvent) {}

    fn clear_stats(&mut self) {}

    fn dump_stats(&self, _out: &mut dyn std::io::Write) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Prefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prefetcher").field("name", &self.name()).finish()
    }
}

/// Compile-time registry keyed by plugin name (`<cache>_<policy>`); the
/// `<cache>` prefix must match the cache the plugin is bound to.
pub fn build(
    name: &str,
    level: Level,
    knobs: &serde_json::Value,
) -> Result<Box<dyn Prefetcher>, Error> {
    let (prefix, policy) = name
        .split_once('_')
        .ok_or_else(|| Error::Unknown(name.to_string()))?;
    if !prefix_matches(prefix, level) {
        return Err(Error::Mismatch {
            name: name.to_string(),
            level,
        });
    }

    let decode_err = |source| Error::Knobs {
        name: name.to_string(),
        source,
    };
    match policy {
        "no" => Ok(Box::new(no_op::NoOp)),
        "next_line" => {
            let knobs = decode(knobs).map_err(decode_err)?;
            Ok(Box::new(next_line::NextLine::new(level, knobs)))
        }
        "ip_stride" => {
            let knobs = decode(knobs).map_err(decode_err)?;
            Ok(Box::new(ip_stride::IpStride::new(knobs)))
        }
        "ipcp" => {
            let knobs = decode(knobs).map_err(decode_err)?;
            Ok(Box::new(ipcp::Ipcp::new(knobs)))
        }
        "spp" => {
            let knobs = decode(knobs).map_err(decode_err)?;
            Ok(Box::new(spp::Spp::new(knobs)))
        }
        "spp_ppf" => {
            let knobs = decode(knobs).map_err(decode_err)?;
            Ok(Box::new(spp_ppf::SppPpf::new(knobs)))
        }
        "berti" => {
            let knobs = decode(knobs).map_err(decode_err)?;
            Ok(Box::new(berti::Berti::new(knobs)))
        }
        _ => Err(Error::Unknown(name.to_string())),
    }
}

fn decode<T: serde::de::DeserializeOwned + Default>(
    knobs: &serde_json::Value,
) -> Result<T, serde_json::Error> {
    if knobs.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(knobs.clone())
}

fn prefix_matches(prefix: &str, level: Level) -> bool {
    matches!(
        (prefix, level),
        ("l1i", Level::L1I)
            | ("l1d", Level::L1D)
            | ("l2c", Level::L2C)
            | ("llc", Level::Llc)
            | ("sdc", Level::Sdc)
    )
}

#[cfg(test)]
mod tests {
    use super::{build, Error};
    use crate::packet::Level;

    #[test]
    fn wrong_level_binding_is_fatal() {
        let err = build("l2c_next_line", Level::L1D, &serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, Error::Mismatch { .. }));
    }

    #[test]
    fn no_op_builds_for_every_level() {
        for (name, level) in [
            ("l1i_no", Level::L1I),
            ("l1d_no", Level::L1D),
            ("l2c_no", Level::L2C),
            ("llc_no", Level::Llc),
            ("sdc_no", Level::Sdc),
        ] {
            assert!(build(name, level, &serde_json::Value::Null).is_ok());
        }
    }
}
