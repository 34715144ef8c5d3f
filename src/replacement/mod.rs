pub mod drrip;
pub mod lru;
pub mod random;
pub mod srrip;
pub mod topt;

use crate::cache::AccessDescriptor;
use crate::packet::Level;
use crate::translate::Translator;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown replacement policy {0:?}")]
    Unknown(String),

    #[error("replacement policy {name:?} bound to {level} cache")]
    Mismatch { name: String, level: Level },

    #[error("replacement policy {0:?} is not implemented")]
    Unimplemented(&'static str),

    #[error("bad knobs for {name:?}: {source}")]
    Knobs {
        name: String,
        source: serde_json::Error,
    },

    #[error("replacement policy {name:?}: {message}")]
    Init { name: String, message: String },
}

/// Victim selection and recency bookkeeping, pluggable per cache.
///
/// `find_victim` must return a way in `[0, associativity)` in bounded time;
/// invalid ways preempt the policy order.
pub trait ReplacementPolicy {
    fn name(&self) -> &'static str;

    fn update_state(&mut self, desc: &AccessDescriptor);

    fn find_victim(&mut self, desc: &AccessDescriptor) -> usize;

    fn report(&self, _out: &mut dyn std::io::Write) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn ReplacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplacementPolicy").field("name", &self.name()).finish()
    }
}

/// Context handed to policies that need more than geometry.
pub struct BuildContext<'a> {
    pub traces: &'a [PathBuf],
    pub translator: Arc<Mutex<Translator>>,
    pub irreg_arrays: Vec<Vec<(u64, u64)>>,
}

/// Compile-time registry keyed by plugin name.
///
/// Names follow the `<cache>_<policy>` convention of the plugin files the
/// config points at; the `<cache>` prefix must match the bound cache.
pub fn build(
    name: &str,
    level: Level,
    sets: usize,
    ways: usize,
    knobs: &serde_json::Value,
    ctx: &BuildContext,
) -> Result<Box<dyn ReplacementPolicy>, Error> {
    let (prefix, policy) = name
        .split_once('_')
        .ok_or_else(|| Error::Unknown(name.to_string()))?;
    if !prefix_matches(prefix, level) {
        return Err(Error::Mismatch {
            name: name.to_string(),
            level,
        });
    }

    match policy {
        "lru" => Ok(Box::new(lru::Lru::new(sets, ways))),
        "srrip" => Ok(Box::new(srrip::Srrip::new(sets, ways))),
        "random" => Ok(Box::new(random::Random::new(ways))),
        "drrip" => drrip::build(),
        "topt" => {
            let policy = topt::Topt::new(name, sets, ways, knobs, ctx)?;
            Ok(Box::new(policy))
        }
        _ => Err(Error::Unknown(name.to_string())),
    }
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
pub(crate) mod testing {
    use crate::cache::{AccessDescriptor, WayView};
    use crate::packet::AccessKind;

    /// Descriptor builder for policy unit tests.
    pub fn desc<'a>(set: usize, way: Option<usize>, ways: &'a [WayView], hit: bool) -> AccessDescriptor<'a> {
        AccessDescriptor {
            cpu: 0,
            set,
            way,
            full_addr: 0x1000,
            v_addr: 0x1000,
            victim_addr: None,
            ip: 0x400,
            kind: AccessKind::Load,
            hit,
            ways,
            cycle: 0,
        }
    }

    pub fn all_valid(ways: usize) -> Vec<WayView> {
        (0..ways)
            .map(|i| WayView {
                valid: true,
                dirty: false,
                full_addr: 0x1000 + (i as u64) * 0x40,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{build, BuildContext, Error};
    use crate::packet::Level;
    use crate::translate::Translator;
    use std::sync::{Arc, Mutex};

    fn ctx_inner() -> (Vec<std::path::PathBuf>, Arc<Mutex<Translator>>) {
        (Vec::new(), Arc::new(Mutex::new(Translator::new(1, 1 << 10))))
    }

    #[test]
    fn level_mismatch_is_fatal() {
        let (traces, translator) = ctx_inner();
        let ctx = BuildContext {
            traces: &traces,
            translator,
            irreg_arrays: vec![],
        };
        let err = build(
            "l1d_lru",
            Level::Llc,
            64,
            8,
            &serde_json::Value::Null,
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Mismatch { .. }));
    }

    #[test]
    fn drrip_stub_refuses_construction() {
        let (traces, translator) = ctx_inner();
        let ctx = BuildContext {
            traces: &traces,
            translator,
            irreg_arrays: vec![],
        };
        let err = build(
            "llc_drrip",
            Level::Llc,
            64,
            8,
            &serde_json::Value::Null,
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unimplemented(_)));
    }
}
