use super::{Error, ReplacementPolicy};

/// DRRIP is registered but deliberately unimplemented: the reference
/// plugin it descends from was an empty stub, so constructing it would
/// silently simulate nothing.
pub fn build() -> Result<Box<dyn ReplacementPolicy>, Error> {
    Err(Error::Unimplemented("drrip"))
}
