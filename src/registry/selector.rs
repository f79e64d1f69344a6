//! Uniform random selection among healthy candidates.

use rand::Rng;
use url::Url;

use crate::registry::Selector;

/// Picks a candidate uniformly at random on every call.
#[derive(Debug, Default)]
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for RandomSelector {
    fn pick<'a>(&self, candidates: &'a [Url]) -> Option<&'a Url> {
        match candidates.len() {
            0 => None,
            1 => candidates.first(),
            len => candidates.get(rand::thread_rng().gen_range(0..len)),
        }
    }
}
