use std::fmt;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{CrawlerConfig, UserAgentProfile};
use crate::error::ConfigError;

/// Source of indices used to pick from the pools.
pub trait RandomSource: Send + Sync {
    /// Returns an index in `0..len`; `len` is never zero.
    fn index(&self, len: usize) -> usize;
}

/// Thread-local entropy, the default outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn index(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

/// Reproducible picks from a fixed seed.
#[derive(Debug)]
pub struct SeededRandom(Mutex<StdRng>);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl RandomSource for SeededRandom {
    fn index(&self, len: usize) -> usize {
        match self.0.lock() {
            Ok(mut rng) => rng.gen_range(0..len),
            Err(poisoned) => poisoned.into_inner().gen_range(0..len),
        }
    }
}

/// One (proxy, user agent) pairing, valid for a single attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub proxy: Option<Arc<str>>,
    pub agent: Arc<UserAgentProfile>,
}

impl Identity {
    pub fn user_agent(&self) -> &str {
        self.agent.user_agent()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("proxy", &self.proxy.as_deref().unwrap_or("direct"))
            .field("user_agent", &self.user_agent())
            .finish()
    }
}

pub struct IdentityRotator {
    proxies: Vec<Arc<str>>,
    agents: Vec<Arc<UserAgentProfile>>,
    random: Box<dyn RandomSource>,
}

impl fmt::Debug for IdentityRotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRotator")
            .field("proxies", &self.proxies.len())
            .field("agents", &self.agents.len())
            .finish()
    }
}

impl IdentityRotator {
    pub fn new(
        proxies: Vec<String>,
        agents: Vec<UserAgentProfile>,
        random: Box<dyn RandomSource>,
    ) -> Result<Self, ConfigError> {
        if agents.is_empty() {
            return Err(ConfigError("user agent pool is empty".into()));
        }
        if proxies.is_empty() {
            log::warn!("Proxy pool is empty, requests will be sent directly");
        }
        Ok(Self {
            proxies: proxies.into_iter().map(Arc::from).collect(),
            agents: agents.into_iter().map(Arc::new).collect(),
            random,
        })
    }

    pub fn from_config(config: &CrawlerConfig) -> Result<Self, ConfigError> {
        let random: Box<dyn RandomSource> = match config.seed {
            Some(seed) => Box::new(SeededRandom::new(seed)),
            None => Box::new(ThreadRandom),
        };
        Self::new(config.proxies.clone(), config.user_agents.clone(), random)
    }

    /// Independent uniform picks from both pools.
    pub fn next(&self) -> Identity {
        let proxy = match self.proxies.len() {
            0 => None,
            n => Some(self.proxies[self.random.index(n)].clone()),
        };
        let agent = self.agents[self.random.index(self.agents.len())].clone();
        Identity { proxy, agent }
    }

    /// Like [`next`](Self::next) but never hands back `previous` again,
    /// unless the pools hold a single pairing.
    pub fn next_excluding(&self, previous: &Identity) -> Identity {
        let pairings = self.proxies.len().max(1) * self.agents.len();
        if pairings == 1 {
            return self.next();
        }
        for _ in 0..8 {
            let identity = self.next();
            if &identity != previous {
                return identity;
            }
        }
        // Draws kept colliding, step deterministically to a neighbour.
        let agent_pos = self
            .agents
            .iter()
            .position(|a| *a == previous.agent)
            .unwrap_or(0);
        if self.agents.len() > 1 {
            Identity {
                proxy: previous.proxy.clone(),
                agent: self.agents[(agent_pos + 1) % self.agents.len()].clone(),
            }
        } else {
            let proxy_pos = self
                .proxies
                .iter()
                .position(|p| Some(p) == previous.proxy.as_ref())
                .unwrap_or(0);
            Identity {
                proxy: Some(self.proxies[(proxy_pos + 1) % self.proxies.len()].clone()),
                agent: previous.agent.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct Sequence(Mutex<VecDeque<usize>>);

    impl Sequence {
        fn boxed(seq: &[usize]) -> Box<dyn RandomSource> {
            Box::new(Self(Mutex::new(seq.iter().copied().collect())))
        }
    }

    impl RandomSource for Sequence {
        fn index(&self, len: usize) -> usize {
            self.0.lock().unwrap().pop_front().unwrap_or(0) % len
        }
    }

    fn agents(names: &[&str]) -> Vec<UserAgentProfile> {
        names.iter().map(|&n| n.into()).collect()
    }

    #[test]
    fn picks_proxy_and_agent_independently() {
        let rotator = IdentityRotator::new(
            vec!["http://p0".into(), "http://p1".into()],
            agents(&["ua0", "ua1", "ua2"]),
            Sequence::boxed(&[1, 2, 0, 0]),
        )
        .unwrap();

        let first = rotator.next();
        assert_eq!(first.proxy.as_deref(), Some("http://p1"));
        assert_eq!(first.user_agent(), "ua2");

        let second = rotator.next();
        assert_eq!(second.proxy.as_deref(), Some("http://p0"));
        assert_eq!(second.user_agent(), "ua0");
    }

    #[test]
    fn empty_proxy_pool_means_direct_connection() {
        let rotator =
            IdentityRotator::new(vec![], agents(&["ua0"]), Sequence::boxed(&[])).unwrap();
        let identity = rotator.next();
        assert_eq!(identity.proxy, None);
        assert_eq!(identity.user_agent(), "ua0");
    }

    #[test]
    fn empty_agent_pool_fails_fast() {
        let err = IdentityRotator::new(vec!["http://p0".into()], vec![], Box::new(ThreadRandom))
            .unwrap_err();
        assert_eq!(err, ConfigError("user agent pool is empty".into()));
    }

    #[test]
    fn excluding_never_repeats_the_blocked_identity() {
        // The sequence keeps replaying the blocked pairing.
        let rotator = IdentityRotator::new(
            vec!["http://p0".into()],
            agents(&["ua0", "ua1"]),
            Sequence::boxed(&[0; 32]),
        )
        .unwrap();
        let blocked = rotator.next();
        let rotated = rotator.next_excluding(&blocked);
        assert_ne!(rotated, blocked);
        assert_eq!(rotated.user_agent(), "ua1");
    }

    #[test]
    fn seeded_source_is_reproducible() {
        let pick = |seed| {
            let random = SeededRandom::new(seed);
            (0..16).map(|_| random.index(10)).collect::<Vec<_>>()
        };
        assert_eq!(pick(42), pick(42));
    }
}
