//! User-agent pool handed to HTTP clients alongside the proxy connector

use std::path::Path;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Result, RotanetError};

/// Current desktop browser user agents
pub const BROWSER_USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Safari on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    // Edge on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
];

/// Non-empty list of user agents with a random picker
#[derive(Debug)]
pub struct UserAgentPool {
    agents: Vec<String>,
    rng: Mutex<StdRng>,
}

impl UserAgentPool {
    pub fn new(agents: Vec<String>) -> Result<Self> {
        Self::with_rng(agents, StdRng::from_entropy())
    }

    /// Pool with a deterministic pick order
    pub fn with_seed(agents: Vec<String>, seed: u64) -> Result<Self> {
        Self::with_rng(agents, StdRng::seed_from_u64(seed))
    }

    fn with_rng(agents: Vec<String>, rng: StdRng) -> Result<Self> {
        if agents.is_empty() {
            return Err(RotanetError::InvalidConfig(
                "user-agent pool needs at least one entry".into(),
            ));
        }
        Ok(Self {
            agents,
            rng: Mutex::new(rng),
        })
    }

    /// Load newline-delimited user agents, skipping blank lines
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let agents: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        if agents.is_empty() {
            return Err(RotanetError::InvalidConfig(format!(
                "no user agents in {}",
                path.display()
            )));
        }
        Self::new(agents)
    }

    pub fn browser_defaults() -> Self {
        Self {
            agents: BROWSER_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// The sole entry, or a uniformly random one
    pub fn pick(&self) -> &str {
        if let [only] = self.agents.as_slice() {
            return only;
        }
        let mut rng = self.rng.lock();
        self.agents
            .choose(&mut *rng)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }
}
