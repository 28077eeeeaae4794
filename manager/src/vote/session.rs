//! Pure vote state machine for one vote kind.
//!
//! A session never talks to the server and never reads the clock or a random
//! source on its own: the caller passes the live player count, the current
//! instant and the rng. That keeps every transition deterministic under test.
//! The owner wraps each session in a mutex.

use crate::config::VoteRules;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

pub const NO_CHANGE: &str = "Do not change";
/// Ballot size before the no-change option is appended
pub const MAX_OPTIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Map,
    Mode,
}

impl VoteKind {
    pub fn other(&self) -> VoteKind {
        match self {
            VoteKind::Map => VoteKind::Mode,
            VoteKind::Mode => VoteKind::Map,
        }
    }

    /// Chat command short name
    pub fn label(&self) -> &'static str {
        match self {
            VoteKind::Map => "RTV",
            VoteKind::Mode => "RTM",
        }
    }

    pub fn noun(&self) -> &'static str {
        match self {
            VoteKind::Map => "map",
            VoteKind::Mode => "mode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Collecting,
    Voting,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    #[error("Please wait {remaining}s as {label} is on cooldown")]
    Locked { label: &'static str, remaining: u64 },

    #[error("Wait {remaining}s to {label} again")]
    Flooded { label: &'static str, remaining: u64 },

    #[error("Already {0}-voted")]
    AlreadyTriggered(&'static str),

    #[error("You have not {0}-voted")]
    NotTriggered(&'static str),

    #[error("Invalid choice 1-{0}")]
    InvalidChoice(usize),

    #[error("No {0} vote in progress")]
    NotVoting(&'static str),

    #[error("Unknown map: {0}")]
    UnknownCandidate(String),

    #[error("A {0} vote is already in progress")]
    OtherVoteActive(&'static str),
}

/// Trigger set size against the quorum after a trigger or retract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerProgress {
    pub count: usize,
    pub required: usize,
    /// Quorum reached while not yet voting
    pub opens: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    pub option: String,
    pub votes: usize,
    /// The participant moved from another option
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No option reached the win threshold
    Failed,
    NoChange,
    Pending(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResult {
    pub triggers: usize,
    pub required: usize,
    pub resolution: Resolution,
}

/// `max(1, ceil(players * percent / 100))`
pub fn quorum(players: usize, percent: u32) -> usize {
    let scaled = players * percent as usize;
    scaled.div_ceil(100).max(1)
}

#[derive(Debug)]
pub struct VoteSession {
    kind: VoteKind,
    rules: VoteRules,
    /// Random fill candidates
    pool: Vec<String>,
    /// Everything that may be nominated
    nominable: Vec<String>,
    triggers: BTreeSet<String>,
    nominations: BTreeMap<String, BTreeSet<String>>,
    options: Vec<String>,
    tally: Vec<BTreeSet<String>>,
    voting: bool,
    cycle: u64,
    pending: Option<String>,
    lock_until: Option<Instant>,
    last_trigger: HashMap<String, Instant>,
}

impl VoteSession {
    pub fn new(kind: VoteKind, rules: VoteRules, pool: Vec<String>, nominable: Vec<String>) -> Self {
        Self {
            kind,
            rules,
            pool,
            nominable,
            triggers: BTreeSet::new(),
            nominations: BTreeMap::new(),
            options: Vec::new(),
            tally: Vec::new(),
            voting: false,
            cycle: 0,
            pending: None,
            lock_until: None,
            last_trigger: HashMap::new(),
        }
    }

    pub fn kind(&self) -> VoteKind {
        self.kind
    }

    pub fn rules(&self) -> &VoteRules {
        &self.rules
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    pub fn phase(&self) -> Phase {
        if self.voting {
            Phase::Voting
        } else if !self.triggers.is_empty() {
            Phase::Collecting
        } else {
            Phase::Idle
        }
    }

    pub fn is_voting(&self) -> bool {
        self.voting
    }

    /// Incremented every time a vote opens
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    pub fn has_triggered(&self, participant: &str) -> bool {
        self.triggers.contains(participant)
    }

    /// 1-based options the participant currently votes for
    pub fn choices_of(&self, participant: &str) -> Vec<usize> {
        self.tally
            .iter()
            .enumerate()
            .filter(|(_, voters)| voters.contains(participant))
            .map(|(idx, _)| idx + 1)
            .collect()
    }

    pub fn votes_for(&self, choice: usize) -> usize {
        choice
            .checked_sub(1)
            .and_then(|idx| self.tally.get(idx))
            .map_or(0, BTreeSet::len)
    }

    pub fn lock_remaining(&self, now: Instant) -> Option<Duration> {
        self.lock_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn check_lock(&self, now: Instant) -> Result<(), VoteError> {
        match self.lock_remaining(now) {
            Some(remaining) => Err(VoteError::Locked {
                label: self.kind.label(),
                remaining: remaining.as_secs(),
            }),
            None => Ok(()),
        }
    }

    fn progress(&self, players: usize) -> TriggerProgress {
        let required = quorum(players, self.rules.trigger_percent);
        let count = self.triggers.len();

        TriggerProgress {
            count,
            required,
            opens: !self.voting && count >= required,
        }
    }

    pub fn trigger(&mut self, participant: &str, players: usize, now: Instant) -> Result<TriggerProgress, VoteError> {
        self.check_lock(now)?;

        if let Some(last) = self.last_trigger.get(participant) {
            let since = now.saturating_duration_since(*last);
            if since < self.rules.flood_interval() {
                return Err(VoteError::Flooded {
                    label: self.kind.label(),
                    remaining: (self.rules.flood_interval() - since).as_secs(),
                });
            }
        }
        if self.triggers.contains(participant) {
            return Err(VoteError::AlreadyTriggered(self.kind.label()));
        }

        self.last_trigger.insert(participant.to_string(), now);
        self.triggers.insert(participant.to_string());

        Ok(self.progress(players))
    }

    pub fn retract(&mut self, participant: &str, players: usize, now: Instant) -> Result<TriggerProgress, VoteError> {
        self.check_lock(now)?;

        if !self.triggers.remove(participant) {
            return Err(VoteError::NotTriggered(self.kind.label()));
        }

        Ok(self.progress(players))
    }

    /// Returns the canonical candidate name
    pub fn nominate(&mut self, participant: &str, candidate: &str) -> Result<String, VoteError> {
        let canonical = self
            .nominable
            .iter()
            .find(|known| known.eq_ignore_ascii_case(candidate.trim()))
            .cloned()
            .ok_or_else(|| VoteError::UnknownCandidate(candidate.trim().to_string()))?;

        self.nominations
            .entry(canonical.clone())
            .or_default()
            .insert(participant.to_string());

        Ok(canonical)
    }

    /// Builds the ballot and enters Voting. Returns the new cycle number.
    pub fn open<R: Rng + ?Sized>(&mut self, rng: &mut R) -> u64 {
        let mut nominated: Vec<(&String, usize)> = self
            .nominations
            .iter()
            .map(|(candidate, voters)| (candidate, voters.len()))
            .collect();
        // Stable: equal counts keep candidate order
        nominated.sort_by(|a, b| b.1.cmp(&a.1));

        let mut options: Vec<String> = nominated
            .into_iter()
            .take(MAX_OPTIONS)
            .map(|(candidate, _)| candidate.clone())
            .collect();

        if options.len() < MAX_OPTIONS {
            let mut fill: Vec<&String> = self.pool.iter().filter(|c| !options.contains(c)).collect();
            fill.shuffle(rng);
            let missing = MAX_OPTIONS - options.len();
            options.extend(fill.into_iter().take(missing).cloned());
        }

        options.push(NO_CHANGE.to_string());

        self.tally = vec![BTreeSet::new(); options.len()];
        self.options = options;
        self.voting = true;
        self.cycle += 1;
        self.cycle
    }

    /// Records a 1-based choice, replacing any earlier choice of the participant
    pub fn cast(&mut self, participant: &str, choice: usize) -> Result<Ballot, VoteError> {
        if !self.voting {
            return Err(VoteError::NotVoting(self.kind.noun()));
        }
        if choice == 0 || choice > self.options.len() {
            return Err(VoteError::InvalidChoice(self.options.len()));
        }

        let idx = choice - 1;
        let mut changed = false;
        for (other, voters) in self.tally.iter_mut().enumerate() {
            if voters.remove(participant) && other != idx {
                changed = true;
            }
        }
        self.tally[idx].insert(participant.to_string());

        Ok(Ballot {
            option: self.options[idx].clone(),
            votes: self.tally[idx].len(),
            changed,
        })
    }

    /// Closes the vote and resets the session for the next cycle.
    pub fn resolve<R: Rng + ?Sized>(&mut self, players: usize, rng: &mut R) -> VoteResult {
        let required = quorum(players, self.rules.win_percent);
        let triggers = self.triggers.len();
        let best = self.tally.iter().map(BTreeSet::len).max().unwrap_or(0);

        let resolution = if best == 0 || best < required {
            Resolution::Failed
        } else {
            let tied: Vec<&String> = self
                .options
                .iter()
                .zip(self.tally.iter())
                .filter(|(_, voters)| voters.len() == best)
                .map(|(option, _)| option)
                .collect();

            match tied.choose(rng) {
                Some(winner) if winner.as_str() == NO_CHANGE => Resolution::NoChange,
                Some(winner) => Resolution::Pending((*winner).clone()),
                None => Resolution::Failed,
            }
        };

        self.pending = match &resolution {
            Resolution::Pending(target) => Some(target.clone()),
            _ => None,
        };
        self.reset();

        VoteResult {
            triggers,
            required,
            resolution,
        }
    }

    /// Clears the cycle state. Pending results and the lock survive.
    pub fn reset(&mut self) {
        self.triggers.clear();
        self.nominations.clear();
        self.options.clear();
        self.tally.clear();
        self.voting = false;
    }

    /// Hands out the pending target for a round boundary. A target equal to
    /// the live value is dropped.
    pub fn take_pending(&mut self, current: Option<&str>) -> Option<String> {
        let target = self.pending.take()?;

        match current {
            Some(current) if current.eq_ignore_ascii_case(&target) => None,
            _ => Some(target),
        }
    }

    pub fn engage_lock(&mut self, now: Instant) {
        self.lock_until = Some(now + self.rules.cooldown());
    }

    /// Removes every trace of a departed participant
    pub fn purge(&mut self, participant: &str) {
        self.triggers.remove(participant);
        for voters in self.tally.iter_mut() {
            voters.remove(participant);
        }
        self.nominations.retain(|_, voters| {
            voters.remove(participant);
            !voters.is_empty()
        });
        self.last_trigger.remove(participant);
    }
}
