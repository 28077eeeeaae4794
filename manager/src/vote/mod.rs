//! Map and mode voting driven by chat commands.
//!
//! Players call for a vote with `!rtv` (map) or `!rtm` (mode) and take the
//! call back with `!unrtv` / `!unrtm`. Once enough players asked, a ballot is
//! announced and players answer with `!<number>`. When the window closes the
//! winner is remembered and applied at the next round end, after which new
//! calls for that kind are locked for a cooldown.
//!
//! Each kind has its own [`VoteSession`] behind its own mutex. When both are
//! needed they are always locked map first. No lock is held across an await:
//! the live player count is fetched before locking and messages are sent
//! after unlocking. Every open ballot owns one timer task that runs its
//! countdown, reminders and expiry. Timers carry the cycle number they were
//! started for and do nothing once the session moved on.

pub mod session;

pub use session::{
    quorum, Ballot, Phase, Resolution, TriggerProgress, VoteError, VoteKind, VoteResult, VoteSession,
    MAX_OPTIONS, NO_CHANGE,
};

use crate::bus::{HandlerError, Subscriber};
use crate::config::{VoteRules, VoteSettings};
use crate::console::GameConsole;
use crate::plugin::{Plugin, PluginContext};
use crate::utils::paginate;
use async_trait::async_trait;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use shared::{DomainEvent, EventKind, COLOR_RED, COLOR_RESET};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

const LIST_PAGE: usize = 5;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn format_options(options: &[String]) -> String {
    options
        .iter()
        .enumerate()
        .map(|(idx, option)| format!("{}{}{}:{}", COLOR_RED, idx + 1, COLOR_RESET, option))
        .collect::<Vec<_>>()
        .join(", ")
}

fn highlight(text: &str) -> String {
    format!("{}{}{}", COLOR_RED, text, COLOR_RESET)
}

fn title(kind: VoteKind) -> &'static str {
    match kind {
        VoteKind::Map => "Map",
        VoteKind::Mode => "Mode",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Countdown(u64),
    Prompt,
    Expire,
}

/// Offsets from the opening of a ballot, in firing order
fn schedule(rules: &VoteRules) -> Vec<(Duration, Tick)> {
    let window = rules.window_secs;
    let mut ticks: Vec<(Duration, Tick)> = rules
        .reminder_offsets
        .iter()
        .filter(|offset| **offset > 0 && **offset < window)
        .map(|offset| (Duration::from_secs(window - offset), Tick::Countdown(*offset)))
        .collect();

    if rules.prompt_secs > 0 {
        let mut at = rules.prompt_secs;
        while at < window {
            ticks.push((Duration::from_secs(at), Tick::Prompt));
            at += rules.prompt_secs;
        }
    }

    ticks.sort_by_key(|(at, _)| *at);
    ticks.push((Duration::from_secs(window), Tick::Expire));
    ticks
}

/// Observable state of one vote kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteSnapshot {
    pub kind: VoteKind,
    pub enabled: bool,
    pub phase: Phase,
    pub triggers: usize,
    pub options: Vec<String>,
    pub pending: Option<String>,
    pub locked_secs: Option<u64>,
}

struct KindState {
    enabled: bool,
    session: Mutex<VoteSession>,
    /// Timer of the open ballot with its cycle number
    timer: Mutex<Option<(u64, JoinHandle<()>)>>,
}

impl KindState {
    fn new(enabled: bool, session: VoteSession) -> Self {
        Self {
            enabled,
            session: Mutex::new(session),
            timer: Mutex::new(None),
        }
    }

    fn cancel_timer(&self) {
        if let Some((_, handle)) = lock(&self.timer).take() {
            handle.abort();
        }
    }
}

struct Inner {
    console: Arc<dyn GameConsole>,
    map: KindState,
    mode: KindState,
    primary_maps: Vec<String>,
    secondary_maps: Vec<String>,
    modes: Vec<String>,
    rng: Mutex<StdRng>,
}

enum Command<'a> {
    Trigger(VoteKind),
    Retract(VoteKind),
    Nominate(&'a str),
    MapList(Option<&'a str>),
    ModeList,
    Choice(usize),
}

impl<'a> Command<'a> {
    fn parse(message: &'a str) -> Option<Self> {
        let command = message.trim().trim_start_matches('!');
        let mut parts = command.splitn(2, ' ');
        let head = parts.next()?;
        let arg = parts.next().map(str::trim).filter(|arg| !arg.is_empty());

        match head.to_ascii_lowercase().as_str() {
            "rtv" if arg.is_none() => Some(Command::Trigger(VoteKind::Map)),
            "rtm" if arg.is_none() => Some(Command::Trigger(VoteKind::Mode)),
            "unrtv" if arg.is_none() => Some(Command::Retract(VoteKind::Map)),
            "unrtm" if arg.is_none() => Some(Command::Retract(VoteKind::Mode)),
            "nominate" => arg.map(Command::Nominate),
            "maplist" => Some(Command::MapList(arg)),
            "modelist" => Some(Command::ModeList),
            digits if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) && arg.is_none() => {
                Some(Command::Choice(digits.parse().unwrap_or(usize::MAX)))
            }
            _ => None,
        }
    }
}

pub struct VoteController {
    inner: Arc<Inner>,
}

impl VoteController {
    pub fn new(settings: &VoteSettings, console: Arc<dyn GameConsole>) -> Self {
        Self::with_rng(settings, console, StdRng::from_entropy())
    }

    pub fn with_rng(settings: &VoteSettings, console: Arc<dyn GameConsole>, rng: StdRng) -> Self {
        let nominable: Vec<String> = settings
            .primary_maps
            .iter()
            .chain(settings.secondary_maps.iter())
            .cloned()
            .collect();

        let map = VoteSession::new(
            VoteKind::Map,
            settings.map.clone(),
            settings.primary_maps.clone(),
            nominable,
        );
        let mode = VoteSession::new(
            VoteKind::Mode,
            settings.mode.clone(),
            settings.modes.clone(),
            settings.modes.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                console,
                map: KindState::new(settings.map.enabled, map),
                // A single mode leaves nothing to vote on
                mode: KindState::new(settings.mode.enabled && settings.modes.len() > 1, mode),
                primary_maps: settings.primary_maps.clone(),
                secondary_maps: settings.secondary_maps.clone(),
                modes: settings.modes.clone(),
                rng: Mutex::new(rng),
            }),
        }
    }

    pub fn snapshot(&self, kind: VoteKind) -> VoteSnapshot {
        let state = self.inner.state(kind);
        let session = lock(&state.session);

        VoteSnapshot {
            kind,
            enabled: state.enabled,
            phase: session.phase(),
            triggers: session.trigger_count(),
            options: session.options().to_vec(),
            pending: session.pending().map(str::to_string),
            locked_secs: session.lock_remaining(Instant::now()).map(|d| d.as_secs()),
        }
    }

    pub fn has_triggered(&self, kind: VoteKind, participant: &str) -> bool {
        lock(&self.inner.state(kind).session).has_triggered(participant)
    }

    pub fn choices_of(&self, kind: VoteKind, participant: &str) -> Vec<usize> {
        lock(&self.inner.state(kind).session).choices_of(participant)
    }

    /// Cancels timers and clears both sessions
    pub fn reset(&self) {
        for kind in [VoteKind::Map, VoteKind::Mode] {
            let state = self.inner.state(kind);
            state.cancel_timer();
            lock(&state.session).reset();
        }
    }
}

impl Inner {
    fn state(&self, kind: VoteKind) -> &KindState {
        match kind {
            VoteKind::Map => &self.map,
            VoteKind::Mode => &self.mode,
        }
    }

    async fn handle_chat(self: &Arc<Self>, event: &DomainEvent) {
        let Some(command) = Command::parse(event.field("message")) else {
            return;
        };

        let player_id = event.field("player_id");
        let name = event.field("name");
        if player_id.is_empty() {
            debug!("Ignoring vote command from unknown player {}", name);
            return;
        }

        match command {
            Command::Trigger(kind) if self.state(kind).enabled => self.trigger(kind, player_id, name).await,
            Command::Retract(kind) if self.state(kind).enabled => self.retract(kind, player_id, name).await,
            Command::Nominate(candidate) if self.map.enabled => self.nominate(player_id, candidate).await,
            Command::MapList(page) if self.map.enabled => self.map_list(player_id, page).await,
            Command::ModeList if self.mode.enabled => self.mode_list(player_id).await,
            Command::Choice(choice) => self.choose(player_id, choice).await,
            _ => {}
        }
    }

    /// Applies a trigger-set change under both locks and opens the ballot
    /// when quorum is reached. `exclusive` rejects the change outright while
    /// the other kind is voting.
    fn update_triggers<F>(
        &self,
        kind: VoteKind,
        exclusive: bool,
        change: F,
    ) -> Result<(TriggerProgress, Option<(u64, Vec<String>)>), VoteError>
    where
        F: FnOnce(&mut VoteSession) -> Result<TriggerProgress, VoteError>,
    {
        let mut map = lock(&self.map.session);
        let mut mode = lock(&self.mode.session);
        let (own, other) = match kind {
            VoteKind::Map => (&mut *map, &*mode),
            VoteKind::Mode => (&mut *mode, &*map),
        };

        if exclusive && other.is_voting() {
            return Err(VoteError::OtherVoteActive(other.kind().noun()));
        }

        let progress = change(&mut *own)?;

        let opened = if progress.opens && !other.is_voting() {
            let mut rng = lock(&self.rng);
            let cycle = own.open(&mut *rng);
            Some((cycle, own.options().to_vec()))
        } else {
            None
        };

        Ok((progress, opened))
    }

    async fn trigger(self: &Arc<Self>, kind: VoteKind, player_id: &str, name: &str) {
        let players = self.console.player_count().await;
        let now = Instant::now();

        let outcome = self.update_triggers(kind, true, |session| session.trigger(player_id, players, now));

        match outcome {
            Ok((progress, opened)) => {
                info!("{} requested by {}", kind.label(), name);
                let what = match kind {
                    VoteKind::Map => "vote",
                    VoteKind::Mode => "mode",
                };
                self.console
                    .say(&format!(
                        "{}{} wants to rock the {} ({}{}/{}{})",
                        name, COLOR_RESET, what, COLOR_RED, progress.count, progress.required, COLOR_RESET
                    ))
                    .await;

                if let Some((cycle, options)) = opened {
                    self.start_ballot(kind, cycle, options, now).await;
                }
            }
            Err(e) => self.console.tell(player_id, &e.to_string()).await,
        }
    }

    async fn retract(self: &Arc<Self>, kind: VoteKind, player_id: &str, name: &str) {
        let players = self.console.player_count().await;
        let now = Instant::now();

        let outcome = self.update_triggers(kind, false, |session| session.retract(player_id, players, now));

        match outcome {
            Ok((progress, opened)) => {
                self.console
                    .say(&format!(
                        "{}{} removed {} vote ({}/{})",
                        name,
                        COLOR_RESET,
                        kind.label(),
                        progress.count,
                        progress.required
                    ))
                    .await;

                // Fewer players can lower the quorum below the remaining calls
                if let Some((cycle, options)) = opened {
                    self.start_ballot(kind, cycle, options, now).await;
                }
            }
            Err(e) => self.console.tell(player_id, &e.to_string()).await,
        }
    }

    async fn start_ballot(self: &Arc<Self>, kind: VoteKind, cycle: u64, options: Vec<String>, opened_at: Instant) {
        let state = self.state(kind);
        let rules = lock(&state.session).rules().clone();
        let window = rules.window_secs;
        info!("{} threshold reached, starting {} vote", kind.label(), kind.noun());

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run_timer(kind, cycle, rules, opened_at).await });

        if let Some((_, stale)) = lock(&state.timer).replace((cycle, handle)) {
            stale.abort();
        }

        self.console
            .say(&format!("{} vote started! Options: {}", title(kind), format_options(&options)))
            .await;
        self.console
            .say(&format!("Vote with !<number>. Ends in {}s.", window))
            .await;
    }

    /// Options of the ballot if it is still the one opened as `cycle`
    fn live_options(&self, kind: VoteKind, cycle: u64) -> Option<Vec<String>> {
        let session = lock(&self.state(kind).session);
        (session.is_voting() && session.cycle() == cycle).then(|| session.options().to_vec())
    }

    async fn run_timer(self: Arc<Self>, kind: VoteKind, cycle: u64, rules: VoteRules, opened_at: Instant) {
        for (at, tick) in schedule(&rules) {
            sleep_until(opened_at + at).await;

            let Some(options) = self.live_options(kind, cycle) else {
                return;
            };

            match tick {
                Tick::Countdown(secs) => {
                    let text = match kind {
                        VoteKind::Map => format!("Vote ends in {}s", secs),
                        VoteKind::Mode => format!("Mode vote ends in {}s", secs),
                    };
                    self.console.say(&highlight(&text)).await;
                }
                Tick::Prompt => {
                    self.console
                        .say(&format!("Reminder: {}", format_options(&options)))
                        .await;
                }
                Tick::Expire => {
                    self.expire(kind, cycle).await;
                    return;
                }
            }
        }
    }

    async fn expire(&self, kind: VoteKind, cycle: u64) {
        let players = self.console.player_count().await;
        let state = self.state(kind);

        let result = {
            let mut session = lock(&state.session);
            if !session.is_voting() || session.cycle() != cycle {
                return;
            }
            let mut rng = lock(&self.rng);
            session.resolve(players, &mut *rng)
        };

        // Detach our own handle; aborting it here would cancel this task
        {
            let mut timer = lock(&state.timer);
            if matches!(&*timer, Some((current, _)) if *current == cycle) {
                timer.take();
            }
        }

        self.console
            .say(&format!("{} closed with {} votes", kind.label(), result.triggers))
            .await;

        match result.resolution {
            Resolution::Failed => {
                info!("{} vote failed, {} votes required", kind.noun(), result.required);
                self.console
                    .say(&format!("Not enough {} votes; failed", kind.noun()))
                    .await;
            }
            Resolution::NoChange => {
                self.console
                    .say(&format!("Majority voted to keep current {}.", kind.noun()))
                    .await;
            }
            Resolution::Pending(target) => {
                info!("{} vote success: {}", kind.noun(), target);
                self.console
                    .say(&format!("Changing {} to {} next round", kind.noun(), highlight(&target)))
                    .await;
            }
        }
    }

    async fn choose(&self, player_id: &str, choice: usize) {
        let outcome = {
            let mut map = lock(&self.map.session);
            let mut mode = lock(&self.mode.session);
            if mode.is_voting() {
                Some(mode.cast(player_id, choice))
            } else if map.is_voting() {
                Some(map.cast(player_id, choice))
            } else {
                None
            }
        };

        let message = match outcome {
            None => return,
            Some(Ok(ballot)) if ballot.changed => format!(
                "You changed your vote to {} ({})",
                highlight(&ballot.option),
                ballot.votes
            ),
            Some(Ok(ballot)) => format!("You voted for {} ({})", highlight(&ballot.option), ballot.votes),
            Some(Err(e)) => e.to_string(),
        };

        self.console.tell(player_id, &message).await;
    }

    async fn nominate(&self, player_id: &str, candidate: &str) {
        let outcome = lock(&self.map.session).nominate(player_id, candidate);

        let message = match outcome {
            Ok(canonical) => format!("Nominated {}", highlight(&canonical)),
            Err(e) => e.to_string(),
        };
        self.console.tell(player_id, &message).await;
    }

    async fn map_list(&self, player_id: &str, page: Option<&str>) {
        let list = match page {
            Some("1") => &self.primary_maps,
            Some("2") => &self.secondary_maps,
            _ => {
                self.console.tell(player_id, "Usage: !maplist <1|2>").await;
                return;
            }
        };

        for line in paginate(list, LIST_PAGE) {
            self.console.tell(player_id, &line).await;
        }
    }

    async fn mode_list(&self, player_id: &str) {
        for line in paginate(&self.modes, LIST_PAGE) {
            self.console.tell(player_id, &line).await;
        }
    }

    fn purge(&self, player_id: &str) {
        let mut map = lock(&self.map.session);
        let mut mode = lock(&self.mode.session);
        map.purge(player_id);
        mode.purge(player_id);
        debug!("Purged {} from votes", player_id);
    }

    async fn apply_pending(&self) {
        for kind in [VoteKind::Map, VoteKind::Mode] {
            let state = self.state(kind);
            if lock(&state.session).pending().is_none() {
                continue;
            }

            let current = match kind {
                VoteKind::Map => self.console.current_map().await,
                VoteKind::Mode => self.console.current_mode().await,
            };

            let taken = lock(&state.session).take_pending(current.as_deref());
            let Some(target) = taken else {
                debug!("{} already matches the vote result", kind.noun());
                continue;
            };

            self.console
                .say(&format!("Changing {} to {} now", kind.noun(), highlight(&target)))
                .await;

            match kind {
                VoteKind::Map => self.console.change_map(&target).await,
                VoteKind::Mode => self.console.change_mode(&target).await,
            }

            lock(&state.session).engage_lock(Instant::now());
        }
    }
}

#[async_trait]
impl Subscriber for VoteController {
    fn name(&self) -> &str {
        "votes"
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        match event.kind {
            EventKind::Chat | EventKind::ChatCommand => self.inner.handle_chat(event).await,
            EventKind::Disconnect => self.inner.purge(event.field("player_id")),
            EventKind::RoundEnd => self.inner.apply_pending().await,
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for VoteController {
    fn name(&self) -> &str {
        "votes"
    }

    fn register(self: Arc<Self>, ctx: &PluginContext) {
        for kind in [
            EventKind::Chat,
            EventKind::ChatCommand,
            EventKind::Disconnect,
            EventKind::RoundEnd,
        ] {
            ctx.bus.subscribe(kind, self.clone());
        }
    }

    async fn stop(&self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::testing::MockConsole;
    use tokio::time::sleep;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|m| m.to_string()).collect()
    }

    fn settings() -> VoteSettings {
        VoteSettings {
            map: VoteRules {
                flood_secs: 0,
                ..VoteRules::default()
            },
            mode: VoteRules {
                flood_secs: 0,
                ..VoteRules::default()
            },
            primary_maps: names(&[
                "mb2_dotf",
                "mb2_cmp_arena",
                "mb2_deathstar",
                "mb2_commtower",
                "mb2_jeditemple",
                "mb2_lunarbase",
            ]),
            secondary_maps: names(&["mb2_kamino", "mb2_sith_academy"]),
            modes: names(&["Open", "Semi-Authentic", "Full-Authentic", "Duel", "Legends"]),
        }
    }

    fn controller(console: &Arc<MockConsole>) -> VoteController {
        VoteController::with_rng(&settings(), console.clone(), StdRng::seed_from_u64(11))
    }

    fn chat(player_id: &str, message: &str) -> DomainEvent {
        let kind = if message.starts_with('!') {
            EventKind::ChatCommand
        } else {
            EventKind::Chat
        };
        DomainEvent::new(kind)
            .with("player_id", player_id)
            .with("name", format!("Player{}", player_id))
            .with("message", message)
    }

    async fn send(votes: &VoteController, player_id: &str, message: &str) {
        votes.on_event(&chat(player_id, message)).await.unwrap();
    }

    async fn open_map_vote(votes: &VoteController, players: usize) {
        for pid in 1..=quorum(players, 50) {
            send(votes, &pid.to_string(), "!rtv").await;
        }
    }

    #[test]
    fn test_command_parsing() {
        assert!(matches!(Command::parse("!rtv"), Some(Command::Trigger(VoteKind::Map))));
        assert!(matches!(Command::parse("RTM"), Some(Command::Trigger(VoteKind::Mode))));
        assert!(matches!(Command::parse("!unrtv"), Some(Command::Retract(VoteKind::Map))));
        assert!(matches!(Command::parse("!nominate mb2_dotf"), Some(Command::Nominate("mb2_dotf"))));
        assert!(matches!(Command::parse("!maplist 2"), Some(Command::MapList(Some("2")))));
        assert!(matches!(Command::parse("!3"), Some(Command::Choice(3))));
        assert!(matches!(
            Command::parse("!99999999999999999999999"),
            Some(Command::Choice(usize::MAX))
        ));
        assert!(Command::parse("!nominate").is_none());
        assert!(Command::parse("rtv please").is_none());
        assert!(Command::parse("hello").is_none());
    }

    #[test]
    fn test_schedule_order() {
        let ticks = schedule(&VoteRules::default());
        let at: Vec<(u64, Tick)> = ticks.iter().map(|(d, t)| (d.as_secs(), *t)).collect();

        assert_eq!(
            at,
            vec![
                (10, Tick::Countdown(20)),
                (15, Tick::Prompt),
                (20, Tick::Countdown(10)),
                (25, Tick::Countdown(5)),
                (30, Tick::Expire),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_vote_opens_at_quorum() {
        let console = Arc::new(MockConsole::with_players(10));
        let votes = controller(&console);

        for pid in 1..=4 {
            send(&votes, &pid.to_string(), "!rtv").await;
        }
        assert_eq!(votes.snapshot(VoteKind::Map).phase, Phase::Collecting);
        assert!(console.said_containing("wants to rock the vote (^14/5^7)"));

        send(&votes, "5", "!rtv").await;

        let snapshot = votes.snapshot(VoteKind::Map);
        assert_eq!(snapshot.phase, Phase::Voting);
        assert_eq!(snapshot.options.len(), MAX_OPTIONS + 1);
        assert_eq!(snapshot.options.last().map(String::as_str), Some(NO_CHANGE));
        assert!(console.said_containing("Map vote started! Options: ^11^7:"));
        assert!(console.said_containing("Vote with !<number>. Ends in 30s."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_votes_fail() {
        let console = Arc::new(MockConsole::with_players(10));
        let votes = controller(&console);
        open_map_vote(&votes, 10).await;

        for pid in 1..=4 {
            send(&votes, &pid.to_string(), "!1").await;
        }
        sleep(Duration::from_secs(31)).await;

        assert!(console.said_containing("Not enough map votes; failed"));
        let snapshot = votes.snapshot(VoteKind::Map);
        assert_eq!(snapshot.pending, None);
        assert_eq!(snapshot.phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_applied_at_round_end_then_locked() {
        let console = Arc::new(MockConsole::with_players(10));
        console.set_map("mb2_smuggler");
        let votes = controller(&console);
        open_map_vote(&votes, 10).await;

        let target = votes.snapshot(VoteKind::Map).options[0].clone();
        for pid in 1..=5 {
            send(&votes, &pid.to_string(), "!1").await;
        }
        sleep(Duration::from_secs(31)).await;

        assert!(console.said_containing(&format!("Changing map to ^1{}^7 next round", target)));
        assert_eq!(votes.snapshot(VoteKind::Map).pending.as_deref(), Some(target.as_str()));
        assert!(console.map_changes.lock().unwrap().is_empty());

        votes.on_event(&DomainEvent::new(EventKind::RoundEnd)).await.unwrap();

        assert_eq!(*console.map_changes.lock().unwrap(), vec![target.clone()]);
        assert_eq!(votes.snapshot(VoteKind::Map).pending, None);

        send(&votes, "6", "!rtv").await;
        assert_eq!(console.told_to("6"), vec!["Please wait 5s as RTV is on cooldown"]);
        assert!(!votes.has_triggered(VoteKind::Map, "6"));

        sleep(Duration::from_secs(6)).await;
        send(&votes, "6", "!rtv").await;
        assert!(votes.has_triggered(VoteKind::Map, "6"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_equal_to_current_is_dropped() {
        let console = Arc::new(MockConsole::with_players(1));
        console.set_map("mb2_smuggler");
        let votes = controller(&console);
        open_map_vote(&votes, 1).await;

        let target = votes.snapshot(VoteKind::Map).options[0].clone();
        send(&votes, "1", "!1").await;
        sleep(Duration::from_secs(31)).await;

        console.set_map(&target);
        votes.on_event(&DomainEvent::new(EventKind::RoundEnd)).await.unwrap();

        assert!(console.map_changes.lock().unwrap().is_empty());
        let snapshot = votes.snapshot(VoteKind::Map);
        assert_eq!(snapshot.pending, None);
        assert_eq!(snapshot.locked_secs, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminders_and_no_change() {
        let console = Arc::new(MockConsole::with_players(1));
        let votes = controller(&console);
        open_map_vote(&votes, 1).await;

        send(&votes, "1", "!5").await;
        sleep(Duration::from_secs(31)).await;

        for text in ["^1Vote ends in 20s^7", "^1Vote ends in 10s^7", "^1Vote ends in 5s^7", "Reminder: "] {
            assert!(console.said_containing(text), "missing {}", text);
        }
        assert!(console.said_containing("RTV closed with 1 votes"));
        assert!(console.said_containing("Majority voted to keep current map."));
        assert_eq!(votes.snapshot(VoteKind::Map).pending, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_choices_replace_and_reject() {
        let console = Arc::new(MockConsole::with_players(1));
        let votes = controller(&console);
        open_map_vote(&votes, 1).await;

        send(&votes, "1", "!2").await;
        send(&votes, "1", "!3").await;
        send(&votes, "1", "!9").await;

        assert_eq!(votes.choices_of(VoteKind::Map, "1"), vec![3]);
        let told = console.told_to("1");
        assert!(told[0].starts_with("You voted for"));
        assert!(told[1].starts_with("You changed your vote to"));
        assert_eq!(told[2], "Invalid choice 1-5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_purges_both_kinds() {
        let console = Arc::new(MockConsole::with_players(10));
        let votes = controller(&console);

        send(&votes, "1", "!rtv").await;
        send(&votes, "1", "!rtm").await;
        assert!(votes.has_triggered(VoteKind::Map, "1"));
        assert!(votes.has_triggered(VoteKind::Mode, "1"));

        votes
            .on_event(&DomainEvent::new(EventKind::Disconnect).with("player_id", "1"))
            .await
            .unwrap();

        assert!(!votes.has_triggered(VoteKind::Map, "1"));
        assert!(!votes.has_triggered(VoteKind::Mode, "1"));

        console.set_players(1);
        send(&votes, "2", "!rtv").await;
        send(&votes, "2", "!1").await;
        votes
            .on_event(&DomainEvent::new(EventKind::Disconnect).with("player_id", "2"))
            .await
            .unwrap();
        assert!(votes.choices_of(VoteKind::Map, "2").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_kind_votes_at_a_time() {
        let console = Arc::new(MockConsole::with_players(1));
        let votes = controller(&console);

        send(&votes, "1", "!rtv").await;
        assert_eq!(votes.snapshot(VoteKind::Map).phase, Phase::Voting);

        send(&votes, "2", "!rtm").await;
        assert_eq!(console.told_to("2"), vec!["A map vote is already in progress"]);
        assert_eq!(votes.snapshot(VoteKind::Mode).phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_timers() {
        let console = Arc::new(MockConsole::with_players(1));
        let votes = controller(&console);
        send(&votes, "1", "!rtv").await;

        Plugin::stop(&votes).await;
        sleep(Duration::from_secs(31)).await;

        assert!(!console.said_containing("closed with"));
        assert!(!console.said_containing("Vote ends in"));
        assert_eq!(votes.snapshot(VoteKind::Map).phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lists_and_nominations() {
        let console = Arc::new(MockConsole::with_players(10));
        let votes = controller(&console);

        send(&votes, "1", "!maplist 1").await;
        send(&votes, "1", "!maplist").await;
        send(&votes, "2", "!nominate MB2_KAMINO").await;
        send(&votes, "2", "!nominate mb2_nowhere").await;
        send(&votes, "3", "!modelist").await;

        assert_eq!(
            console.told_to("1"),
            vec![
                "mb2_dotf, mb2_cmp_arena, mb2_deathstar, mb2_commtower, mb2_jeditemple",
                "mb2_lunarbase",
                "Usage: !maplist <1|2>",
            ]
        );
        assert_eq!(
            console.told_to("2"),
            vec!["Nominated ^1mb2_kamino^7", "Unknown map: mb2_nowhere"]
        );
        assert_eq!(
            console.told_to("3"),
            vec!["Open, Semi-Authentic, Full-Authentic, Duel, Legends"]
        );

        // The nomination leads the next ballot
        for pid in 1..=5 {
            send(&votes, &pid.to_string(), "!rtv").await;
        }
        assert_eq!(votes.snapshot(VoteKind::Map).options[0], "mb2_kamino");
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_without_player_id_are_ignored() {
        let console = Arc::new(MockConsole::with_players(1));
        let votes = controller(&console);

        votes.on_event(&chat("", "!rtv")).await.unwrap();

        assert_eq!(votes.snapshot(VoteKind::Map).phase, Phase::Idle);
        assert!(console.said().is_empty());
    }
}
