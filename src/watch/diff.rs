//! Online/offline transition detection between two snapshots.
//!
//! Only the derived online flag matters: "UNKNOWN" -> "FAILED" is no news,
//! "OK" -> "UNKNOWN" is. An empty previous snapshot is the cold-start
//! sentinel and never yields transitions.

use std::fmt;

use super::store::Snapshot;

/// The two kinds of monitored entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    /// Local SIP extension
    Peer,
    /// Upstream trunk registration
    Provider,
}

impl EntityClass {
    pub fn is_online(self, state: &str) -> bool {
        match self {
            EntityClass::Peer => is_peer_online(state),
            EntityClass::Provider => is_provider_online(state),
        }
    }

    /// Word used in front of each change line.
    pub fn noun(self) -> &'static str {
        match self {
            EntityClass::Peer => "Extension",
            EntityClass::Provider => "Provider",
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityClass::Peer => f.write_str("peers"),
            EntityClass::Provider => f.write_str("providers"),
        }
    }
}

/// Peer status is "OK" when registered; "UNKNOWN", "UNREACHABLE" etc. otherwise.
pub fn is_peer_online(state: &str) -> bool {
    is_ok(state)
}

/// Registry entries report "OK" or "OFF"/"REJECTED"/"UNREGISTERED".
pub fn is_provider_online(state: &str) -> bool {
    is_ok(state)
}

/// Unicode case-insensitive match, so the Kelvin sign folds to `k`.
fn is_ok(state: &str) -> bool {
    let mut chars = state.chars().flat_map(char::to_lowercase);
    chars.next() == Some('o') && chars.next() == Some('k') && chars.next().is_none()
}

/// Overall character of one cycle's transitions, used for severity styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    None,
    Up,
    Down,
    Mixed,
}

impl Direction {
    pub fn from_flags(has_up: bool, has_down: bool) -> Self {
        match (has_up, has_down) {
            (true, true) => Direction::Mixed,
            (false, true) => Direction::Down,
            (true, false) => Direction::Up,
            (false, false) => Direction::None,
        }
    }

    pub fn of<'a, I>(transitions: I) -> Self
    where
        I: IntoIterator<Item = &'a Transition>,
    {
        let (mut has_up, mut has_down) = (false, false);
        for t in transitions {
            has_up |= t.is_up();
            has_down |= t.is_down();
        }
        Self::from_flags(has_up, has_down)
    }
}

/// A change of derived online state for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transition {
    pub id: String,
    pub was_online: bool,
    pub is_online: bool,
}

impl Transition {
    fn new(id: &str, was_online: bool, is_online: bool) -> Self {
        Self {
            id: id.to_string(),
            was_online,
            is_online,
        }
    }

    pub fn is_up(&self) -> bool {
        !self.was_online && self.is_online
    }

    pub fn is_down(&self) -> bool {
        self.was_online && !self.is_online
    }
}

/// Compare two snapshots. Results come back ordered by id.
///
/// - unseen ids count as previously offline, so only online newcomers are reported
/// - vanished ids count as now offline, so only previously online ones are reported
pub fn diff<F>(previous: &Snapshot, current: &Snapshot, online: F) -> Vec<Transition>
where
    F: Fn(&str) -> bool,
{
    if previous.is_empty() {
        return Vec::new();
    }

    let mut transitions = Vec::new();

    for (id, state) in current {
        let now = online(state);
        let before = previous.get(id).map(|prev| online(prev)).unwrap_or(false);
        if before != now {
            transitions.push(Transition::new(id, before, now));
        }
    }

    for (id, prev) in previous {
        if !current.contains_key(id) && online(prev) {
            transitions.push(Transition::new(id, true, false));
        }
    }

    transitions.sort_by(|a, b| a.id.cmp(&b.id));
    transitions
}

/// A transition with its display label attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub class: EntityClass,
    pub id: String,
    pub label: String,
    pub from: bool,
    pub to: bool,
}

impl TransitionEvent {
    pub fn describe(&self) -> String {
        format!(
            "{} {}: {} → {}",
            self.class.noun(),
            self.label,
            state_word(self.from),
            state_word(self.to)
        )
    }

    pub fn is_down(&self) -> bool {
        self.from && !self.to
    }
}

fn state_word(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "offline"
    }
}

/// Everything one class changed in one cycle, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeReport {
    pub class: EntityClass,
    pub events: Vec<TransitionEvent>,
    pub direction: Direction,
}

impl ChangeReport {
    /// Attach labels and order events by their rendered text.
    pub fn new<L>(class: EntityClass, transitions: Vec<Transition>, mut label: L) -> Self
    where
        L: FnMut(&str) -> String,
    {
        let direction = Direction::of(&transitions);
        let mut events: Vec<TransitionEvent> = transitions
            .into_iter()
            .map(|t| TransitionEvent {
                class,
                label: label(&t.id),
                id: t.id,
                from: t.was_online,
                to: t.is_online,
            })
            .collect();
        events.sort_by_cached_key(|e| e.describe());

        Self {
            class,
            events,
            direction,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn has_down(&self) -> bool {
        self.events.iter().any(TransitionEvent::is_down)
    }

    pub fn lines(&self) -> Vec<String> {
        self.events.iter().map(TransitionEvent::describe).collect()
    }
}
