//! Turns a change report into a notification.
//!
//! The lead-in phrase is picked at random from a pool chosen by whether
//! anything went down; the RNG is injectable so tests can pin the choice.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::diff::{ChangeReport, Direction, EntityClass};

pub const COLOR_DOWN: u32 = 0xE74C3C; // red
pub const COLOR_UP: u32 = 0x2ECC71; // green
pub const COLOR_MIXED: u32 = 0xF1C40F; // yellow

struct Phrases {
    title: &'static str,
    down: &'static [&'static str],
    up: &'static [&'static str],
}

const PEER_PHRASES: Phrases = Phrases {
    title: "📞 Extension state changed",
    down: &["Uh-oh, looks like something happened...", "Ugh...", "Huh?"],
    up: &["Oh, looks like it sorted itself out!", "Welcome back~", "Back online!"],
};

const PROVIDER_PHRASES: Phrases = Phrases {
    title: "🌐 Provider state change detected",
    down: &["Uh-oh, something happened upstream...", "The trunk is acting up..."],
    up: &["The trunk is back!", "Upstream recovered!"],
};

fn phrases(class: EntityClass) -> &'static Phrases {
    match class {
        EntityClass::Peer => &PEER_PHRASES,
        EntityClass::Provider => &PROVIDER_PHRASES,
    }
}

/// Severity color for a cycle; `None` never reaches a sink.
pub fn color(direction: Direction) -> Option<u32> {
    match direction {
        Direction::Down => Some(COLOR_DOWN),
        Direction::Up => Some(COLOR_UP),
        Direction::Mixed => Some(COLOR_MIXED),
        Direction::None => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Lead-in phrase
    pub content: String,
    pub title: String,
    /// One "- ..." line per change
    pub body: String,
    pub color: u32,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Single-message form for sinks without structured messages
    pub fn plain_text(&self) -> String {
        format!("{}\n{}", self.content, self.body)
    }
}

pub struct Renderer<R = StdRng> {
    rng: R,
}

impl Renderer<StdRng> {
    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl<R: Rng> Renderer<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Render `report`, or `None` when there is nothing to say.
    pub fn render(&mut self, report: &ChangeReport, now: DateTime<Utc>) -> Option<Notification> {
        if report.is_empty() {
            return None;
        }
        let color = color(report.direction)?;
        let phrases = phrases(report.class);
        let pool = if report.has_down() {
            phrases.down
        } else {
            phrases.up
        };
        let content = pool.choose(&mut self.rng).copied().unwrap_or_default();

        Some(Notification {
            content: content.to_string(),
            title: phrases.title.to_string(),
            body: format!("- {}", report.lines().join("\n- ")),
            color,
            timestamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::diff::{diff, is_peer_online, is_provider_online};
    use crate::watch::Snapshot;
    use chrono::TimeZone;

    fn snapshot(entries: &[(&str, &str)]) -> Snapshot {
        entries
            .iter()
            .map(|(id, state)| (id.to_string(), state.to_string()))
            .collect()
    }

    fn peer_report(prev: &[(&str, &str)], cur: &[(&str, &str)]) -> ChangeReport {
        let transitions = diff(&snapshot(prev), &snapshot(cur), is_peer_online);
        ChangeReport::new(EntityClass::Peer, transitions, |id| id.to_string())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn seeded() -> Renderer<StdRng> {
        Renderer::with_rng(StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_colors() {
        assert_eq!(color(Direction::Down), Some(COLOR_DOWN));
        assert_eq!(color(Direction::Up), Some(COLOR_UP));
        assert_eq!(color(Direction::Mixed), Some(COLOR_MIXED));
        assert_eq!(color(Direction::None), None);
    }

    #[test]
    fn test_empty_report_not_rendered() {
        let report = peer_report(&[("201", "OK")], &[("201", "OK")]);
        assert!(seeded().render(&report, now()).is_none());
    }

    #[test]
    fn test_down_uses_negative_pool() {
        let report = peer_report(&[("201", "OK")], &[("201", "UNKNOWN")]);
        let message = seeded().render(&report, now()).expect("should render");
        assert!(PEER_PHRASES.down.contains(&message.content.as_str()));
        assert_eq!(message.color, COLOR_DOWN);
        assert_eq!(message.title, PEER_PHRASES.title);
        assert_eq!(message.body, "- Extension 201: online → offline");
        assert_eq!(message.timestamp, now());
    }

    #[test]
    fn test_up_uses_positive_pool() {
        let report = peer_report(&[("201", "UNKNOWN")], &[("201", "OK")]);
        let message = seeded().render(&report, now()).expect("should render");
        assert!(PEER_PHRASES.up.contains(&message.content.as_str()));
        assert_eq!(message.color, COLOR_UP);
    }

    #[test]
    fn test_mixed_uses_negative_pool_and_warning_color() {
        let report = peer_report(
            &[("p1", "OK"), ("p2", "OK")],
            &[("p1", "UNKNOWN"), ("p3", "OK")],
        );
        let message = seeded().render(&report, now()).expect("should render");
        assert!(PEER_PHRASES.down.contains(&message.content.as_str()));
        assert_eq!(message.color, COLOR_MIXED);
        assert_eq!(
            message.body,
            "- Extension p1: online → offline\n- Extension p2: online → offline\n- Extension p3: offline → online"
        );
    }

    #[test]
    fn test_provider_phrases() {
        let transitions = diff(
            &snapshot(&[("SIP-1", "OFF")]),
            &snapshot(&[("SIP-1", "OK")]),
            is_provider_online,
        );
        let report = ChangeReport::new(EntityClass::Provider, transitions, |id| id.to_string());
        let message = seeded().render(&report, now()).expect("should render");
        assert_eq!(message.title, PROVIDER_PHRASES.title);
        assert!(PROVIDER_PHRASES.up.contains(&message.content.as_str()));
    }

    #[test]
    fn test_seeded_rendering_is_deterministic() {
        let report = peer_report(&[("201", "OK")], &[("201", "UNKNOWN")]);
        let a = seeded().render(&report, now());
        let b = seeded().render(&report, now());
        assert_eq!(a, b);
    }

    #[test]
    fn test_plain_text() {
        let report = peer_report(&[("201", "OK")], &[("201", "UNKNOWN")]);
        let message = seeded().render(&report, now()).expect("should render");
        assert_eq!(
            message.plain_text(),
            format!("{}\n- Extension 201: online → offline", message.content)
        );
    }
}
