//! Status and fingerprint lines for operators, and health classification for
//! alert sinks.

use std::time::Duration;

use crate::alert::Health;
use crate::pair::{LagLevel, State, Status};
use crate::zfs::Dataset;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub source: Dataset,
    pub destination: Dataset,
    pub state: State,
    pub status: Status,
    pub lag: Duration,
    pub lag_level: LagLevel,
    pub locked: bool,
    pub last_snapshot: Option<String>,
    pub port: u16,
    pub runtime: Duration,
}

impl StatusReport {
    /// One fixed-width line. `full` adds the last snapshot name and port.
    pub fn render(&self, full: bool) -> String {
        let mut line = format!(
            "{:<8}:{:<45}  {:>8}:{:<36}  {:<14}  {}{}  ",
            self.source.host(),
            self.source.path(),
            self.destination.host(),
            self.destination.path(),
            self.state.label(),
            hms(self.lag, 3),
            self.flag(),
        );
        if full {
            line.push_str(&format!(
                "{:>26}:{}  ",
                self.last_snapshot.as_deref().unwrap_or("-"),
                self.port
            ));
        }
        line.push_str(&format!("{} ({})", self.status, hms(self.runtime, 1)));
        line
    }

    /// `!` critical lag, `+` warning lag, `L` locked, blank otherwise.
    pub fn flag(&self) -> char {
        match self.lag_level {
            LagLevel::Critical => '!',
            LagLevel::Warning => '+',
            LagLevel::Ok if self.locked => 'L',
            LagLevel::Ok => ' ',
        }
    }

    /// Health and a short message for an alert sink.
    pub fn health(&self) -> (Health, String) {
        match (self.state, self.lag_level) {
            (State::Inconsistent(reason), _) => (
                Health::Critical,
                format!("state is {} ({})", self.state.label(), reason),
            ),
            (_, LagLevel::Critical) => (Health::Critical, "lag is CRITICAL".to_string()),
            (_, LagLevel::Warning) => (Health::Warning, "lag is WARNING".to_string()),
            (_, LagLevel::Ok) => (Health::Ok, format!("{}: OK", self.status)),
        }
    }
}

pub fn fingerprint_line(source: &Dataset, destination: &Dataset, fingerprint: &str) -> String {
    format!(
        "{:<8}:{:<45}  {:>8}:{:<36}  {}",
        source.host(),
        source.path(),
        destination.host(),
        destination.path(),
        fingerprint
    )
}

/// `h:mm:ss` with the hour field padded to `width`.
pub fn hms(duration: Duration, width: usize) -> String {
    let secs = duration.as_secs();
    format!(
        "{:>width$}:{:02}:{:02}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        width = width
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair::Inconsistency;

    fn report() -> StatusReport {
        StatusReport {
            source: Dataset::new("tank/home", "src01"),
            destination: Dataset::new("backup/home", "dst01"),
            state: State::Synchronized,
            status: Status::Idle,
            lag: Duration::from_secs(3 * 3600 + 4 * 60 + 5),
            lag_level: LagLevel::Ok,
            locked: false,
            last_snapshot: Some("zettabee.abc.20240101000000Z".into()),
            port: 9001,
            runtime: Duration::ZERO,
        }
    }

    #[test]
    fn test_hms() {
        assert_eq!(hms(Duration::from_secs(3725), 3), "  1:02:05");
        assert_eq!(hms(Duration::from_secs(0), 1), "0:00:00");
        assert_eq!(hms(Duration::from_secs(100 * 3600), 1), "100:00:00");
    }

    #[test]
    fn test_render_short_and_full() {
        let short = report().render(false);
        assert!(short.starts_with("src01   :tank/home"));
        assert!(short.contains("   dst01:backup/home"));
        assert!(short.contains("Synchronized"));
        assert!(short.contains("  3:04:05 "));
        assert!(short.ends_with("Idle (0:00:00)"));
        assert!(!short.contains("9001"));

        let full = report().render(true);
        assert!(full.contains("zettabee.abc.20240101000000Z:9001"));
    }

    #[test]
    fn test_flag() {
        let mut r = report();
        assert_eq!(r.flag(), ' ');
        r.locked = true;
        assert_eq!(r.flag(), 'L');
        r.lag_level = LagLevel::Warning;
        assert_eq!(r.flag(), '+');
        r.lag_level = LagLevel::Critical;
        assert_eq!(r.flag(), '!');
    }

    #[test]
    fn test_health() {
        let mut r = report();
        assert_eq!(r.health(), (Health::Ok, "Idle: OK".to_string()));

        r.lag_level = LagLevel::Warning;
        assert_eq!(r.health().0, Health::Warning);

        r.lag_level = LagLevel::Critical;
        assert_eq!(r.health().0, Health::Critical);

        r.lag_level = LagLevel::Ok;
        r.state = State::Inconsistent(Inconsistency::MismatchedFingerprint);
        let (health, message) = r.health();
        assert_eq!(health, Health::Critical);
        assert!(message.contains("Inconsistent!"));
    }

    #[test]
    fn test_fingerprint_line() {
        let line = fingerprint_line(
            &Dataset::new("tank/home", "src01"),
            &Dataset::new("backup/home", "dst01"),
            "abc",
        );
        assert!(line.ends_with("  abc"));
    }
}
