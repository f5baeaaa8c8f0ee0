//! Reconnect candidate-list bookkeeping.
//!
//! Unlike libzmq-style exponential backoff, the NATS reconnect supervisor
//! cycles a *list* of candidate URLs (seed URLs, refreshed from the server's
//! advertised connect URLs whenever a fresh INFO arrives) and waits a fixed
//! `reconnect_wait + uniform(0, reconnect_jitter)` between full passes over
//! the list, not between individual attempts (§4.1).

use crate::options::ConnectOptions;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

/// Tracks the ordered set of URLs to try and the previously-connected one, so
/// that URL is retried last rather than first.
#[derive(Debug, Clone, Default)]
pub struct ReconnectCandidates {
    urls: Vec<String>,
    cursor: usize,
}

impl ReconnectCandidates {
    /// Build a fresh candidate list.
    ///
    /// `advertised` is the most recent INFO's connect-url set; when non-empty
    /// it replaces the seed list entirely (the server's view supersedes the
    /// caller's static configuration once learned). `previous` is the URL the
    /// connection was using before it dropped, if any; it is moved to the end
    /// so other candidates are tried first.
    #[must_use]
    pub fn build(
        options: &ConnectOptions,
        advertised: &[String],
        previous: Option<&str>,
    ) -> Self {
        let mut urls: Vec<String> = if advertised.is_empty() {
            options.seed_urls.clone()
        } else {
            advertised.to_vec()
        };

        dedup_preserve_order(&mut urls);

        if !options.no_randomize {
            urls.shuffle(&mut rand::thread_rng());
        }

        if let Some(prev) = previous {
            if let Some(pos) = urls.iter().position(|u| u == prev) {
                let u = urls.remove(pos);
                urls.push(u);
            }
        }

        Self { urls, cursor: 0 }
    }

    /// Advance to, and return, the next candidate. Wraps around to the start
    /// of the list (the caller sleeps the jittered delay on wraparound, via
    /// `exhausted()`).
    pub fn next(&mut self) -> Option<&str> {
        if self.urls.is_empty() {
            return None;
        }
        let url = &self.urls[self.cursor % self.urls.len()];
        self.cursor += 1;
        Some(url)
    }

    /// Whether the cursor has completed a full pass over the list since the
    /// last reset, i.e. the caller should sleep the jittered reconnect delay
    /// before trying again.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        !self.urls.is_empty() && self.cursor % self.urls.len() == 0 && self.cursor > 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

fn dedup_preserve_order(urls: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::with_capacity(urls.len());
    urls.retain(|u| seen.insert(u.clone()));
}

/// `reconnect_wait + uniform(0, reconnect_jitter)`.
#[must_use]
pub fn jittered_delay(options: &ConnectOptions) -> Duration {
    let jitter = if options.reconnect_jitter.is_zero() {
        Duration::ZERO
    } else {
        let millis = options.reconnect_jitter.as_millis().max(1) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    };
    options.reconnect_wait + jitter
}

/// Error type surfaced when every candidate in a reconnect round has been
/// tried and failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    NoCandidates,
    AllCandidatesFailed { attempts: u32 },
}

impl std::fmt::Display for ReconnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCandidates => write!(f, "no reconnect candidates configured"),
            Self::AllCandidatesFailed { attempts } => {
                write!(f, "all reconnect candidates failed ({attempts} attempts)")
            }
        }
    }
}

impl std::error::Error for ReconnectError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_preserving_first_occurrence_order() {
        let options = ConnectOptions::default().with_no_randomize(true);
        let advertised = vec![
            "nats://a:4222".to_string(),
            "nats://b:4222".to_string(),
            "nats://a:4222".to_string(),
        ];
        let candidates = ReconnectCandidates::build(&options, &advertised, None);
        assert_eq!(candidates.urls, vec!["nats://a:4222", "nats://b:4222"]);
    }

    #[test]
    fn falls_back_to_seed_urls_when_nothing_advertised() {
        let options = ConnectOptions::default()
            .with_seed_urls(vec!["nats://seed:4222".into()])
            .with_no_randomize(true);
        let candidates = ReconnectCandidates::build(&options, &[], None);
        assert_eq!(candidates.urls, vec!["nats://seed:4222"]);
    }

    #[test]
    fn previous_url_moved_to_end() {
        let options = ConnectOptions::default().with_no_randomize(true);
        let advertised = vec![
            "nats://a:4222".to_string(),
            "nats://b:4222".to_string(),
            "nats://c:4222".to_string(),
        ];
        let candidates = ReconnectCandidates::build(&options, &advertised, Some("nats://b:4222"));
        assert_eq!(
            candidates.urls,
            vec!["nats://a:4222", "nats://c:4222", "nats://b:4222"]
        );
    }

    #[test]
    fn cursor_wraps_and_reports_exhaustion() {
        let options = ConnectOptions::default().with_no_randomize(true);
        let advertised = vec!["nats://a:4222".to_string(), "nats://b:4222".to_string()];
        let mut candidates = ReconnectCandidates::build(&options, &advertised, None);

        assert_eq!(candidates.next(), Some("nats://a:4222"));
        assert!(!candidates.exhausted());
        assert_eq!(candidates.next(), Some("nats://b:4222"));
        assert!(candidates.exhausted());
        assert_eq!(candidates.next(), Some("nats://a:4222"));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let options = ConnectOptions::default()
            .with_reconnect_wait(Duration::from_millis(500))
            .with_reconnect_jitter(Duration::from_millis(100));

        for _ in 0..50 {
            let delay = jittered_delay(&options);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(600));
        }
    }
}
