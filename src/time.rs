//! Implementation of cache time policies.
//!
//! A policy maps the current time to a [`CacheTimeWindow`]. Policies are
//! evaluated afresh for every decision the cache makes; a window is never
//! carried from one request to the next.

use std::time::Duration;
use std::time::SystemTime;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;

use crate::options::CacheOutputOptions;

/// The number of seconds in a day.
const SECONDS_PER_DAY: u64 = 86_400;

/// Represents the result of evaluating a cache time policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTimeWindow {
    /// How long the response is kept in server storage.
    pub server_duration: Duration,
    /// How long a client may reuse the response (`max-age`).
    pub client_duration: Duration,
    /// How long a shared cache may reuse the response (`s-maxage`).
    pub shared_duration: Option<Duration>,
    /// Whether clients must revalidate once the response is stale.
    pub must_revalidate: bool,
    /// The instant after which the stored response is no longer served.
    pub absolute_expiration: SystemTime,
}

/// A trait implemented on cache time policies.
pub trait CacheTimeQuery: Send + Sync + 'static {
    /// Evaluates the policy at the given instant.
    ///
    /// An error disables caching for the request being considered.
    fn evaluate(&self, now: SystemTime) -> Result<CacheTimeWindow>;
}

/// A policy with fixed server and client durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortTime {
    /// The server storage duration.
    pub server: Duration,
    /// The client `max-age` duration.
    pub client: Duration,
    /// The shared cache `s-maxage` duration.
    pub shared: Option<Duration>,
    /// Whether to require revalidation.
    pub must_revalidate: bool,
}

impl ShortTime {
    /// Constructs a new policy with the given server and client durations.
    pub fn new(server: Duration, client: Duration) -> Self {
        Self {
            server,
            client,
            shared: None,
            must_revalidate: false,
        }
    }

    /// Sets the shared cache duration.
    pub fn with_shared(mut self, shared: Duration) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Sets whether clients must revalidate stale responses.
    pub fn with_must_revalidate(mut self, must_revalidate: bool) -> Self {
        self.must_revalidate = must_revalidate;
        self
    }
}

impl From<&CacheOutputOptions> for ShortTime {
    fn from(options: &CacheOutputOptions) -> Self {
        Self {
            server: Duration::from_secs(options.server_time_span),
            client: Duration::from_secs(options.client_time_span),
            shared: options.shared_time_span.map(Duration::from_secs),
            must_revalidate: options.must_revalidate,
        }
    }
}

impl CacheTimeQuery for ShortTime {
    fn evaluate(&self, now: SystemTime) -> Result<CacheTimeWindow> {
        let absolute_expiration = now
            .checked_add(self.server)
            .context("server cache duration overflows the system time")?;

        Ok(CacheTimeWindow {
            server_duration: self.server,
            client_duration: self.client,
            shared_duration: self.shared,
            must_revalidate: self.must_revalidate,
            absolute_expiration,
        })
    }
}

/// A policy that expires responses at a fixed UTC time of day.
///
/// Clients are told to reuse the response only until that time, so the
/// `max-age` shrinks as the day progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyExpiration {
    /// The hour of expiration (0-23).
    pub hour: u8,
    /// The minute of expiration (0-59).
    pub minute: u8,
    /// The second of expiration (0-59).
    pub second: u8,
    /// Whether to require revalidation.
    pub must_revalidate: bool,
}

impl DailyExpiration {
    /// Constructs a new policy expiring at the given UTC time of day.
    pub fn new(hour: u8, minute: u8, second: u8) -> Self {
        Self {
            hour,
            minute,
            second,
            must_revalidate: false,
        }
    }
}

impl CacheTimeQuery for DailyExpiration {
    fn evaluate(&self, now: SystemTime) -> Result<CacheTimeWindow> {
        if self.hour > 23 || self.minute > 59 || self.second > 59 {
            bail!(
                "invalid time of day {hour:02}:{minute:02}:{second:02}",
                hour = self.hour,
                minute = self.minute,
                second = self.second
            );
        }

        let elapsed = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .context("current time is before the unix epoch")?
            .as_secs();
        let offset =
            u64::from(self.hour) * 3600 + u64::from(self.minute) * 60 + u64::from(self.second);

        let mut expiration =
            SystemTime::UNIX_EPOCH + Duration::from_secs(elapsed - elapsed % SECONDS_PER_DAY + offset);
        if expiration <= now {
            expiration += Duration::from_secs(SECONDS_PER_DAY);
        }

        let remaining = expiration.duration_since(now).unwrap_or_default();
        Ok(CacheTimeWindow {
            server_duration: remaining,
            client_duration: remaining,
            shared_duration: None,
            must_revalidate: self.must_revalidate,
            absolute_expiration: expiration,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn short_time_expires_after_server_duration() {
        let policy = ShortTime::new(Duration::from_secs(60), Duration::from_secs(30))
            .with_shared(Duration::from_secs(10))
            .with_must_revalidate(true);
        let window = policy.evaluate(at(1_000)).unwrap();

        assert_eq!(window.absolute_expiration, at(1_060));
        assert_eq!(window.client_duration, Duration::from_secs(30));
        assert_eq!(window.shared_duration, Some(Duration::from_secs(10)));
        assert!(window.must_revalidate);
    }

    #[test]
    fn short_time_from_options() {
        let options = CacheOutputOptions {
            server_time_span: 120,
            client_time_span: 0,
            ..Default::default()
        };
        let policy = ShortTime::from(&options);
        assert_eq!(policy.server, Duration::from_secs(120));
        assert!(policy.client.is_zero());
        assert!(!policy.must_revalidate);
    }

    #[test]
    fn daily_expiration_later_today() {
        // 1970-01-02 06:00:00 UTC
        let now = at(SECONDS_PER_DAY + 6 * 3600);
        let window = DailyExpiration::new(12, 30, 0).evaluate(now).unwrap();

        assert_eq!(
            window.absolute_expiration,
            at(SECONDS_PER_DAY + 12 * 3600 + 30 * 60)
        );
        assert_eq!(window.client_duration, Duration::from_secs(6 * 3600 + 30 * 60));
        assert_eq!(window.server_duration, window.client_duration);
    }

    #[test]
    fn daily_expiration_rolls_over_to_tomorrow() {
        let now = at(SECONDS_PER_DAY + 12 * 3600);
        let window = DailyExpiration::new(12, 0, 0).evaluate(now).unwrap();
        assert_eq!(
            window.absolute_expiration,
            at(2 * SECONDS_PER_DAY + 12 * 3600)
        );
    }

    #[test]
    fn daily_expiration_shrinks_max_age() {
        let policy = DailyExpiration::new(23, 0, 0);
        let first = policy.evaluate(at(3600)).unwrap();
        let second = policy.evaluate(at(7200)).unwrap();
        assert_eq!(first.absolute_expiration, second.absolute_expiration);
        assert_eq!(
            first.client_duration - second.client_duration,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn daily_expiration_rejects_invalid_time() {
        assert!(DailyExpiration::new(24, 0, 0).evaluate(at(0)).is_err());
        assert!(DailyExpiration::new(0, 60, 0).evaluate(at(0)).is_err());
    }
}
