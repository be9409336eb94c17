//! Cycle scheduling: fixed interval with a quiet-hours window.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::config::ScheduleConfig;
use crate::error::StewardError;
use crate::pipeline::Pipeline;

/// Default cadence for the watch loop.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

/// Parse `30s` / `15m` / `2h` / plain seconds.
pub fn parse_interval(text: &str) -> Result<Duration, StewardError> {
    let trimmed = text.trim();
    let (digits, unit) = match trimmed.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((split, _)) => trimmed.split_at(split),
        None => (trimmed, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| StewardError::Config(format!("invalid interval: {text}")))?;
    let seconds = match unit.trim() {
        "" | "s" | "sec" | "secs" => value,
        "m" | "min" | "mins" => value * 60,
        "h" | "hr" | "hrs" => value * 3600,
        other => {
            return Err(StewardError::Config(format!(
                "invalid interval unit: {other}"
            )))
        }
    };
    if seconds == 0 {
        return Err(StewardError::Config("interval must be positive".to_string()));
    }
    Ok(Duration::from_secs(seconds))
}

/// A local-time window, possibly wrapping midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            // Wraps midnight, e.g. 22:00-06:00.
            time >= self.start || time < self.end
        }
    }
}

/// Parse `HH:MM-HH:MM`.
pub fn parse_quiet_hours(text: &str) -> Result<QuietHours, StewardError> {
    let (start, end) = text
        .split_once('-')
        .ok_or_else(|| StewardError::Config(format!("invalid quiet hours: {text}")))?;
    let parse = |s: &str| {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map_err(|_| StewardError::Config(format!("invalid quiet hours time: {s}")))
    };
    Ok(QuietHours {
        start: parse(start)?,
        end: parse(end)?,
    })
}

/// Whether `now` falls inside the configured quiet window, evaluated in
/// the configured timezone (UTC when unset or unknown).
#[must_use]
pub fn in_quiet_hours(schedule: &ScheduleConfig, now: DateTime<Utc>) -> bool {
    let Some(window_text) = &schedule.quiet_hours else {
        return false;
    };
    let window = match parse_quiet_hours(window_text) {
        Ok(window) => window,
        Err(e) => {
            warn!(error = %e, "ignoring invalid quiet_hours");
            return false;
        }
    };

    let local_time = match schedule.timezone.as_deref() {
        Some(name) => match Tz::from_str(name) {
            Ok(tz) => now.with_timezone(&tz).time(),
            Err(_) => {
                warn!(timezone = name, "unknown timezone, using UTC");
                now.time()
            }
        },
        None => now.time(),
    };
    window.contains(local_time)
}

/// The watch loop: run cycles on the configured interval, skipping quiet
/// hours, until the process is stopped.
pub async fn run_watch(pipeline: &Pipeline, schedule: &ScheduleConfig, dry_run: bool) {
    let interval = schedule
        .interval
        .as_deref()
        .map(parse_interval)
        .transpose()
        .unwrap_or_else(|e| {
            warn!(error = %e, "invalid interval, using default");
            None
        })
        .unwrap_or(DEFAULT_INTERVAL);

    info!(interval_secs = interval.as_secs(), "entering watch loop");
    loop {
        if in_quiet_hours(schedule, Utc::now()) {
            info!("inside quiet hours, skipping cycle");
        } else if let Err(e) = pipeline.run_cycle(dry_run).await {
            warn!(error = %e, "cycle failed");
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn intervals_parse_with_units() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_interval("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_interval("90").unwrap(), Duration::from_secs(90));
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("soon").is_err());
        assert!(parse_interval("5d").is_err());
    }

    #[test]
    fn quiet_hours_handle_midnight_wrap() {
        let window = parse_quiet_hours("22:00-06:00").unwrap();
        assert!(window.contains(NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(2, 30, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(6, 0, 0).unwrap()));

        let day = parse_quiet_hours("09:00-17:00").unwrap();
        assert!(day.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert!(!day.contains(NaiveTime::from_hms_opt(8, 59, 0).unwrap()));
    }

    #[test]
    fn quiet_hours_respect_the_timezone() {
        let schedule = ScheduleConfig {
            interval: None,
            quiet_hours: Some("22:00-06:00".to_string()),
            timezone: Some("America/New_York".to_string()),
        };
        // 03:00 UTC in winter is 22:00 in New York: quiet.
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 3, 0, 0).unwrap();
        assert!(in_quiet_hours(&schedule, now));

        // 15:00 UTC is 10:00 in New York: not quiet.
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 15, 0, 0).unwrap();
        assert!(!in_quiet_hours(&schedule, now));
    }

    #[test]
    fn no_window_means_never_quiet() {
        let schedule = ScheduleConfig::default();
        assert!(!in_quiet_hours(&schedule, Utc::now()));
    }
}
