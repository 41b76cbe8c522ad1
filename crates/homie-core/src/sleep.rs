//! Sleep-mode windows: "the bot is asleep between these local times".

use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::config::SleepConfig;
use crate::error::{HomieError, Result};

/// A daily local-time window. Supports wrap-around ranges (23:00–07:00).
#[derive(Debug, Clone)]
pub struct SleepWindow {
    tz: Tz,
    start_minutes: u32,
    end_minutes: u32,
}

impl SleepWindow {
    /// Build from config. Returns `None` when sleep mode is disabled.
    pub fn from_config(cfg: &SleepConfig) -> Result<Option<Self>> {
        if !cfg.enabled {
            return Ok(None);
        }
        let tz: Tz = cfg
            .timezone
            .parse()
            .map_err(|_| HomieError::Config(format!("unknown timezone: {}", cfg.timezone)))?;
        Ok(Some(Self {
            tz,
            start_minutes: parse_hhmm(&cfg.start_local)?,
            end_minutes: parse_hhmm(&cfg.end_local)?,
        }))
    }

    /// Whether `now` falls inside the window in the configured timezone.
    pub fn is_in_window(&self, now: DateTime<Utc>) -> bool {
        let local = self.tz.from_utc_datetime(&now.naive_utc());
        let t = local.hour() * 60 + local.minute();
        if self.start_minutes <= self.end_minutes {
            t >= self.start_minutes && t < self.end_minutes
        } else {
            // Wrap-around: the window crosses midnight.
            t >= self.start_minutes || t < self.end_minutes
        }
    }
}

fn parse_hhmm(s: &str) -> Result<u32> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| HomieError::Config(format!("bad HH:MM time: {s}")))?;
    let h: u32 = h
        .parse()
        .map_err(|_| HomieError::Config(format!("bad hour in: {s}")))?;
    let m: u32 = m
        .parse()
        .map_err(|_| HomieError::Config(format!("bad minute in: {s}")))?;
    if h > 23 || m > 59 {
        return Err(HomieError::Config(format!("time out of range: {s}")));
    }
    Ok(h * 60 + m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: &str, end: &str, tz: &str) -> SleepWindow {
        SleepWindow::from_config(&SleepConfig {
            enabled: true,
            timezone: tz.to_string(),
            start_local: start.to_string(),
            end_local: end.to_string(),
        })
        .unwrap()
        .unwrap()
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn wraparound_window_utc() {
        let w = window("23:00", "07:00", "UTC");
        assert!(w.is_in_window(utc(23, 30)));
        assert!(w.is_in_window(utc(0, 30)));
        assert!(!w.is_in_window(utc(8, 0)));
    }

    #[test]
    fn plain_window_utc() {
        let w = window("00:00", "23:59", "UTC");
        assert!(w.is_in_window(utc(12, 0)));
        assert!(!w.is_in_window(utc(23, 59)));
    }

    #[test]
    fn non_utc_timezone_shifts_window() {
        // 23:00–07:00 in New York (UTC-5 in March before DST, UTC-4 after).
        // 05:00Z on 2026-03-10 is 01:00 EST / 00:00 EDT: inside either way.
        let w = window("23:00", "07:00", "America/New_York");
        assert!(w.is_in_window(utc(5, 0)));
        // 18:00Z is early afternoon local: outside.
        assert!(!w.is_in_window(utc(18, 0)));
    }

    #[test]
    fn disabled_config_yields_none() {
        let none = SleepWindow::from_config(&SleepConfig::default()).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn bad_timezone_is_config_error() {
        let result = SleepWindow::from_config(&SleepConfig {
            enabled: true,
            timezone: "Mars/Olympus".into(),
            start_local: "23:00".into(),
            end_local: "07:00".into(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn bad_time_is_config_error() {
        assert!(parse_hhmm("25:00").is_err());
        assert!(parse_hhmm("7").is_err());
        assert!(parse_hhmm("07:60").is_err());
    }
}
