//! Static, time-indexed RWND schedule used instead of the classifier.
//!
//! File format, one entry per line:
//! ```text
//! # <start time (seconds, relative to load)>,<rwnd (bytes)>
//! 0,1000
//! 5,2000
//! ```

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("failed to read schedule file: {0}")]
    Io(#[from] std::io::Error),
    #[error("improperly formed schedule line {line_no}: {line:?} ({reason})")]
    Format {
        line_no: usize,
        line: String,
        reason: &'static str,
    },
    #[error("schedule contains no entries")]
    Empty,
}

/// Entries sorted by absolute start time. Never empty.
#[derive(Debug, Clone)]
pub struct Schedule {
    entries: VecDeque<(Instant, u32)>,
}

impl Schedule {
    /// Parse a schedule file, anchoring relative start times at the current instant.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self, ScheduleError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let schedule = Self::parse_str(&text, Instant::now())?;
        info!(
            "Loaded RWND schedule {:?} with {} entries",
            path,
            schedule.len()
        );
        Ok(schedule)
    }

    /// Parse schedule text, anchoring relative start times at `anchor`.
    pub fn parse_str(text: &str, anchor: Instant) -> Result<Self, ScheduleError> {
        let mut entries = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let format_err = |reason: &'static str| ScheduleError::Format {
                line_no: idx + 1,
                line: line.to_string(),
                reason,
            };

            let toks: Vec<&str> = line.split(',').map(str::trim).collect();
            let [start_s, rwnd] = toks.as_slice() else {
                return Err(format_err("expected exactly two comma-separated fields"));
            };
            let start_s: f64 = start_s
                .parse()
                .map_err(|_| format_err("start time is not a number"))?;
            if !start_s.is_finite() || start_s < 0.0 {
                return Err(format_err("start time must be a non-negative number"));
            }
            let rwnd: u32 = rwnd
                .parse()
                .map_err(|_| format_err("rwnd is not an unsigned 32-bit integer"))?;
            if rwnd == 0 {
                return Err(format_err("rwnd must be greater than 0"));
            }
            let start = Duration::try_from_secs_f64(start_s)
                .ok()
                .and_then(|offset| anchor.checked_add(offset))
                .ok_or_else(|| format_err("start time is out of range"))?;
            entries.push((start, rwnd));
        }

        if entries.is_empty() {
            return Err(ScheduleError::Empty);
        }
        entries.sort_by_key(|&(start, _)| start);
        Ok(Self {
            entries: entries.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &(Instant, u32)> {
        self.entries.iter()
    }

    /// RWND in effect at `now`, or `None` if the first entry has not started.
    ///
    /// Entries that have been superseded are dropped, so calls with a
    /// monotonically advancing `now` are amortized O(1). The last entry is
    /// never dropped.
    pub fn lookup(&mut self, now: Instant) -> Option<u32> {
        while self.entries.len() > 1 && self.entries[1].0 <= now {
            self.entries.pop_front();
        }
        let &(start, rwnd) = self.entries.front()?;
        (start <= now).then_some(rwnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sorts_and_skips_comments() {
        let anchor = Instant::now();
        let text = "# start,rwnd\n10,300\n\n0,100\n  # indented comment\n5.5,200\n";
        let schedule = Schedule::parse_str(text, anchor).unwrap();
        let got: Vec<_> = schedule.entries().copied().collect();
        assert_eq!(
            got,
            vec![
                (anchor, 100),
                (anchor + Duration::from_millis(5500), 200),
                (anchor + Duration::from_secs(10), 300),
            ]
        );
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        let anchor = Instant::now();
        let malformed = [
            "1,2,3", "7", "x,100", "1,-5", "1,0", "-1,100", "inf,100", "1,abc", "1e20,100",
        ];
        for text in malformed {
            let err = Schedule::parse_str(text, anchor).unwrap_err();
            assert!(
                matches!(err, ScheduleError::Format { line_no: 1, .. }),
                "{text}: {err}"
            );
        }
    }

    #[test]
    fn parse_requires_an_entry() {
        let err = Schedule::parse_str("# nothing here\n", Instant::now()).unwrap_err();
        assert!(matches!(err, ScheduleError::Empty));
    }

    #[test]
    fn lookup_follows_the_clock() {
        let anchor = Instant::now();
        let mut schedule = Schedule::parse_str("0,1000\n5,2000\n", anchor).unwrap();
        assert_eq!(schedule.lookup(anchor + Duration::from_secs(2)), Some(1000));
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule.lookup(anchor + Duration::from_secs(6)), Some(2000));
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule.lookup(anchor + Duration::from_secs(600)), Some(2000));
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn lookup_before_first_entry_yields_nothing() {
        let anchor = Instant::now();
        let mut schedule = Schedule::parse_str("3,1000\n5,2000\n", anchor).unwrap();
        assert_eq!(schedule.lookup(anchor + Duration::from_secs(1)), None);
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule.lookup(anchor + Duration::from_secs(3)), Some(1000));
    }

    #[test]
    fn lookup_never_returns_a_future_entry() {
        let anchor = Instant::now();
        let mut schedule = Schedule::parse_str("1,10\n2,20\n4,40\n8,80\n", anchor).unwrap();
        let starts: Vec<_> = schedule.entries().copied().collect();
        for ms in (0..10_000).step_by(250) {
            let now = anchor + Duration::from_millis(ms);
            if let Some(rwnd) = schedule.lookup(now) {
                let (start, _) = starts.iter().find(|(_, r)| *r == rwnd).unwrap();
                assert!(*start <= now);
            }
            assert!(!schedule.is_empty());
        }
    }
}
