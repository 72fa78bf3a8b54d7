//! All about `Stats`.

use std::fmt::{Display, Formatter};
use std::ops::Add;

use serde::Serialize;

/// `Stats` tracks activity counters for the connection, the lookup cache and the emitter.
///
/// Each component only updates the fields relevant to it, the CLI adds them together and
/// prints the total on exit.
///
/// # Fields
///
/// - `sent`: coordinates acknowledged by the hub.
/// - `received`: coordinates delivered by the hub.
/// - `reconnect`: successful reconnections.
/// - `hits`: lookups answered from the cache.
/// - `miss`: lookups that had to go to the geocoder.
/// - `coalesced`: lookups that joined one already in flight.
/// - `lookups`: requests actually sent to the geocoder.
/// - `ticks`: emitter cadence ticks.
/// - `err`: errors of any kind.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Stats {
    pub sent: u32,
    pub received: u32,
    pub reconnect: u32,
    pub hits: u32,
    pub miss: u32,
    pub coalesced: u32,
    pub lookups: u32,
    pub ticks: u32,
    pub err: u32,
}

impl Display for Stats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent={} received={} reconnect={} hits={} miss={} coalesced={} lookups={} ticks={} errors={}",
            self.sent,
            self.received,
            self.reconnect,
            self.hits,
            self.miss,
            self.coalesced,
            self.lookups,
            self.ticks,
            self.err
        )
    }
}

impl Add for Stats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Stats {
            sent: self.sent + rhs.sent,
            received: self.received + rhs.received,
            reconnect: self.reconnect + rhs.reconnect,
            hits: self.hits + rhs.hits,
            miss: self.miss + rhs.miss,
            coalesced: self.coalesced + rhs.coalesced,
            lookups: self.lookups + rhs.lookups,
            ticks: self.ticks + rhs.ticks,
            err: self.err + rhs.err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default() {
        let stats = Stats::default();
        assert_eq!(0, stats.sent);
        assert_eq!(0, stats.lookups);
        assert_eq!(0, stats.err);
    }

    #[test]
    fn test_stats_display() {
        let stats = Stats {
            sent: 12,
            received: 3,
            hits: 7,
            err: 1,
            ..Default::default()
        };
        assert_eq!(
            "sent=12 received=3 reconnect=0 hits=7 miss=0 coalesced=0 lookups=0 ticks=0 errors=1",
            stats.to_string()
        );
    }

    #[test]
    fn test_stats_add() {
        let a = Stats {
            sent: 1,
            hits: 2,
            ..Default::default()
        };
        let b = Stats {
            sent: 3,
            miss: 4,
            err: 5,
            ..Default::default()
        };
        let c = a + b;
        assert_eq!(4, c.sent);
        assert_eq!(2, c.hits);
        assert_eq!(4, c.miss);
        assert_eq!(5, c.err);
    }
}
