//! Admission control over concurrent login attempts.
//!
//! The same three-parameter scheme sshd uses for unauthenticated
//! connections: below `begin` everything is admitted, above `max`
//! everything is dropped, and in between the drop probability climbs
//! linearly from `rate` percent.

use rand::Rng;
use tracing::{debug, warn};

const DEFAULT_MAX_STARTUPS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStartups {
    pub begin: u32,
    pub rate: u32,
    pub max: u32,
}

impl Default for MaxStartups {
    fn default() -> Self {
        Self {
            begin: DEFAULT_MAX_STARTUPS,
            rate: 100,
            max: DEFAULT_MAX_STARTUPS,
        }
    }
}

impl MaxStartups {
    /// Parse a `begin:rate:max` spec.
    ///
    /// One value sets a plain hard limit (`begin = max = V`, `rate = 100`);
    /// two values set `max` from `begin`. Anything unparseable, `begin >
    /// max`, or a rate outside `[1, 100]` reverts all three to defaults
    /// with a warning.
    pub fn parse(spec: &str) -> Self {
        let mut values = [0u32; 3];
        let mut count = 0;
        for part in spec.split(':').take(3) {
            match part.trim().parse::<u32>() {
                Ok(value) => {
                    values[count] = value;
                    count += 1;
                }
                Err(_) => break,
            }
        }

        let parsed = match count {
            1 => Self {
                begin: values[0],
                rate: 100,
                max: values[0],
            },
            2 => Self {
                begin: values[0],
                rate: values[1],
                max: values[0],
            },
            3 => Self {
                begin: values[0],
                rate: values[1],
                max: values[2],
            },
            _ => {
                warn!("Illegal MaxStartups spec: {spec}. Reverting to defaults");
                return Self::default();
            }
        };

        if parsed.begin > parsed.max || parsed.rate > 100 || parsed.rate < 1 {
            warn!("Illegal MaxStartups spec: {spec}. Reverting to defaults");
            return Self::default();
        }

        parsed
    }

    /// Decide whether a new attempt may proceed.
    ///
    /// `in_flight` counts login attempts including the one being decided.
    /// Dropping starts once the count of other in-flight attempts reaches
    /// `begin`, with probability `rate`/100, rising linearly until
    /// everything past `max` is dropped.
    pub fn can_start(&self, in_flight: u32) -> bool {
        // 0 means unlimited
        if self.max == 0 {
            return true;
        }

        // Under soft limit
        if in_flight <= self.begin {
            return true;
        }

        // Over hard limit
        if in_flight > self.max {
            return false;
        }

        // If rate is 100, soft limit is hard limit
        if self.rate == 100 {
            return false;
        }

        let mut p = 100 - self.rate;
        p *= in_flight - 1 - self.begin;
        p /= self.max - self.begin;
        p += self.rate;
        let r = rand::thread_rng().gen_range(0..100);

        debug!(
            "calculating if auth can start: ({}:{}:{}): p {p}, r {r}",
            self.begin, self.rate, self.max
        );
        r >= p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_value_is_hard_limit() {
        assert_eq!(
            MaxStartups::parse("5"),
            MaxStartups {
                begin: 5,
                rate: 100,
                max: 5
            }
        );
    }

    #[test]
    fn parse_two_values_sets_max_from_begin() {
        assert_eq!(
            MaxStartups::parse("4:30"),
            MaxStartups {
                begin: 4,
                rate: 30,
                max: 4
            }
        );
    }

    #[test]
    fn parse_three_values() {
        assert_eq!(
            MaxStartups::parse("10:50:20"),
            MaxStartups {
                begin: 10,
                rate: 50,
                max: 20
            }
        );
    }

    #[test]
    fn parse_rejects_begin_over_max() {
        assert_eq!(MaxStartups::parse("20:50:10"), MaxStartups::default());
    }

    #[test]
    fn parse_rejects_bad_rate() {
        assert_eq!(MaxStartups::parse("1:0:5"), MaxStartups::default());
        assert_eq!(MaxStartups::parse("1:101:5"), MaxStartups::default());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(MaxStartups::parse("banana"), MaxStartups::default());
        assert_eq!(MaxStartups::parse(""), MaxStartups::default());
        assert_eq!(MaxStartups::parse("-1"), MaxStartups::default());
    }

    #[test]
    fn zero_max_admits_everything() {
        let throttle = MaxStartups {
            begin: 0,
            rate: 100,
            max: 0,
        };
        for in_flight in 1..1000 {
            assert!(throttle.can_start(in_flight));
        }
    }

    #[test]
    fn soft_and_hard_limits() {
        let throttle = MaxStartups {
            begin: 2,
            rate: 50,
            max: 4,
        };
        assert!(throttle.can_start(1));
        assert!(throttle.can_start(2));
        assert!(!throttle.can_start(5));
    }

    #[test]
    fn drop_probability_rises_linearly() {
        let throttle = MaxStartups {
            begin: 2,
            rate: 50,
            max: 4,
        };
        let trials = 4000;
        let rejected_3rd = (0..trials).filter(|_| !throttle.can_start(3)).count();
        let rejected_4th = (0..trials).filter(|_| !throttle.can_start(4)).count();

        // Expected rates 50% and 75%; allow a generous statistical margin.
        let rate_3rd = rejected_3rd as f64 / trials as f64;
        let rate_4th = rejected_4th as f64 / trials as f64;
        assert!((rate_3rd - 0.50).abs() < 0.05, "3rd attempt: {rate_3rd}");
        assert!((rate_4th - 0.75).abs() < 0.05, "4th attempt: {rate_4th}");
    }

    #[test]
    fn full_rate_makes_soft_limit_hard() {
        let throttle = MaxStartups {
            begin: 1,
            rate: 100,
            max: 1,
        };
        assert!(throttle.can_start(1));
        assert!(!throttle.can_start(2));
    }
}
