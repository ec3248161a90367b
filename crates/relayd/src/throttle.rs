//! Exponential backoff for failed logins, keyed by peer IP and by username.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const RESET_AFTER: Duration = Duration::from_secs(10 * 60);
const MAX_TRACKED_IPS: usize = 2048;
const MAX_TRACKED_NAMES: usize = 2048;

fn backoff_delay(failures: u32) -> Duration {
    // 1s, 2s, 4s, ... capped.
    let pow = failures.saturating_sub(1).min(16);
    let mult: u32 = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
    BACKOFF_BASE
        .checked_mul(mult)
        .unwrap_or(BACKOFF_MAX)
        .min(BACKOFF_MAX)
}

/// Round up to whole seconds so the user doesn't retry too early.
pub fn wait_seconds(d: Duration) -> u64 {
    let ms = d.as_millis();
    if ms == 0 {
        0
    } else {
        u64::try_from((ms + 999) / 1000).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    failures: u32,
    last_failure: Instant,
    next_allowed: Instant,
}

fn bump(e: &mut Entry, now: Instant) {
    e.failures = e.failures.saturating_add(1);
    e.last_failure = now;
    e.next_allowed = now + backoff_delay(e.failures);
}

#[derive(Debug, Default)]
pub struct LoginThrottle {
    by_ip: HashMap<IpAddr, Entry>,
    by_name: HashMap<String, Entry>,
}

impl LoginThrottle {
    fn prune(&mut self, now: Instant) {
        self.by_ip
            .retain(|_, e| now.duration_since(e.last_failure) <= RESET_AFTER);
        self.by_name
            .retain(|_, e| now.duration_since(e.last_failure) <= RESET_AFTER);

        // Size caps keep the maps bounded under a flood.
        if self.by_ip.len() > MAX_TRACKED_IPS {
            self.by_ip.clear();
        }
        if self.by_name.len() > MAX_TRACKED_NAMES {
            self.by_name.clear();
        }
    }

    /// Remaining backoff for this (ip, name) pair; zero when clear to try.
    pub fn wait(&mut self, ip: IpAddr, name: &str, now: Instant) -> Duration {
        self.prune(now);

        let mut wait = Duration::ZERO;
        if let Some(e) = self.by_ip.get(&ip) {
            if now < e.next_allowed {
                wait = wait.max(e.next_allowed.saturating_duration_since(now));
            }
        }
        if !name.is_empty() {
            if let Some(e) = self.by_name.get(name) {
                if now < e.next_allowed {
                    wait = wait.max(e.next_allowed.saturating_duration_since(now));
                }
            }
        }
        wait
    }

    pub fn note_failure(&mut self, ip: IpAddr, name: &str, now: Instant) {
        self.prune(now);

        bump(
            self.by_ip.entry(ip).or_insert(Entry {
                failures: 0,
                last_failure: now,
                next_allowed: now,
            }),
            now,
        );
        if !name.is_empty() {
            bump(
                self.by_name.entry(name.to_string()).or_insert(Entry {
                    failures: 0,
                    last_failure: now,
                    next_allowed: now,
                }),
                now,
            );
        }
    }

    pub fn note_success(&mut self, ip: IpAddr, name: &str) {
        self.by_ip.remove(&ip);
        if !name.is_empty() {
            self.by_name.remove(name);
        }
    }
}
