//! Process-wide key/value configuration store.
//!
//! Every subsystem reads its tunables from here; values are plain strings
//! and callers parse. Writes are first-write-wins so defaults filled in at
//! startup never clobber values seeded from the config file.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct Env {
    values: Mutex<HashMap<String, String>>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    /// Set `key` unless it already has a value.
    pub fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .entry(key.to_owned())
            .or_insert_with(|| value.to_owned());
    }

    /// Integer tunable with a default that is recorded on first read.
    pub fn opt_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(v) => v.trim().parse().unwrap_or(default),
            None => {
                self.set(key, &default.to_string());
                default
            }
        }
    }

    /// String tunable with an optional default recorded on first read.
    pub fn opt_str(&self, key: &str, default: Option<&str>) -> Option<String> {
        match self.get(key) {
            Some(v) => Some(v),
            None => {
                if let Some(d) = default {
                    self.set(key, d);
                }
                default.map(str::to_owned)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_wins() {
        let env = Env::new();
        env.set("thread", "4");
        env.set("thread", "16");
        assert_eq!(env.get("thread").as_deref(), Some("4"));
    }

    #[test]
    fn defaults_recorded_on_read() {
        let env = Env::new();
        assert_eq!(env.opt_int("harbor", 1), 1);
        assert_eq!(env.get("harbor").as_deref(), Some("1"));

        env.set("thread", "12");
        assert_eq!(env.opt_int("thread", 8), 12);

        assert_eq!(env.opt_str("logger", None), None);
        assert_eq!(
            env.opt_str("logservice", Some("logger")).as_deref(),
            Some("logger")
        );
    }
}
