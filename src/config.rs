//! Process-level configuration.
//!
//! The binary takes one argument: a `key = value` file. `#` starts a
//! comment, values may be quoted, and `$NAME` is replaced with the process
//! environment variable `NAME`. Every pair is seeded into the node's
//! environment (first write wins, so file values beat defaults).

use std::path::Path;

use crate::env::Env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Worker thread count.
    pub threads: usize,
    /// Local node id, 1..=255 (0 is reserved).
    pub harbor: u32,
    /// First service to launch after the log service, `"module args"`.
    pub bootstrap: String,
    /// Log output path for the log service; `None` means stdout.
    pub logger: Option<String>,
    /// Module providing the log service.
    pub logservice: String,
    /// Raw pairs from the file, seeded into the env verbatim.
    pairs: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 8,
            harbor: 1,
            bootstrap: String::new(),
            logger: None,
            logservice: "logger".to_owned(),
            pairs: Vec::new(),
        }
    }
}

fn substitute_env(value: &str) -> crate::Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&(_, n)) = chars.peek() {
            if n.is_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            out.push('$');
            continue;
        }
        match std::env::var(&name) {
            Ok(v) => out.push_str(&v),
            Err(_) => {
                return Err(crate::Error::Config(format!(
                    "environment variable `{name}` is not set"
                )))
            }
        }
    }
    Ok(out)
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

impl Config {
    /// Parse a config file and resolve the well-known keys.
    pub fn load(path: &Path) -> crate::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> crate::Result<Config> {
        let mut pairs = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = match line.find('#') {
                Some(at) => &line[..at],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(crate::Error::Config(format!(
                    "line {}: expected `key = value`",
                    lineno + 1
                )));
            };
            let key = key.trim().to_owned();
            let value = substitute_env(unquote(value))?;
            pairs.push((key, value));
        }

        let mut config = Config {
            pairs,
            ..Config::default()
        };
        for (key, value) in &config.pairs {
            match key.as_str() {
                "thread" => {
                    config.threads = value.parse().map_err(|_| {
                        crate::Error::Config(format!("thread = {value} is not a number"))
                    })?
                }
                "harbor" => {
                    let harbor: u32 = value.parse().map_err(|_| {
                        crate::Error::Config(format!("harbor = {value} is not a number"))
                    })?;
                    if harbor == 0 || harbor > 255 {
                        return Err(crate::Error::Config(format!(
                            "harbor = {harbor} out of range (1..=255)"
                        )));
                    }
                    config.harbor = harbor;
                }
                "bootstrap" => config.bootstrap = value.clone(),
                "logger" => config.logger = Some(value.clone()),
                "logservice" => config.logservice = value.clone(),
                // daemonization and dynamic module paths are handled by
                // outer tooling; keep the values visible in the env only
                "daemon" | "cpath" => {}
                _ => {}
            }
        }
        Ok(config)
    }

    /// Push every configured pair plus the resolved defaults into `env`.
    pub fn seed(&self, env: &Env) {
        for (key, value) in &self.pairs {
            env.set(key, value);
        }
        env.set("thread", &self.threads.to_string());
        env.set("harbor", &self.harbor.to_string());
        env.set("logservice", &self.logservice);
        if let Some(logger) = &self.logger {
            env.set("logger", logger);
        }
        if !self.bootstrap.is_empty() {
            env.set("bootstrap", &self.bootstrap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_pairs_comments_and_quotes() {
        let config = Config::parse(
            "# a node\n\
             thread = 4\n\
             harbor = 2\n\
             bootstrap = \"echo hello\"  # launch this first\n\
             logservice = logger\n",
        )
        .unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.harbor, 2);
        assert_eq!(config.bootstrap, "echo hello");
        assert_eq!(config.logger, None);
    }

    #[test]
    fn defaults_apply() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.threads, 8);
        assert_eq!(config.harbor, 1);
        assert_eq!(config.logservice, "logger");
    }

    #[test]
    fn env_substitution() {
        std::env::set_var("WARREN_TEST_ROOT", "/tmp/warren");
        let config = Config::parse("logger = $WARREN_TEST_ROOT/node.log\n").unwrap();
        assert_eq!(config.logger.as_deref(), Some("/tmp/warren/node.log"));

        assert!(Config::parse("logger = $WARREN_TEST_UNSET_VAR/x\n").is_err());
    }

    #[test]
    fn harbor_range_checked() {
        assert!(Config::parse("harbor = 0\n").is_err());
        assert!(Config::parse("harbor = 256\n").is_err());
        assert!(Config::parse("harbor = 255\n").is_ok());
    }

    #[test]
    fn seeding_respects_file_values() {
        let env = Env::new();
        let config = Config::parse("thread = 2\nanswer = 42\n").unwrap();
        config.seed(&env);
        assert_eq!(env.get("thread").as_deref(), Some("2"));
        assert_eq!(env.get("answer").as_deref(), Some("42"));
        assert_eq!(env.get("harbor").as_deref(), Some("1"));
    }
}
