//! Host registry read from an OpenSSH client configuration file.
//!
//! Only `Host`, `HostName`, `User` and `Port` are interpreted; every other
//! directive is ignored. A block is eligible when its alias does not end with
//! the exclusion marker and its user is in the allowed set.

use crate::errors::{Error, Result};
use log::{debug, warn};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// One SSH destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl HostTarget {
    pub fn new(host: &str, user: &str) -> Self {
        Self {
            host: host.to_owned(),
            user: user.to_owned(),
            port: 22,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.port == 22 {
            write!(f, "{}@{}", self.user, self.host)
        } else {
            write!(f, "{}@{}:{}", self.user, self.host, self.port)
        }
    }
}

/// Source of the hosts to inventory.
pub trait HostRegistry {
    fn targets(&self) -> Result<Vec<HostTarget>>;
}

impl HostRegistry for Vec<HostTarget> {
    fn targets(&self) -> Result<Vec<HostTarget>> {
        if self.is_empty() {
            return Err(Error::EmptyRegistry);
        }
        Ok(self.clone())
    }
}

/// Eligibility rules applied to each `Host` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    pub allowed_users: HashSet<String>,
    pub exclusion_marker: String,
    pub default_port: u16,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            allowed_users: ["root".to_owned()].into_iter().collect(),
            exclusion_marker: "_".to_owned(),
            default_port: 22,
        }
    }
}

/// Result of parsing a config file: eligible targets and the problems that
/// caused blocks to be skipped.
#[derive(Debug, Default)]
pub struct ParsedConfig {
    pub targets: Vec<HostTarget>,
    pub skipped: Vec<Error>,
}

/// Accumulates the directives of a single `Host` block.
#[derive(Debug, Default)]
struct Block {
    alias: String,
    start_line: usize,
    hostname: Option<String>,
    user: Option<String>,
    port: Option<u16>,
    broken: Option<Error>,
}

impl Block {
    fn open(alias: &str, line: usize) -> Self {
        Self {
            alias: alias.to_owned(),
            start_line: line,
            ..Default::default()
        }
    }

    fn poison(&mut self, err: Error) {
        if self.broken.is_none() {
            self.broken = Some(err);
        }
    }

    /// Close the block; `Ok(None)` means the block is well formed but not eligible.
    fn finish(self, opts: &RegistryOptions) -> Result<Option<HostTarget>> {
        if let Some(err) = self.broken {
            return Err(err);
        }
        if self.alias.contains(['*', '?', '!']) {
            debug!("skipping pattern block {}", self.alias);
            return Ok(None);
        }
        if !opts.exclusion_marker.is_empty() && self.alias.ends_with(&opts.exclusion_marker) {
            debug!("skipping excluded block {}", self.alias);
            return Ok(None);
        }
        let (host, user) = match (self.hostname, self.user) {
            (Some(host), Some(user)) => (host, user),
            (None, _) => {
                return Err(Error::ConfigParse {
                    line: self.start_line,
                    message: format!("host {} has no HostName", self.alias),
                })
            }
            (_, None) => {
                return Err(Error::ConfigParse {
                    line: self.start_line,
                    message: format!("host {} has no User", self.alias),
                })
            }
        };
        if !opts.allowed_users.contains(&user) {
            debug!("skipping {} for user {}", self.alias, user);
            return Ok(None);
        }
        Ok(Some(HostTarget {
            host,
            user,
            port: self.port.unwrap_or(opts.default_port),
        }))
    }
}

/// Split a config line into its keyword and argument.
///
/// Accepts both `Keyword value` and `Keyword=value`.
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (key, rest) = line.split_at(idx);
    let value = rest
        .trim_start_matches(|c: char| c.is_whitespace())
        .trim_start_matches('=')
        .trim();
    if key.is_empty() || value.is_empty() {
        None
    } else {
        Some((key, value.trim_matches('"')))
    }
}

/// Parse the text of an ssh client config.
///
/// A malformed block is skipped and recorded in `skipped`; parsing continues
/// with the next `Host` line.
pub fn parse_ssh_config(text: &str, opts: &RegistryOptions) -> ParsedConfig {
    let mut parsed = ParsedConfig::default();
    let mut current: Option<Block> = None;

    let close = |block: Block, parsed: &mut ParsedConfig| match block.finish(opts) {
        Ok(Some(target)) => {
            if parsed.targets.contains(&target) {
                debug!("duplicate target {target}");
            } else {
                parsed.targets.push(target);
            }
        }
        Ok(None) => {}
        Err(err) => {
            warn!("skipping ssh config block: {err}");
            parsed.skipped.push(err);
        }
    };

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = split_directive(line) else {
            let err = Error::ConfigParse {
                line: lineno,
                message: format!("directive without value: {line}"),
            };
            match current.as_mut() {
                Some(block) => block.poison(err),
                None => {
                    warn!("ignoring line outside of a host block: {err}");
                    parsed.skipped.push(err);
                }
            }
            continue;
        };

        if key.eq_ignore_ascii_case("host") {
            if let Some(block) = current.take() {
                close(block, &mut parsed);
            }
            let alias = value.split_whitespace().next().unwrap_or(value);
            current = Some(Block::open(alias, lineno));
            continue;
        }
        if key.eq_ignore_ascii_case("match") {
            if let Some(block) = current.take() {
                close(block, &mut parsed);
            }
            continue;
        }

        let Some(block) = current.as_mut() else {
            continue;
        };
        if key.eq_ignore_ascii_case("hostname") {
            block.hostname = Some(value.to_owned());
        } else if key.eq_ignore_ascii_case("user") {
            block.user = Some(value.to_owned());
        } else if key.eq_ignore_ascii_case("port") {
            match value.parse::<u16>() {
                Ok(port) => block.port = Some(port),
                Err(_) => block.poison(Error::ConfigParse {
                    line: lineno,
                    message: format!("invalid port {value}"),
                }),
            }
        }
    }
    if let Some(block) = current.take() {
        close(block, &mut parsed);
    }
    parsed
}

/// Registry backed by an ssh config file on disk.
#[derive(Debug, Clone)]
pub struct SshConfigRegistry {
    path: PathBuf,
    options: RegistryOptions,
}

impl SshConfigRegistry {
    pub fn new(path: &Path, options: RegistryOptions) -> Self {
        Self {
            path: path.to_owned(),
            options,
        }
    }
}

impl HostRegistry for SshConfigRegistry {
    fn targets(&self) -> Result<Vec<HostTarget>> {
        let text = std::fs::read_to_string(&self.path)?;
        let parsed = parse_ssh_config(&text, &self.options);
        debug!(
            "{}: {} targets, {} skipped blocks",
            self.path.display(),
            parsed.targets.len(),
            parsed.skipped.len()
        );
        if parsed.targets.is_empty() {
            return Err(Error::EmptyRegistry);
        }
        Ok(parsed.targets)
    }
}
