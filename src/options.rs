//! Options for listing containers, over the API or with `docker ps`.

use url::form_urlencoded;

/// Field separator used in `docker ps --format` output.
pub const LISTING_SEPARATOR: &str = "<|>";

const RUNNING_STATES: &[&str] = &["running"];
const OTHER_STATES: &[&str] = &[
    "created",
    "restarting",
    "removing",
    "paused",
    "exited",
    "dead",
];

/// Options for `Docker::list_containers`.  This uses a "builder" pattern, so
/// most methods will consume the object and return a new one.
#[derive(Debug, Clone, Default)]
pub struct ContainerListOptions {
    all: bool,
}

impl ContainerListOptions {
    /// Return all containers, including stopped ones.
    pub fn all(mut self) -> Self {
        self.all = true;
        self
    }

    pub fn include_all(include: bool) -> Self {
        let opts = Self::default();
        if include {
            opts.all()
        } else {
            opts
        }
    }

    /// Convert to URL parameters.
    pub fn to_url_params(&self) -> String {
        let mut params = form_urlencoded::Serializer::new(String::new());
        params.append_pair("all", if self.all { "true" } else { "false" });
        params.finish()
    }

    /// Equivalent `docker ps` invocation, one container per line.
    ///
    /// Without `all` only running containers are listed; with it every other
    /// state is listed too.
    pub fn to_ps_command(&self) -> String {
        let mut cmd = format!(
            "docker ps --no-trunc --format \"{{{{.Names}}}}{sep}{{{{.Ports}}}}{sep}{{{{.Status}}}}{sep}{{{{.Image}}}}\"",
            sep = LISTING_SEPARATOR
        );
        let others: &[&str] = if self.all { OTHER_STATES } else { &[] };
        for state in RUNNING_STATES.iter().chain(others) {
            cmd.push_str(&format!(" -f \"status={state}\""));
        }
        cmd
    }
}
