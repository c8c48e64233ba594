//! Turns raw runtime listings into container objects

use crate::{Container, ContainerIdentity, ContainerState, CoreError, Result, RuntimeContext};

/// One row of `lxc-ls --fancy --fancy-format name,state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub lxc_name: String,
    pub state: ContainerState,
}

/// Map an LXC state word onto a lifecycle state
pub(crate) fn parse_runtime_state(raw: &str) -> Result<ContainerState> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "RUNNING" | "STARTING" | "FROZEN" | "FREEZING" | "THAWED" => Ok(ContainerState::Running),
        "STOPPED" | "STOPPING" | "ABORTING" => Ok(ContainerState::Stopped),
        other => Err(CoreError::Parse(format!("unknown container state '{}'", other))),
    }
}

/// Builds [`Container`]s bound to one runtime context
#[derive(Clone)]
pub struct ContainerFactory {
    ctx: RuntimeContext,
}

impl ContainerFactory {
    pub fn new(ctx: RuntimeContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    /// Parse a listing. The header row and blank lines are skipped; any other
    /// malformed row fails the whole parse.
    pub fn parse_listing(raw: &str) -> Result<Vec<ListingEntry>> {
        let mut entries = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() != 2 {
                return Err(CoreError::Parse(format!(
                    "line {}: expected NAME STATE, got '{}'",
                    lineno + 1,
                    line.trim()
                )));
            }
            if fields[0] == "NAME" && fields[1] == "STATE" {
                continue;
            }
            entries.push(ListingEntry {
                lxc_name: fields[0].to_string(),
                state: parse_runtime_state(fields[1])
                    .map_err(|e| CoreError::Parse(format!("line {}: {}", lineno + 1, e)))?,
            });
        }
        Ok(entries)
    }

    /// Wrap an existing runtime container
    pub fn wrap(&self, identity: ContainerIdentity, state: ContainerState) -> Container {
        Container::new(identity, state, self.ctx.clone())
    }

    /// Wrap a container found in the runtime listing. Its creation time is
    /// taken from the container directory when that can be read.
    pub fn adopt(&self, identity: ContainerIdentity, state: ContainerState) -> Container {
        let container = self.wrap(identity, state);
        match std::fs::metadata(container.container_dir()).and_then(|m| m.modified()) {
            Ok(modified) => container.with_created_at(modified.into()),
            Err(_) => container,
        }
    }

    /// One container per listed row
    pub fn containers_from_listing(&self, raw: &str) -> Result<Vec<Container>> {
        self.containers_from_entries(Self::parse_listing(raw)?)
    }

    fn containers_from_entries(&self, entries: Vec<ListingEntry>) -> Result<Vec<Container>> {
        entries
            .into_iter()
            .map(|entry| {
                let identity = ContainerIdentity::from_lxc_name(&entry.lxc_name)
                    .map_err(|e| CoreError::Parse(e.to_string()))?;
                Ok(self.adopt(identity, entry.state))
            })
            .collect()
    }

    /// Ask the runtime for its current listing
    pub async fn list_runtime(&self) -> Result<Vec<Container>> {
        let entries = self.runtime_listing().await?;
        self.containers_from_entries(entries)
    }

    /// Raw rows of the runtime listing
    pub async fn runtime_listing(&self) -> Result<Vec<ListingEntry>> {
        let argv = self.ctx.lxc.list();
        let output = self
            .ctx
            .runner
            .run(&argv, None, self.ctx.command_timeout)
            .await?;
        if !output.success() {
            return Err(CoreError::CommandFailed {
                command: autolxc_runtime::display_command(&argv),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Self::parse_listing(&output.stdout)
    }
}
