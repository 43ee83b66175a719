//! Tunnel definition store
//!
//! Reads port-forward definitions and projects from a YAML file
//! (~/.kforward/config.yaml by default):
//!
//! ```yaml
//! port_forwards:
//!   - id: mysql-staging
//!     context: staging
//!     namespace: mysql
//!     service: mysql-svc
//!     port_remote: 3306
//!     port_local: 3306
//! projects:
//!   - name: database-dev
//!     forwards: [mysql-staging]
//! ```
//!
//! `${VAR}` references in `context` and `namespace` are expanded from the
//! environment when the file is loaded. The raw text is what gets saved back.

use anyhow::{Context, Result};
use kforward_core::TunnelDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the store location
pub const CONFIG_ENV: &str = "KFORWARD_CONFIG";

/// A named set of forwards that are activated together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,

    /// Forward ids, in activation order
    #[serde(default)]
    pub forwards: Vec<String>,
}

/// On-disk file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub port_forwards: Vec<TunnelDefinition>,

    /// Legacy key, read only when `port_forwards` is empty
    #[serde(default, skip_serializing)]
    pub portforwards: Vec<TunnelDefinition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<Project>,
}

impl ConfigFile {
    /// Parse and validate YAML content
    pub fn parse(content: &str) -> Result<Self> {
        let mut file: ConfigFile = if content.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(content).context("Failed to parse YAML config")?
        };

        if file.port_forwards.is_empty() && !file.portforwards.is_empty() {
            debug!("Loading from legacy 'portforwards' key");
            file.port_forwards = std::mem::take(&mut file.portforwards);
        }
        file.portforwards.clear();

        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for (i, forward) in self.port_forwards.iter().enumerate() {
            validate_forward(i, forward)?;
            if !ids.insert(forward.id.as_str()) {
                anyhow::bail!("Duplicate port forward id: '{}'", forward.id);
            }
        }

        let mut names = HashSet::new();
        for (i, project) in self.projects.iter().enumerate() {
            if project.name.is_empty() {
                anyhow::bail!("Project at index {} has an empty name", i);
            }
            if project.name.trim() != project.name {
                anyhow::bail!(
                    "Project name '{}' contains leading/trailing whitespace",
                    project.name
                );
            }
            if !names.insert(project.name.as_str()) {
                anyhow::bail!("Duplicate project name: '{}'", project.name);
            }
            for id in &project.forwards {
                if !ids.contains(id.as_str()) {
                    anyhow::bail!(
                        "Project '{}' references unknown port forward id: '{}'",
                        project.name,
                        id
                    );
                }
            }
        }

        Ok(())
    }
}

fn validate_forward(index: usize, forward: &TunnelDefinition) -> Result<()> {
    if forward.id.is_empty() {
        anyhow::bail!("Port forward at index {} has an empty id", index);
    }
    if forward.id.trim() != forward.id {
        anyhow::bail!(
            "Port forward id '{}' contains leading/trailing whitespace",
            forward.id
        );
    }
    if forward.port_local == 0 || forward.port_remote == 0 {
        anyhow::bail!("Port forward '{}' must use non-zero ports", forward.id);
    }
    if forward.namespace.is_empty() || forward.service.is_empty() {
        anyhow::bail!("Port forward '{}' needs a namespace and a service", forward.id);
    }
    Ok(())
}

/// Expand `${VAR}` references from the environment
///
/// Unset variables expand to an empty string.
pub fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}").context("Invalid env var pattern")?;
    let expanded = re.replace_all(input, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}

fn expand_definition(raw: &TunnelDefinition) -> Result<TunnelDefinition> {
    let mut definition = raw.clone();
    definition.context = expand_env_vars(&raw.context)?;
    definition.namespace = expand_env_vars(&raw.namespace)?;
    Ok(definition)
}

/// Definitions and projects backed by one YAML file
pub struct ConfigStore {
    path: PathBuf,
    file: ConfigFile,
    definitions: Vec<TunnelDefinition>,
    previous: Vec<TunnelDefinition>,
    active_project: Option<String>,
}

impl ConfigStore {
    /// Default store location, honouring the environment override
    pub fn default_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".kforward").join("config.yaml"))
    }

    /// Open the store at a path
    ///
    /// A missing file yields an empty store; its directory is created so the
    /// file can be written later.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = Self::read(&path)?;
        let definitions = Self::expand(&file)?;

        info!(
            forwards = definitions.len(),
            projects = file.projects.len(),
            "Loaded configuration from {:?}",
            path
        );

        Ok(Self {
            path,
            file,
            definitions,
            previous: Vec::new(),
            active_project: None,
        })
    }

    fn read(path: &Path) -> Result<ConfigFile> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }
            debug!("Config file {:?} does not exist, starting empty", path);
            return Ok(ConfigFile::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        ConfigFile::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    fn expand(file: &ConfigFile) -> Result<Vec<TunnelDefinition>> {
        file.port_forwards.iter().map(expand_definition).collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All definitions in file order
    pub fn definitions(&self) -> &[TunnelDefinition] {
        &self.definitions
    }

    /// Definitions as they were before the last successful reload
    pub fn previous(&self) -> &[TunnelDefinition] {
        &self.previous
    }

    pub fn get(&self, id: &str) -> Option<&TunnelDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }

    /// Position of a definition in file order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.definitions.iter().position(|d| d.id == id)
    }

    pub fn projects(&self) -> &[Project] {
        &self.file.projects
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.file.projects.iter().find(|p| p.name == name)
    }

    pub fn active_project(&self) -> Option<&str> {
        self.active_project.as_deref()
    }

    /// Switch the active project; `None` deactivates
    pub fn set_active_project(&mut self, name: Option<&str>) -> Result<()> {
        match name {
            None => {
                debug!("Cleared active project");
                self.active_project = None;
            }
            Some(name) => {
                if self.project(name).is_none() {
                    anyhow::bail!("Project '{}' not found", name);
                }
                debug!(project = %name, "Set active project");
                self.active_project = Some(name.to_string());
            }
        }
        Ok(())
    }

    /// Definitions of a project, in project order
    pub fn project_definitions(&self, name: &str) -> Result<Vec<TunnelDefinition>> {
        let project = self
            .project(name)
            .with_context(|| format!("Project '{}' not found", name))?;

        Ok(project
            .forwards
            .iter()
            .filter_map(|id| self.get(id).cloned())
            .collect())
    }

    /// The desired set: the active project's forwards, or every definition
    pub fn desired(&self) -> Vec<TunnelDefinition> {
        match self
            .active_project
            .as_deref()
            .and_then(|name| self.project_definitions(name).ok())
        {
            Some(definitions) => definitions,
            None => self.definitions.clone(),
        }
    }

    /// Re-read the file
    ///
    /// On success the old definitions become [`previous`](Self::previous)
    /// and the active project is kept if it still exists. On failure nothing
    /// changes.
    pub fn reload(&mut self) -> Result<()> {
        let file = Self::read(&self.path).context("Config reload failed, kept previous config")?;
        let definitions =
            Self::expand(&file).context("Config reload failed, kept previous config")?;

        let was = self.definitions.len();
        self.previous = std::mem::replace(&mut self.definitions, definitions);
        self.file = file;

        if let Some(name) = self.active_project.clone() {
            if self.project(&name).is_none() {
                warn!(project = %name, "Active project no longer exists after reload, cleared");
                self.active_project = None;
            }
        }

        info!(
            forwards = self.definitions.len(),
            previous = was,
            projects = self.file.projects.len(),
            "Configuration reloaded"
        );
        Ok(())
    }

    /// Add a new forward definition
    pub fn add_forward(&mut self, forward: TunnelDefinition) -> Result<()> {
        validate_forward(self.file.port_forwards.len(), &forward)?;
        if self.get(&forward.id).is_some() {
            anyhow::bail!("Port forward '{}' already exists", forward.id);
        }

        self.definitions.push(expand_definition(&forward)?);
        self.file.port_forwards.push(forward);
        Ok(())
    }

    /// Remove a forward and drop it from every project
    pub fn remove_forward(&mut self, id: &str) -> Result<TunnelDefinition> {
        let index = self
            .position(id)
            .with_context(|| format!("Port forward '{}' not found", id))?;

        self.definitions.remove(index);
        let removed = self.file.port_forwards.remove(index);
        for project in &mut self.file.projects {
            project.forwards.retain(|f| f != id);
        }
        Ok(removed)
    }

    /// Create a project
    pub fn create_project(&mut self, name: &str, forwards: Vec<String>) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Project name cannot be empty");
        }
        if self.project(name).is_some() {
            anyhow::bail!("Project '{}' already exists", name);
        }
        self.check_forward_ids(&forwards)?;

        self.file.projects.push(Project {
            name: name.to_string(),
            forwards,
        });
        Ok(())
    }

    /// Replace the forward list of an existing project
    pub fn update_project(&mut self, name: &str, forwards: Vec<String>) -> Result<()> {
        self.check_forward_ids(&forwards)?;
        let project = self
            .file
            .projects
            .iter_mut()
            .find(|p| p.name == name)
            .with_context(|| format!("Project '{}' not found", name))?;
        project.forwards = forwards;
        Ok(())
    }

    pub fn delete_project(&mut self, name: &str) -> Result<()> {
        let before = self.file.projects.len();
        self.file.projects.retain(|p| p.name != name);
        if self.file.projects.len() == before {
            anyhow::bail!("Project '{}' not found", name);
        }
        if self.active_project.as_deref() == Some(name) {
            self.active_project = None;
        }
        Ok(())
    }

    fn check_forward_ids(&self, forwards: &[String]) -> Result<()> {
        for id in forwards {
            if self.get(id).is_none() {
                anyhow::bail!("Port forward '{}' does not exist", id);
            }
        }
        Ok(())
    }

    /// Write the store back to its file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let yaml = serde_yaml::to_string(&self.file).context("Failed to serialize config")?;
        fs::write(&self.path, yaml)
            .with_context(|| format!("Failed to write config file: {:?}", self.path))?;

        debug!("Saved configuration to {:?}", self.path);
        Ok(())
    }
}
