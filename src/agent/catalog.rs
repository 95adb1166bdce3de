//! Agent catalog - the agent CLIs a child process can run

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How to run one agent CLI non-interactively
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentProfile {
    /// Canonical name
    pub name: String,
    /// Other names that resolve to this profile
    pub aliases: Vec<String>,
    pub display_name: String,
    /// Executable to run
    pub command: String,
    /// Arguments placed before the prompt
    pub prompt_args: Vec<String>,
    /// Flag used to pass a model, if the agent accepts one
    pub model_flag: Option<String>,
}

impl AgentProfile {
    pub fn new(name: &str, display_name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            display_name: display_name.to_string(),
            command: command.to_string(),
            prompt_args: Vec::new(),
            model_flag: None,
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_prompt_args(mut self, args: &[&str]) -> Self {
        self.prompt_args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_model_flag(mut self, flag: &str) -> Self {
        self.model_flag = Some(flag.to_string());
        self
    }

    /// Runs `<name> <prompt>`; used for names the catalog does not know.
    fn custom(name: &str) -> Self {
        Self::new(name, name, name)
    }

    fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }

    /// Executable and full argument list for a prompt.
    pub fn command_line(&self, prompt: &str, model: Option<&str>) -> (String, Vec<String>) {
        let mut args = Vec::new();
        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }
        args.extend(self.prompt_args.iter().cloned());
        args.push(prompt.to_string());
        (self.command.clone(), args)
    }
}

/// Catalog entry returned by `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub display_name: String,
}

/// Known agent profiles, keyed by canonical name
pub struct AgentCatalog {
    profiles: BTreeMap<String, AgentProfile>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        let mut catalog = Self {
            profiles: BTreeMap::new(),
        };
        for profile in default_profiles() {
            catalog.register(profile);
        }
        catalog
    }

    /// Add or replace a profile
    pub fn register(&mut self, profile: AgentProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    fn find(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles
            .get(name)
            .or_else(|| self.profiles.values().find(|p| p.answers_to(name)))
    }

    /// Look up a profile by name or alias.
    ///
    /// Unknown names resolve to a custom profile that runs `<name> <prompt>`.
    pub fn resolve(&self, name: &str) -> AgentProfile {
        self.find(name)
            .cloned()
            .unwrap_or_else(|| AgentProfile::custom(name))
    }

    /// Whether `name` refers to a registered profile
    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        self.profiles
            .values()
            .map(|p| AgentInfo {
                name: p.name.clone(),
                display_name: p.display_name.clone(),
            })
            .collect()
    }
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn default_profiles() -> Vec<AgentProfile> {
    vec![
        AgentProfile::new("claude-code", "Claude Code", "claude")
            .with_aliases(&["claude"])
            .with_prompt_args(&["-p"])
            .with_model_flag("--model"),
        AgentProfile::new("opencode", "OpenCode", "opencode")
            .with_prompt_args(&["run"])
            .with_model_flag("--model"),
        AgentProfile::new("amp", "Amp", "amp")
            .with_aliases(&["ampcode"])
            .with_prompt_args(&["-x"]),
        AgentProfile::new("codex", "Codex", "codex")
            .with_prompt_args(&["exec"])
            .with_model_flag("--model"),
        // aider takes the model before the message flag
        AgentProfile::new("aider", "Aider", "aider")
            .with_prompt_args(&["--yes-always", "--message"])
            .with_model_flag("--model"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_resolve_to_same_profile() {
        let catalog = AgentCatalog::new();
        assert_eq!(catalog.resolve("claude").name, "claude-code");
        assert_eq!(catalog.resolve("ampcode").name, "amp");
        assert!(catalog.contains("ampcode"));
        assert_eq!(catalog.resolve("reviewer").name, "reviewer");
    }

    #[test]
    fn test_command_line_with_model() {
        let catalog = AgentCatalog::new();
        let (command, args) = catalog
            .resolve("claude-code")
            .command_line("fix the build", Some("opus"));
        assert_eq!(command, "claude");
        assert_eq!(args, vec!["--model", "opus", "-p", "fix the build"]);
    }

    #[test]
    fn test_model_ignored_without_flag() {
        let catalog = AgentCatalog::new();
        let (command, args) = catalog.resolve("amp").command_line("hi", Some("x"));
        assert_eq!(command, "amp");
        assert_eq!(args, vec!["-x", "hi"]);
    }

    #[test]
    fn test_custom_agent_runs_by_name() {
        let catalog = AgentCatalog::new();
        assert!(!catalog.contains("my-agent"));
        let (command, args) = catalog.resolve("my-agent").command_line("go", None);
        assert_eq!(command, "my-agent");
        assert_eq!(args, vec!["go"]);
    }

    #[test]
    fn test_registered_profile_becomes_invokable() {
        let mut catalog = AgentCatalog::new();
        catalog.register(
            AgentProfile::new("goose", "Goose", "goose")
                .with_aliases(&["g"])
                .with_prompt_args(&["run", "-t"]),
        );
        assert!(catalog.contains("g"));
        let (command, args) = catalog.resolve("g").command_line("hi", None);
        assert_eq!(command, "goose");
        assert_eq!(args, vec!["run", "-t", "hi"]);
    }

    #[test]
    fn test_list_contains_defaults() {
        let names: Vec<String> = AgentCatalog::new().list().into_iter().map(|a| a.name).collect();
        assert!(names.contains(&"claude-code".to_string()));
        assert!(names.contains(&"amp".to_string()));
        assert_eq!(names.len(), 5);
    }
}
