//! Agent registry -- maps an agent id to its descriptor.
//!
//! Built-in agents (`codex`, `opencode`) are registered at construction;
//! plugin agents come from `[agents.<id>]` manifests and reuse one of the
//! built-in protocol families. Ids are case-insensitive and a plugin can
//! never shadow a built-in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AgentManifest, LaunchSpec, ProtocolFamily};
use crate::error::{Error, Result};
use crate::harness::{CodexHarness, Harness, HarnessContext, OpencodeHarness};

/// Feature an agent declares, used to gate calls before they are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    ConversationListing,
    ConversationResume,
    TurnExecution,
    ModelListing,
    Review,
    EventStreaming,
    Approvals,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::ConversationListing,
        Capability::ConversationResume,
        Capability::TurnExecution,
        Capability::ModelListing,
        Capability::Review,
        Capability::EventStreaming,
        Capability::Approvals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ConversationListing => "conversation-listing",
            Capability::ConversationResume => "conversation-resume",
            Capability::TurnExecution => "turn-execution",
            Capability::ModelListing => "model-listing",
            Capability::Review => "review",
            Capability::EventStreaming => "event-streaming",
            Capability::Approvals => "approvals",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What each protocol family can do out of the box.
pub fn default_capabilities(protocol: ProtocolFamily) -> BTreeSet<Capability> {
    match protocol {
        ProtocolFamily::Codex => Capability::ALL.into_iter().collect(),
        ProtocolFamily::Acp => [
            Capability::ConversationResume,
            Capability::TurnExecution,
            Capability::EventStreaming,
            Capability::Approvals,
        ]
        .into_iter()
        .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    BuiltIn,
    Plugin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy { detail: String },
    Unavailable { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy { .. })
    }
}

pub type HarnessFactory = Arc<dyn Fn(HarnessContext) -> Arc<dyn Harness> + Send + Sync>;
pub type HealthCheck = Arc<dyn Fn() -> HealthStatus + Send + Sync>;

/// Registry entry. Immutable once registered.
#[derive(Clone)]
pub struct AgentDescriptor {
    id: String,
    display_name: String,
    protocol: ProtocolFamily,
    capabilities: BTreeSet<Capability>,
    origin: Origin,
    launch: LaunchSpec,
    constructor: HarnessFactory,
    health: HealthCheck,
}

impl fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("origin", &self.origin)
            .field("capabilities", &self.capabilities)
            .field("launch", &self.launch)
            .finish()
    }
}

impl AgentDescriptor {
    /// Descriptor backed by the built-in harness for `protocol`, with that
    /// family's default capabilities and a PATH-lookup health check.
    pub fn for_protocol(
        id: impl Into<String>,
        protocol: ProtocolFamily,
        launch: LaunchSpec,
        origin: Origin,
    ) -> Self {
        let id = id.into().to_lowercase();
        let constructor: HarnessFactory = {
            let id = id.clone();
            let launch = launch.clone();
            match protocol {
                ProtocolFamily::Codex => Arc::new(move |ctx| {
                    Arc::new(CodexHarness::new(id.clone(), launch.clone(), ctx)) as Arc<dyn Harness>
                }),
                ProtocolFamily::Acp => Arc::new(move |ctx| {
                    Arc::new(OpencodeHarness::new(id.clone(), launch.clone(), ctx)) as Arc<dyn Harness>
                }),
            }
        };
        let health: HealthCheck = {
            let launch = launch.clone();
            Arc::new(move || program_health(&launch))
        };
        Self {
            display_name: id.clone(),
            id,
            protocol,
            capabilities: default_capabilities(protocol),
            origin,
            launch,
            constructor,
            health,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: BTreeSet<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_constructor(mut self, constructor: HarnessFactory) -> Self {
        self.constructor = constructor;
        self
    }

    pub fn with_health_check(mut self, health: HealthCheck) -> Self {
        self.health = health;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn protocol(&self) -> ProtocolFamily {
        self.protocol
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Synchronous and side-effect free; never starts a session.
    pub fn check_health(&self) -> HealthStatus {
        (self.health)()
    }

    pub fn instantiate(&self, ctx: HarnessContext) -> Arc<dyn Harness> {
        (self.constructor)(ctx)
    }
}

fn program_health(launch: &LaunchSpec) -> HealthStatus {
    match launch.resolve_program() {
        Some(path) => HealthStatus::Healthy {
            detail: path.display().to_string(),
        },
        None => HealthStatus::Unavailable {
            reason: format!("{} not found on PATH", launch.program),
        },
    }
}

/// The set of known agents, keyed by lowercased id.
#[derive(Debug, Default, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentDescriptor>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in agents with their default commands.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin_descriptors() {
            registry.agents.insert(descriptor.id.clone(), descriptor);
        }
        registry
    }

    /// Built-ins plus everything declared in `[agents.<id>]` tables.
    ///
    /// A table for a built-in id may override its command and environment;
    /// declaring a `protocol` for a built-in id is a plugin trying to
    /// shadow it and is rejected.
    pub fn from_manifests(manifests: &BTreeMap<String, AgentManifest>) -> Result<Self> {
        let mut builtins: BTreeMap<String, AgentDescriptor> = builtin_descriptors()
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        let mut plugins = Vec::new();

        for (raw_id, manifest) in manifests {
            let id = raw_id.to_lowercase();
            if let Some(builtin) = builtins.get_mut(&id) {
                if manifest.protocol.is_some() {
                    return Err(Error::PluginIdConflict(id));
                }
                *builtin = override_builtin(builtin, manifest)?;
                debug!(agent = %id, "applied launch override to built-in agent");
                continue;
            }

            let protocol = manifest.protocol.ok_or_else(|| {
                Error::Config(format!("agent {id:?} must declare a protocol (codex or acp)"))
            })?;
            let launch = manifest
                .launch_spec()?
                .ok_or_else(|| Error::Config(format!("agent {id:?} must declare a command")))?;
            let mut descriptor = AgentDescriptor::for_protocol(&id, protocol, launch, Origin::Plugin);
            if let Some(name) = &manifest.display_name {
                descriptor = descriptor.with_display_name(name);
            }
            if let Some(capabilities) = &manifest.capabilities {
                descriptor = descriptor.with_capabilities(capabilities.clone());
            }
            plugins.push(descriptor);
        }

        let mut registry = Self {
            agents: builtins,
        };
        for plugin in plugins {
            registry.register(plugin)?;
        }
        Ok(registry)
    }

    /// Add a descriptor. A plugin may not reuse a built-in id; any other
    /// duplicate is rejected too.
    pub fn register(&mut self, descriptor: AgentDescriptor) -> Result<()> {
        let id = descriptor.id.to_lowercase();
        if let Some(existing) = self.agents.get(&id) {
            return Err(match (existing.origin, descriptor.origin) {
                (Origin::BuiltIn, Origin::Plugin) => Error::PluginIdConflict(id),
                _ => Error::DuplicateAgent(id),
            });
        }
        info!(agent = %id, protocol = %descriptor.protocol, origin = ?descriptor.origin, "registered agent");
        self.agents.insert(id, descriptor);
        Ok(())
    }

    pub fn resolve(&self, id: &str) -> Result<&AgentDescriptor> {
        self.agents
            .get(&id.to_lowercase())
            .ok_or_else(|| Error::UnknownAgent(id.to_string()))
    }

    pub fn capabilities(&self, id: &str) -> Result<&BTreeSet<Capability>> {
        Ok(self.resolve(id)?.capabilities())
    }

    /// Resolve `id`, failing unless it declares `capability`.
    pub fn require(&self, id: &str, capability: Capability) -> Result<&AgentDescriptor> {
        let descriptor = self.resolve(id)?;
        if !descriptor.supports(capability) {
            return Err(Error::unsupported(descriptor.id(), capability));
        }
        Ok(descriptor)
    }

    pub fn instantiate(&self, id: &str, ctx: HarnessContext) -> Result<Arc<dyn Harness>> {
        Ok(self.resolve(id)?.instantiate(ctx))
    }

    /// Descriptors in id order.
    pub fn iter(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn builtin_descriptors() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::for_protocol(
            "codex",
            ProtocolFamily::Codex,
            CodexHarness::default_launch(),
            Origin::BuiltIn,
        )
        .with_display_name("Codex"),
        AgentDescriptor::for_protocol(
            "opencode",
            ProtocolFamily::Acp,
            OpencodeHarness::default_launch(),
            Origin::BuiltIn,
        )
        .with_display_name("OpenCode"),
    ]
}

fn override_builtin(builtin: &AgentDescriptor, manifest: &AgentManifest) -> Result<AgentDescriptor> {
    let mut launch = manifest
        .launch_spec()?
        .unwrap_or_else(|| builtin.launch.clone());
    launch.env.extend(manifest.env.clone());

    let mut descriptor =
        AgentDescriptor::for_protocol(&builtin.id, builtin.protocol, launch, Origin::BuiltIn)
            .with_display_name(
                manifest
                    .display_name
                    .clone()
                    .unwrap_or_else(|| builtin.display_name.clone()),
            );
    if let Some(capabilities) = &manifest.capabilities {
        descriptor = descriptor.with_capabilities(capabilities.clone());
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(id: &str) -> AgentDescriptor {
        AgentDescriptor::for_protocol(id, ProtocolFamily::Acp, LaunchSpec::new(id), Origin::Plugin)
    }

    #[test]
    fn builtins_are_registered() {
        let registry = AgentRegistry::with_builtins();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("codex").unwrap().origin(), Origin::BuiltIn);
        assert_eq!(registry.resolve("OpenCode").unwrap().protocol(), ProtocolFamily::Acp);
    }

    #[test]
    fn plugin_cannot_shadow_builtin() {
        let mut registry = AgentRegistry::with_builtins();
        let err = registry.register(plugin("codex")).unwrap_err();
        assert!(matches!(err, Error::PluginIdConflict(ref id) if id == "codex"));

        let err = registry.register(plugin("CODEX")).unwrap_err();
        assert!(matches!(err, Error::PluginIdConflict(_)));
    }

    #[test]
    fn plugin_registers_and_resolves() {
        let mut registry = AgentRegistry::with_builtins();
        registry.register(plugin("myagent")).unwrap();
        let descriptor = registry.resolve("MyAgent").unwrap();
        assert_eq!(descriptor.id(), "myagent");
        assert_eq!(descriptor.origin(), Origin::Plugin);

        let err = registry.register(plugin("myagent")).unwrap_err();
        assert!(matches!(err, Error::DuplicateAgent(_)));
    }

    #[test]
    fn unknown_agent_is_not_found() {
        let registry = AgentRegistry::with_builtins();
        assert!(matches!(registry.resolve("nope"), Err(Error::UnknownAgent(_))));
    }

    #[test]
    fn require_gates_on_capability() {
        let registry = AgentRegistry::with_builtins();
        assert!(registry.require("codex", Capability::Review).is_ok());
        let err = registry.require("opencode", Capability::Review).unwrap_err();
        assert!(matches!(
            err,
            Error::CapabilityUnsupported {
                capability: Capability::Review,
                ..
            }
        ));
        assert!(
            registry
                .capabilities("opencode")
                .unwrap()
                .contains(&Capability::TurnExecution)
        );
    }

    #[test]
    fn manifests_declare_plugins_and_override_builtins() {
        let manifests: BTreeMap<String, AgentManifest> = toml::from_str(
            r#"
            [codex]
            command = ["/opt/codex/bin/codex", "app-server"]

            [MyAgent]
            protocol = "acp"
            display_name = "My Agent"
            command = ["myagent", "acp"]
            capabilities = ["turn-execution"]
            "#,
        )
        .unwrap();
        let registry = AgentRegistry::from_manifests(&manifests).unwrap();

        let codex = registry.resolve("codex").unwrap();
        assert_eq!(codex.origin(), Origin::BuiltIn);
        assert_eq!(codex.launch().program, "/opt/codex/bin/codex");

        let mine = registry.resolve("myagent").unwrap();
        assert_eq!(mine.display_name(), "My Agent");
        assert!(mine.supports(Capability::TurnExecution));
        assert!(!mine.supports(Capability::Approvals));
    }

    #[test]
    fn manifest_with_protocol_for_builtin_id_conflicts() {
        let manifests: BTreeMap<String, AgentManifest> = toml::from_str(
            r#"
            [opencode]
            protocol = "acp"
            command = ["other-opencode"]
            "#,
        )
        .unwrap();
        let err = AgentRegistry::from_manifests(&manifests).unwrap_err();
        assert!(matches!(err, Error::PluginIdConflict(ref id) if id == "opencode"));
    }

    #[test]
    fn plugin_manifest_needs_protocol_and_command() {
        let manifests: BTreeMap<String, AgentManifest> =
            toml::from_str("[thing]\ncommand = [\"thing\"]\n").unwrap();
        assert!(matches!(AgentRegistry::from_manifests(&manifests), Err(Error::Config(_))));

        let manifests: BTreeMap<String, AgentManifest> =
            toml::from_str("[thing]\nprotocol = \"codex\"\n").unwrap();
        assert!(matches!(AgentRegistry::from_manifests(&manifests), Err(Error::Config(_))));
    }

    #[test]
    fn health_check_reports_missing_program() {
        let descriptor = AgentDescriptor::for_protocol(
            "ghost",
            ProtocolFamily::Codex,
            LaunchSpec::new("/no/such/ghost-agent"),
            Origin::Plugin,
        );
        let status = descriptor.check_health();
        assert!(!status.is_healthy());

        let descriptor = descriptor.with_health_check(Arc::new(|| HealthStatus::Healthy {
            detail: "stubbed".to_string(),
        }));
        assert!(descriptor.check_health().is_healthy());
    }

    #[test]
    fn capability_names_are_kebab_case() {
        assert_eq!(Capability::ConversationListing.to_string(), "conversation-listing");
        let parsed: Capability = serde_json::from_value(serde_json::json!("model-listing")).unwrap();
        assert_eq!(parsed, Capability::ModelListing);
    }
}
