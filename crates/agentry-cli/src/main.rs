//! Agentry CLI
//!
//! The `agentry` command is the operator surface over the execution core.
//!
//! ## Commands
//!
//! - `function store|exec|list`: manage and run sandboxed functions
//! - `agent register|list`: manage agent definitions
//! - `run`: process one request through the registry and print the execution tree

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, Level};

use agentry_core::{
    AgentDefinition, AgentFactory, EngineConfig, ExecutionNode, ExecutionTracker, FunctionStore,
    HostModules, ModelClient, Registry, Sandbox, ScriptedModelClient, StoreRequest, VersionRef,
};
use agentry_state::{DefinitionStore, JsonFileStore};

#[derive(Parser)]
#[command(name = "agentry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Data-driven agents with a sandboxed function store", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Engine config file (TOML)
    #[arg(long, global = true, env = "AGENTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding agent definitions and function versions
    #[arg(long, global = true, env = "AGENTRY_DATA", default_value = ".agentry")]
    data: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store, run, and list functions
    Function {
        #[command(subcommand)]
        action: FunctionAction,
    },

    /// Register and list agents
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Process one request and print the outcome and execution tree
    Run {
        /// Agent to invoke
        #[arg(short, long)]
        agent: String,

        /// Input as a JSON document
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Conversation id (generated if omitted)
        #[arg(long)]
        conversation: Option<String>,

        /// Scripted model replies (JSON object keyed by agent name)
        #[arg(long)]
        model_script: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum FunctionAction {
    /// Validate and store a function body
    Store {
        #[arg(short, long)]
        name: String,

        /// File containing the function source
        #[arg(short, long)]
        code: PathBuf,

        /// JSON schema file for the input
        #[arg(long)]
        input_schema: Option<PathBuf>,

        /// JSON schema file for the output
        #[arg(long)]
        output_schema: Option<PathBuf>,

        #[arg(long)]
        memory_mb: Option<u64>,

        #[arg(long)]
        timeout_secs: Option<f64>,

        /// Capabilities to grant (comma-separated: math,time,log,fs,net)
        #[arg(long, value_delimiter = ',')]
        allow: Vec<String>,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Run a stored function
    Exec {
        #[arg(short, long)]
        name: String,

        /// Exact version (full hex); latest if omitted
        #[arg(long = "version", value_name = "VERSION")]
        pin: Option<String>,

        /// Arguments as a JSON document
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// List stored functions
    List,
}

#[derive(Subcommand)]
enum AgentAction {
    /// Register one definition, or an array of them, from a JSON file
    Register {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List stored definitions
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    agentry_core::init_tracing(cli.json, level);

    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load engine config")?;
    let store = Arc::new(
        JsonFileStore::open(&cli.data)
            .with_context(|| format!("Failed to open data directory {:?}", cli.data))?,
    );

    let result = match cli.command {
        Commands::Function { action } => {
            let registry = open_registry(&config, &store, None).await?;
            match action {
                FunctionAction::Store {
                    name,
                    code,
                    input_schema,
                    output_schema,
                    memory_mb,
                    timeout_secs,
                    allow,
                    description,
                } => {
                    let mut request = StoreRequest::new(name, read_text(&code)?)
                        .with_schemas(read_schema(input_schema.as_deref())?, read_schema(output_schema.as_deref())?)
                        .describe(description);
                    if memory_mb.is_some() || timeout_secs.is_some() {
                        request = request.with_limits(
                            memory_mb.unwrap_or(config.default_limits.memory_limit_mb),
                            timeout_secs.unwrap_or(config.default_limits.timeout_seconds),
                        );
                    }
                    for capability in allow {
                        request = request.allow(capability.trim());
                    }
                    cmd_function_store(&registry, request).await
                }
                FunctionAction::Exec { name, pin, args } => {
                    cmd_function_exec(&registry, &name, pin.as_deref(), &args).await
                }
                FunctionAction::List => cmd_function_list(&registry).await,
            }
        }
        Commands::Agent { action } => match action {
            AgentAction::Register { file } => {
                let registry = open_registry(&config, &store, None).await?;
                cmd_agent_register(&registry, &file).await
            }
            AgentAction::List => cmd_agent_list(store.as_ref()).await,
        },
        Commands::Run {
            agent,
            input,
            conversation,
            model_script,
        } => {
            let model = match model_script {
                Some(path) => Some(load_model_script(&path)?),
                None => None,
            };
            let registry = open_registry(&config, &store, model).await?;
            cmd_run(&registry, &agent, &input, conversation).await
        }
    };

    agentry_core::metrics::METRICS.flush();
    result
}

/// Wire the core over the JSON store and load every active definition.
async fn open_registry(
    config: &EngineConfig,
    store: &Arc<JsonFileStore>,
    model: Option<Arc<dyn ModelClient>>,
) -> Result<Registry> {
    let functions = FunctionStore::new(
        store.clone(),
        ExecutionTracker::new(),
        Sandbox::new(HostModules::default(), config.timeout_grace()),
        config.default_limits,
    );
    let mut factory = AgentFactory::new(Arc::new(functions), config);
    if let Some(client) = model {
        factory = factory.with_model_client(client);
    }
    let registry = Registry::new(factory, config).with_definition_store(store.clone());
    let loaded = registry
        .load_definitions(store.as_ref())
        .await
        .context("Failed to load agent definitions")?;
    tracing::debug!(loaded, "agent definitions loaded");
    Ok(registry)
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
}

fn read_schema(path: Option<&Path>) -> Result<Value> {
    match path {
        Some(path) => parse_json(&read_text(path)?).with_context(|| format!("Invalid schema in {:?}", path)),
        None => Ok(Value::Object(Default::default())),
    }
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).context("Invalid JSON")
}

fn load_model_script(path: &Path) -> Result<Arc<dyn ModelClient>> {
    let script = parse_json(&read_text(path)?)?;
    let client = ScriptedModelClient::from_json(script)
        .with_context(|| format!("Invalid model script {:?}", path))?;
    Ok(Arc::new(client))
}

/// Accept either one definition or an array of them.
fn parse_definitions(value: Value) -> Result<Vec<AgentDefinition>> {
    match value {
        Value::Array(_) => Ok(serde_json::from_value(value)?),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

async fn cmd_function_store(registry: &Registry, request: StoreRequest) -> Result<()> {
    let record = registry.functions().store_function(request).await?;
    info!(function = %record.name, version = %record.version.short(), "function stored");
    println!("Stored {}@{}", record.name, record.version);
    Ok(())
}

async fn cmd_function_exec(registry: &Registry, name: &str, pin: Option<&str>, args: &str) -> Result<()> {
    let version = match pin {
        Some(pin) => VersionRef::parse_reference(&format!("{name}@{pin}"))?.1,
        None => VersionRef::Latest,
    };
    let args = parse_json(args)?;
    let result = registry
        .functions()
        .execute_function(name, &version, args)
        .await;

    for record in registry.tracker().by_target(name) {
        println!(
            "{} {} [{}] {}ms",
            record.kind,
            record.target,
            record.status,
            record.duration_ms().unwrap_or(0)
        );
    }
    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_function_list(registry: &Registry) -> Result<()> {
    let records = registry.functions().list_functions().await?;
    if records.is_empty() {
        println!("No functions stored.");
        return Ok(());
    }
    for record in records {
        let versions = registry.functions().versions(&record.name).await?;
        let caps: Vec<&str> = record.allowed_capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<24} {}  versions={} caps=[{}] {}",
            record.name,
            record.version.short(),
            versions.len(),
            caps.join(","),
            record.description
        );
    }
    Ok(())
}

async fn cmd_agent_register(registry: &Registry, file: &Path) -> Result<()> {
    let definitions = parse_definitions(parse_json(&read_text(file)?)?)
        .with_context(|| format!("Invalid agent definition in {:?}", file))?;
    for definition in definitions {
        let name = definition.name.clone();
        registry.register_agent(definition).await?;
        println!("Registered agent '{}'", name);
    }
    Ok(())
}

async fn cmd_agent_list(store: &dyn DefinitionStore) -> Result<()> {
    let agents = store.list_agents().await?;
    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }
    for agent in agents {
        let tools: Vec<&str> = agent.allowed_tools.iter().map(String::as_str).collect();
        println!(
            "{:<24} {:<8} depth<={} tools=[{}]{}{}",
            agent.name,
            if agent.is_active { "active" } else { "inactive" },
            agent.max_chain_depth,
            tools.join(","),
            agent
                .fallback_agent_name
                .as_deref()
                .map(|f| format!(" fallback={f}"))
                .unwrap_or_default(),
            if agent.description.is_empty() {
                String::new()
            } else {
                format!("  {}", agent.description)
            }
        );
    }
    Ok(())
}

async fn cmd_run(registry: &Registry, agent: &str, input: &str, conversation: Option<String>) -> Result<()> {
    let input = parse_json(input)?;
    let conversation = conversation.unwrap_or_else(|| agentry_core::ChainContext::fresh().conversation_id);

    let outcome = registry.process(agent, input, &conversation).await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    println!();
    println!("conversation {}", conversation);
    print_tree(&registry.tracker().tree(&conversation), 1);

    if let Some(error) = outcome.error {
        anyhow::bail!("{}: {}", error.kind, error.message);
    }
    Ok(())
}

fn print_tree(nodes: &[ExecutionNode], level: usize) {
    for node in nodes {
        println!("{}", render_node(node, level));
        print_tree(&node.children, level + 1);
    }
}

fn render_node(node: &ExecutionNode, level: usize) -> String {
    let record = &node.record;
    let mut line = format!(
        "{:indent$}{} {} [{}] depth={} {}ms",
        "",
        record.kind,
        record.target,
        record.status,
        record.depth,
        record.duration_ms().unwrap_or(0),
        indent = level * 2
    );
    if record.fallback_for.is_some() {
        line.push_str(" (fallback)");
    }
    if let Some(error) = &record.error {
        line.push_str(&format!(" {}: {}", error.kind, error.message));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_store_arguments() {
        let cli = Cli::try_parse_from([
            "agentry",
            "function",
            "store",
            "--name",
            "double",
            "--code",
            "double.fn",
            "--allow",
            "math,time",
        ])
        .unwrap();
        match cli.command {
            Commands::Function {
                action: FunctionAction::Store { name, allow, .. },
            } => {
                assert_eq!(name, "double");
                assert_eq!(allow, vec!["math".to_string(), "time".to_string()]);
            }
            _ => panic!("expected function store"),
        }
    }

    #[test]
    fn test_parse_definitions_accepts_one_or_many() {
        let one = parse_definitions(serde_json::json!({"name": "a"})).unwrap();
        assert_eq!(one.len(), 1);
        let many = parse_definitions(serde_json::json!([{"name": "a"}, {"name": "b"}])).unwrap();
        assert_eq!(many.len(), 2);
        assert!(parse_definitions(serde_json::json!({"nom": "a"})).is_err());
    }

    #[tokio::test]
    async fn test_store_and_run_plan_agent_against_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
        let config = EngineConfig::default();

        let registry = open_registry(&config, &store, None).await.unwrap();
        registry
            .functions()
            .store_function(StoreRequest::new("double", "return {result: x * 2};"))
            .await
            .unwrap();
        let definition = parse_definitions(serde_json::json!({
            "name": "doubler",
            "allowed_tools": ["double"],
            "kind": {"type": "plan", "steps": [{"target": {"type": "tool", "name": "double"}}]}
        }))
        .unwrap();
        registry
            .register_agent(definition.into_iter().next().unwrap())
            .await
            .unwrap();

        // a second process sees what the first persisted
        let reopened = open_registry(&config, &store, None).await.unwrap();
        let outcome = reopened.process("doubler", serde_json::json!({"x": 4}), "cli").await;
        assert_eq!(outcome.result, Some(serde_json::json!({"result": 8})));

        let tree = reopened.tracker().tree("cli");
        let line = render_node(&tree[0], 1);
        assert!(line.contains("agent doubler [completed] depth=0"), "{line}");
    }
}
