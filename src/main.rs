//! OPDM client command-line tool.
//!
//! Run with: `opdm --config opdm.yaml <command>`
//!
//! Credentials and the server can also come from `OPDM_SERVER`,
//! `OPDM_USERNAME`, `OPDM_PASSWORD` and `OPDM_EXPORT_FOLDER`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opdm_client::{
    ClientConfig, ContentKind, ContentPayload, FilterValue, MetadataFilter, ObjectQuery,
    ObjectType, OpdmClient, OpdmError, ReportFilter, ReturnMode, SubscriptionMode,
    SubscriptionRequest, SubscriptionStatus,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Command-line client for the OPDM model exchange service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OPDM_CONFIG", default_value = "opdm.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Metadata filter options shared by the query commands.
#[derive(clap::Args, Debug, Default)]
struct FilterArgs {
    /// Literal filter, e.g. `pmd:timeHorizon=1D` (repeatable)
    #[arg(short, long = "filter", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    filters: Vec<(String, String)>,

    /// Filters as YAML or JSON, e.g.
    /// `{"pmd:scenarioDate": {"operator": "is after", "value": "2021-12-30T00:00:00"}}`
    #[arg(long, value_name = "YAML")]
    conditions: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> Result<MetadataFilter> {
        let mut filter = match &self.conditions {
            Some(source) => serde_yaml::from_str::<MetadataFilter>(source)
                .context("Failed to parse filter conditions")?,
            None => MetadataFilter::new(),
        };
        for (key, value) in &self.filters {
            filter.insert(key.clone(), value.as_str());
        }
        Ok(filter)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query model objects
    QueryObject {
        /// Object type, or a condition such as
        /// `{operator: is not one of, value: IGM,BDS}`
        #[arg(short, long, default_value = "IGM")]
        object_type: String,

        #[command(flatten)]
        filter: FilterArgs,

        /// Component pattern, e.g. `opde:Component=<id>` (repeatable)
        #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
        component: Vec<(String, String)>,

        /// Dependency pattern, e.g. `opde:DependsOn=<id>` (repeatable)
        #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
        dependency: Vec<(String, String)>,
    },

    /// Query profiles
    QueryProfile {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Download content into the export folder
    Download {
        /// Content identifiers
        #[arg(required = true, num_args = 1..)]
        ids: Vec<String>,

        /// Identifier kind (profile, model)
        #[arg(short, long, default_value = "profile")]
        kind: ContentKind,

        /// Have the local service store the files instead of returning them
        #[arg(long)]
        store_only: bool,
    },

    /// Upload a file
    Upload {
        path: PathBuf,

        #[arg(short = 't', long, default_value = "CGMES")]
        content_type: String,
    },

    /// List advertised publications
    Publications,

    /// Subscribe to a publication
    Subscribe {
        /// Object type (IGM, CGM, BDS, RULESET)
        object_type: ObjectType,

        #[arg(long)]
        subscription_id: Option<String>,

        #[arg(long)]
        publication_id: Option<String>,

        /// Subscription mode (META, FULL, FULL_DEPENDENCIES)
        #[arg(short, long, default_value = "FULL")]
        mode: SubscriptionMode,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// List subscriptions
    Subscriptions {
        /// Only subscriptions with this status (ACTIVE, INACTIVE)
        #[arg(short, long)]
        status: Option<SubscriptionStatus>,
    },

    StartSubscription { subscription_id: String },

    StopSubscription { subscription_id: String },

    /// Delete a subscription
    CancelSubscription { subscription_id: String },

    /// Publication report of a profile
    Report {
        #[arg(long, conflicts_with = "filename", required_unless_present = "filename")]
        model_id: Option<String>,

        #[arg(long)]
        filename: Option<String>,
    },

    /// Ruleset library management
    #[command(subcommand)]
    Ruleset(RulesetCommand),
}

#[derive(Subcommand, Debug)]
enum RulesetCommand {
    /// Show the installed ruleset version
    Installed,
    /// List installable rulesets
    List,
    /// Install a ruleset version
    Install {
        #[arg(id = "ruleset_version", value_name = "VERSION")]
        version: String,
    },
    /// Reset the ruleset library
    Reset,
    /// Download and install the newest published ruleset
    InstallLatest,
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn to_filters(pairs: &[(String, String)]) -> Vec<MetadataFilter> {
    pairs
        .iter()
        .map(|(key, value)| MetadataFilter::new().with(key.clone(), value.as_str()))
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("OPDM client v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config).await?;
    info!(
        server = %config.server,
        user = %config.username,
        verify_tls = config.verify_tls,
        export_folder = %config.export_folder.display(),
        "Configuration loaded"
    );

    let client = OpdmClient::new(&config).context("Failed to create OPDM client")?;

    if let Err(e) = run(&client, &config, args.command).await {
        if let Some(opdm_error) = e.downcast_ref::<OpdmError>() {
            error!(kind = opdm_error.kind().as_str(), "{}", opdm_error);
        }
        return Err(e);
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<ClientConfig> {
    let mut config = if path.exists() {
        info!("Config file: {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        ClientConfig::from_yaml(&content).context("Failed to parse config file")?
    } else {
        info!("Config file not found, using defaults");
        ClientConfig::default()
    };

    config.apply_env();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(client: &OpdmClient, config: &ClientConfig, command: Command) -> Result<()> {
    match command {
        Command::QueryObject {
            object_type,
            filter,
            component,
            dependency,
        } => {
            let object_type: FilterValue =
                serde_yaml::from_str(&object_type).context("Failed to parse object type")?;
            let query = ObjectQuery {
                object_type,
                metadata: filter.to_filter()?,
                components: to_filters(&component),
                dependencies: to_filters(&dependency),
            };
            print_json(&client.query_object(&query).await?)?;
        }
        Command::QueryProfile { filter } => {
            print_json(&client.query_profile(&filter.to_filter()?).await?)?;
        }
        Command::Download {
            ids,
            kind,
            store_only,
        } => {
            let mode = if store_only {
                ReturnMode::File
            } else {
                ReturnMode::Payload
            };
            download(client, &config.export_folder, &ids, kind, mode).await?;
        }
        Command::Upload { path, content_type } => {
            print_json(&client.publication_request_file(&path, &content_type).await?)?;
        }
        Command::Publications => {
            print_json(&client.available_publications().await?)?;
        }
        Command::Subscribe {
            object_type,
            subscription_id,
            publication_id,
            mode,
            filter,
        } => {
            let request = SubscriptionRequest {
                object_type,
                subscription_id,
                publication_id,
                mode,
                metadata: filter.to_filter()?,
            };
            print_json(&client.publication_subscribe(&request).await?)?;
        }
        Command::Subscriptions { status } => {
            print_json(&client.list_subscriptions(status).await?)?;
        }
        Command::StartSubscription { subscription_id } => {
            print_json(&client.start_subscription(&subscription_id).await?)?;
        }
        Command::StopSubscription { subscription_id } => {
            print_json(&client.stop_subscription(&subscription_id).await?)?;
        }
        Command::CancelSubscription { subscription_id } => {
            print_json(&client.cancel_subscription(&subscription_id).await?)?;
        }
        Command::Report { model_id, filename } => {
            let filter = match (model_id, filename) {
                (Some(model_id), _) => ReportFilter::ModelId(model_id),
                (None, Some(filename)) => ReportFilter::Filename(filename),
                (None, None) => bail!("--model-id or --filename is required"),
            };
            print_json(&client.get_profile_publication_report(&filter).await?)?;
        }
        Command::Ruleset(command) => ruleset(client, command).await?,
    }
    Ok(())
}

async fn download(
    client: &OpdmClient,
    export_folder: &Path,
    ids: &[String],
    kind: ContentKind,
    mode: ReturnMode,
) -> Result<()> {
    let result = client.get_content(ids, kind, mode).await?;
    let contents = OpdmClient::downloaded_contents(&result, mode)?;
    if contents.is_empty() {
        bail!("No content returned for {:?}", ids);
    }

    tokio::fs::create_dir_all(export_folder)
        .await
        .with_context(|| format!("Failed to create {}", export_folder.display()))?;

    for content in contents {
        let name = content
            .file_name
            .or(content.id)
            .unwrap_or_else(|| "content.bin".to_string());
        match content.payload {
            ContentPayload::Inline(bytes) => {
                // Keep only the final component of the remote name
                let file_name = Path::new(&name)
                    .file_name()
                    .map(|n| n.to_owned())
                    .unwrap_or_else(|| "content.bin".into());
                let path = export_folder.join(file_name);
                tokio::fs::write(&path, &bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!(path = %path.display(), size = bytes.len(), "Saved");
            }
            ContentPayload::Reference(location) => {
                info!(name = %name, location = %location, "Stored by the local service");
            }
        }
    }
    Ok(())
}

async fn ruleset(client: &OpdmClient, command: RulesetCommand) -> Result<()> {
    match command {
        RulesetCommand::Installed => {
            println!("{}", client.get_installed_ruleset_version().await?);
        }
        RulesetCommand::List => {
            print_json(&client.list_available_rulesets().await?)?;
        }
        RulesetCommand::Install { version } => {
            print_json(&client.install_ruleset(&version).await?)?;
        }
        RulesetCommand::Reset => {
            print_json(&client.reset_ruleset().await?)?;
        }
        RulesetCommand::InstallLatest => {
            let Some(latest) = client.latest_ruleset().await? else {
                bail!("No RULESET objects published");
            };
            info!(version = %latest.version, id = %latest.id, "Latest published ruleset");

            let installed = client.get_installed_ruleset_version().await?;
            if installed == latest.version {
                info!(version = %installed, "Latest ruleset already installed");
                return Ok(());
            }

            // Fetch the library into the local service so it becomes installable
            client
                .get_content(&[latest.id.as_str()], ContentKind::Model, ReturnMode::File)
                .await?;

            let available = client.available_ruleset_versions().await?;
            if !available.contains(&latest.version) {
                warn!(version = %latest.version, available = ?available, "Ruleset not installable yet");
                bail!(
                    "Ruleset {} is not available for installation, check the local service indexing",
                    latest.version
                );
            }

            print_json(&client.install_ruleset(&latest.version).await?)?;
            info!(previous = %installed, version = %latest.version, "Ruleset updated");
        }
    }
    Ok(())
}
