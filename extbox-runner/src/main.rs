//! extbox runner
//!
//! Runs one extension once, outside the platform dispatcher, and prints the
//! `ExecutionResult` as JSON on stdout. Logs go to stderr.
//!
//! Usage:
//!   extbox-runner --descriptor weather.toml --scripts ./scripts --args london
//!   extbox-runner --descriptors ./tenants --tenant guild-1 --extension weather
//!
//! Exits 0 when the extension completed and 2 for any other outcome.

use anyhow::Result;
use clap::Parser;
use extbox_runner::{
    build_engine, load_context, load_descriptor, render_result, ContextInput, DescriptorInput,
};
use extbox_sandbox::SandboxConfig;
use extbox_types::{ChannelId, UserId};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "extbox-runner")]
#[command(about = "Run one extension in the extbox sandbox")]
struct Args {
    /// Descriptor TOML file
    #[arg(short, long, required_unless_present = "descriptors")]
    descriptor: Option<PathBuf>,

    /// Descriptor root laid out as <root>/<tenant>/<extension>.toml
    #[arg(long, conflicts_with = "descriptor", requires_all = ["tenant", "extension"])]
    descriptors: Option<PathBuf>,

    #[arg(long)]
    tenant: Option<String>,

    #[arg(long)]
    extension: Option<String>,

    /// Directory holding <code_ref>.wasm or <code_ref>.wat
    #[arg(short, long, default_value = "scripts")]
    scripts: PathBuf,

    /// JSON execution context; replaces --args, --channel and --user
    #[arg(long)]
    context: Option<PathBuf>,

    /// Command arguments or the message text for keyword triggers
    #[arg(long = "args", default_value = "")]
    trigger_args: String,

    #[arg(long, default_value = "cli")]
    channel: String,

    #[arg(long, default_value = "cli-user")]
    user: String,

    /// Sandbox config file
    #[arg(short, long, default_value = "extbox.toml")]
    config: PathBuf,

    /// SQLite database for extension storage (in-memory if omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn descriptor_input(&self) -> Result<DescriptorInput> {
        match (&self.descriptor, &self.descriptors, &self.tenant, &self.extension) {
            (Some(path), _, _, _) => Ok(DescriptorInput::File(path.clone())),
            (None, Some(root), Some(tenant), Some(extension)) => {
                DescriptorInput::lookup(root.clone(), tenant, extension)
            }
            _ => anyhow::bail!("Either --descriptor or --descriptors with --tenant and --extension is required"),
        }
    }

    fn context_input(&self) -> Result<ContextInput> {
        Ok(match &self.context {
            Some(path) => ContextInput::File(path.clone()),
            None => ContextInput::Synthesize {
                args: self.trigger_args.clone(),
                channel_id: ChannelId::new(self.channel.as_str())?,
                user_id: UserId::new(self.user.as_str())?,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let descriptor = load_descriptor(&args.descriptor_input()?).await?;
    let context = load_context(&args.context_input()?, &descriptor).await?;
    info!(
        tenant_id = %descriptor.tenant_id,
        extension_id = %descriptor.extension_id,
        network = descriptor.network.as_str(),
        "Running extension"
    );

    let config = SandboxConfig::load(Some(&args.config));
    let engine = build_engine(config, &args.scripts, args.db.as_deref())?;
    let result = engine.run(&descriptor, &context).await;
    drop(engine);

    println!("{}", render_result(&result)?);
    if !result.is_completed() {
        std::process::exit(2);
    }
    Ok(())
}
