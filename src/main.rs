mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use vg_av::{FfmpegProber, MediaProber, ToolRegistry};
use vg_core::config::Config;
use vg_core::{Role, UserId};
use vg_server::token::TokenSigner;

async fn start_server(host: Option<String>, port: Option<u16>, config_path: Option<&Path>) -> Result<()> {
    let mut config = Config::load_or_default(config_path);

    // Override host/port from CLI if specified
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!("Starting vidgate server");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );

    vg_server::start(config).await?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "vidgate=trace,vg_server=trace,vg_av=debug,vg_db=debug,vg_core=debug,tower_http=debug"
                .to_string()
        } else {
            "vidgate=info,vg_server=info,vg_av=info,vg_db=info,vg_core=info,tower_http=info"
                .to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(env_filter))
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::IssueToken {
            user,
            role,
            org,
            ttl_hours,
        } => issue_token(cli.config.as_deref(), user, &role, org, ttl_hours),
        Commands::Probe { file, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(cli.config.as_deref(), &file, json))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate { file } => {
            let path = file.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("vidgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn issue_token(
    config_path: Option<&Path>,
    user: Option<String>,
    role: &str,
    org: Option<String>,
    ttl_hours: Option<u64>,
) -> Result<()> {
    let config = Config::load_or_default(config_path);

    let user: UserId = match user {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid user id: {raw}"))?,
        None => UserId::new(),
    };
    let role: Role = role.parse().map_err(anyhow::Error::msg)?;
    let ttl_hours = ttl_hours.unwrap_or(config.auth.session_ttl_hours);
    let ttl_secs = i64::try_from(ttl_hours.saturating_mul(3600)).context("ttl is too large")?;

    let signer = TokenSigner::new(config.auth.signing_secret()?);
    let token = signer.issue_session(user, role, org, ttl_secs)?;

    eprintln!("user: {user}  role: {role}  expires in: {ttl_hours}h");
    println!("{token}");
    Ok(())
}

async fn probe_file(config_path: Option<&Path>, file: &Path, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let prober = FfmpegProber::from_registry(&tools, &config.processing);
    if !prober.is_available() {
        anyhow::bail!("ffprobe is not installed; run `vidgate check-tools`");
    }

    let info = prober.probe(file).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("File: {}", file.display());
        if let Some(secs) = info.duration_secs {
            let total = secs as u64;
            println!(
                "Duration: {:02}:{:02}:{:02} ({secs:.2}s)",
                total / 3600,
                (total / 60) % 60,
                total % 60
            );
        }
        if let (Some(w), Some(h)) = (info.width, info.height) {
            println!("Resolution: {w}x{h}");
        }
        if let Some(ref codec) = info.codec {
            println!("Codec: {codec}");
        }
        if let Some(bitrate) = info.bitrate {
            println!("Bitrate: {} kb/s", bitrate / 1000);
        }
        println!("Audio: {}", if info.has_audio { "yes" } else { "no" });
    }

    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Uploads will complete without duration, resolution, or thumbnails.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))?;
            let config = Config::from_json(&contents)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Database: {}", config.server.db_path.display());
    println!("  Blob dir: {}", config.server.blob_dir.display());
    println!("  Max upload: {} bytes", config.upload.max_bytes);
    println!("  Allowed types: {}", config.upload.allowed_mime_types.join(", "));
    println!("  Deny-list tokens: {}", config.moderation.deny_list.len());

    let warnings = config.validate();
    for warning in &warnings {
        println!("  ! {warning}");
    }

    Ok(())
}
