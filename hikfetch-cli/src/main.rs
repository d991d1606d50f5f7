use std::process;
use std::sync::Arc;

use clap::Parser;
use hikfetch::cli::Args;
use hikfetch::config::{AppConfig, credentials};
use hikfetch::error::{AppError, Result};
use hikfetch::logging::init_logging;
use hikfetch::output::{EXIT_INTERRUPTED, EXIT_PARTIAL, OutputFormat, exit_code, print_report};
use hikfetch::utils::parse_datetime;
use hikfetch_engine::layout::device_label;
use hikfetch_engine::{
    ArchiveLayout, ChannelSelection, ContentKind, FetchError, FetchRequest, IsapiClient,
    Orchestrator, TimeBasis,
};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let code = match run(args).await {
        Ok(code) => code,
        Err(AppError::Fetch(FetchError::Cancelled)) => {
            eprintln!("Interrupted");
            EXIT_INTERRUPTED
        }
        Err(e) => {
            error!("Application error: {e}");
            eprintln!("Error: {e}");
            1
        }
    };
    process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let mut config = AppConfig::load(args.config.as_deref())?;
    config.apply_args(&args);

    let request = FetchRequest {
        device: args.device.clone(),
        start: parse_datetime(&args.start_date, &args.start_time)?,
        end: parse_datetime(&args.end_date, &args.end_time)?,
        time_basis: if args.utc {
            TimeBasis::Utc
        } else {
            TimeBasis::DeviceLocal
        },
        kind: if args.photo {
            ContentKind::Photo
        } else {
            ContentKind::Video
        },
        channels: match &args.channels {
            Some(list) => ChannelSelection::Explicit(list.0.clone()),
            None => ChannelSelection::Discover {
                max_channel: args.max_channel,
            },
        },
        concurrency: usize::from(args.concurrent),
    };
    request.validate()?;
    let engine_config = config.engine_config()?;

    let credentials = credentials()?;

    // Dropped at the end of this function, before the process exits.
    let _guard = init_logging(
        &config.log_dir,
        &device_label(&args.device),
        args.verbose,
        args.quiet,
    )?;

    info!(
        device = %request.device,
        start = %request.start,
        end = %request.end,
        kind = request.kind.as_str(),
        "Starting hikfetch"
    );

    let client = IsapiClient::new(&args.device, credentials, &engine_config)?;
    let orchestrator = Orchestrator::new(
        Arc::new(client),
        engine_config,
        ArchiveLayout::new(&config.output_dir),
    );

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing up");
            ctrl_c_token.cancel();
        }
    });

    let report = orchestrator.run(&request, token).await?;

    let format = OutputFormat::from_json_flag(args.json);
    print_report(&report, format, &mut std::io::stdout().lock())?;

    let code = exit_code(&report);
    match code {
        EXIT_INTERRUPTED => warn!("Run interrupted before every channel finished"),
        EXIT_PARTIAL => {
            let totals = report.totals();
            warn!(
                "{} of {} channels failed",
                totals.failed_channels, totals.channels
            );
        }
        _ => info!("Run complete"),
    }
    Ok(code)
}
