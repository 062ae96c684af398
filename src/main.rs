//! promptforge: prompt-to-asset pipeline.
//!
//! Turns a text prompt (or an existing image) into a texture, depth map,
//! normal map and mesh by routing each stage to a configured backend, then
//! exports the results into an output tree. Also serves the pipeline over
//! HTTP.

use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use promptforge::batch::{self, BatchFile, BatchSummary};
use promptforge::blender::BlenderRunner;
use promptforge::config::{
    BatchArgs, Cli, Command, Config, GenerateArgs, InitArgs, PipelineArgs, ProcessArgs, SegmentArgs,
    ServeArgs,
};
use promptforge::device::HardwareInfo;
use promptforge::export::{self, ExportOptions, ExportReport};
use promptforge::invoker::ollama::OllamaClient;
use promptforge::invoker::InvokerSet;
use promptforge::metrics::Metrics;
use promptforge::pipeline::Router;
use promptforge::request::OutputKind;
use promptforge::segment::{self, SegmentReport};
use promptforge::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    info!("promptforge v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::resolve(cli.config.as_deref())?;

    match cli.command {
        Command::Generate(args) => generate(config, args).await,
        Command::Process(args) => process(config, args).await,
        Command::Batch(args) => run_batch(config, args).await,
        Command::Segment(args) => run_segment(config, args).await,
        Command::Serve(args) => serve(config, args).await,
        Command::Models => models(config).await,
        Command::Info => show_info(&config, cli.config.as_deref()),
        Command::Init(args) => init(args),
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        "promptforge=debug,tower_http=debug"
    } else {
        "promptforge=info,tower_http=info"
    };

    // Logs go to stderr so that --json output on stdout stays parseable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Fold pipeline flags that change configuration into `config`.
fn apply_overrides(config: &mut Config, args: &PipelineArgs) {
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(backend) = args.backend {
        config.override_backend(backend);
    }
    if let Some(object) = args.object {
        config.blender.object = object;
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
}

fn build_pipeline(config: &Config, metrics: Option<Arc<Metrics>>) -> anyhow::Result<Router> {
    let invokers = InvokerSet::from_config(config)?;
    let mut router = Router::new(invokers).with_ollama(OllamaClient::new(&config.ollama)?);
    if let Some(metrics) = metrics {
        router = router.with_metrics(metrics);
    }

    info!(
        device = %config.resolved_device(),
        texture = %config.backends.texture,
        depth = %config.backends.depth,
        normal = %config.backends.normal,
        mesh = %config.backends.mesh,
        "Pipeline configured"
    );
    Ok(router)
}

fn export_options(config: &Config, args: &PipelineArgs) -> ExportOptions {
    ExportOptions {
        scene_script: args.scene_script,
        render: args.render,
        blender: config.blender.clone(),
    }
}

async fn generate(mut config: Config, args: GenerateArgs) -> anyhow::Result<()> {
    apply_overrides(&mut config, &args.pipeline);
    let router = build_pipeline(&config, None)?;

    let mut request = args.pipeline.build_request(
        args.prompt.clone(),
        &config.generation,
        &config.generation.kinds,
    );
    request.enhance_prompt = args.enhance;

    let options = export_options(&config, &args.pipeline);
    let mut reports = Vec::new();
    for request in batch::repeat_with_seeds(request, args.count) {
        let bundle = router.route(request).await?;
        let report = export::export(&bundle, &config.output_dir, &options).await?;
        if !args.pipeline.json {
            print_report(&report);
        }
        reports.push(report);
    }

    if args.pipeline.json {
        print_reports_json(&reports)?;
    }
    Ok(())
}

async fn process(mut config: Config, args: ProcessArgs) -> anyhow::Result<()> {
    if !args.input.is_file() {
        bail!("input image not found: {}", args.input.display());
    }
    apply_overrides(&mut config, &args.pipeline);
    let router = build_pipeline(&config, None)?;

    let request = args
        .pipeline
        .build_request(args.prompt.clone(), &config.generation, &[OutputKind::Depth])
        .with_source(&args.input);

    let bundle = router.route(request).await?;
    let report = export::export(&bundle, &config.output_dir, &export_options(&config, &args.pipeline)).await?;
    if args.pipeline.json {
        print_reports_json(std::slice::from_ref(&report))?;
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn run_batch(mut config: Config, args: BatchArgs) -> anyhow::Result<()> {
    if let Some(backend) = args.backend {
        config.override_backend(backend);
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }

    let file = BatchFile::load(&args.file)?;
    let base_dir = args.file.parent().unwrap_or(Path::new("."));
    let requests = file.requests(&config.generation, base_dir, args.count);
    info!(file = %args.file.display(), requests = requests.len(), "Batch loaded");

    let router = build_pipeline(&config, None)?;
    let options = ExportOptions {
        blender: config.blender.clone(),
        ..Default::default()
    };
    let summary = batch::run(&router, requests, &config.output_dir, &options).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    if !summary.all_succeeded() {
        bail!(
            "{} of {} batch requests failed",
            summary.failed,
            summary.items.len()
        );
    }
    Ok(())
}

async fn run_segment(mut config: Config, args: SegmentArgs) -> anyhow::Result<()> {
    if let Some(backend) = args.backend {
        config.segment.backend = backend;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    config.segment.clean &= !args.no_clean;
    config.segment.remove_background &= !args.mask_only;

    let report = segment::segment(
        &args.input,
        &config.output_dir,
        &config.segment,
        config.resolved_device(),
    )
    .await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_segment_report(&report);
    }
    Ok(())
}

async fn serve(mut config: Config, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(backend) = args.backend {
        config.override_backend(backend);
    }
    let listen_addr = args.listen.unwrap_or_else(|| config.server.listen.clone());

    let metrics = Arc::new(Metrics::new()?);
    let router = build_pipeline(&config, Some(metrics.clone()))?;
    let ollama = OllamaClient::new(&config.ollama)?;
    let config = Arc::new(config);

    let state = Arc::new(AppState::new(router, config.clone(), metrics).with_ollama(ollama));
    let app = server::build_router(state);

    info!(
        addr = %listen_addr,
        output_dir = %config.output_dir.display(),
        "Starting server"
    );

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn models(config: Config) -> anyhow::Result<()> {
    println!("Device: {}", config.resolved_device());
    println!("Stages:");
    for kind in OutputKind::ALL {
        println!(
            "  {:<8}{:<10}{}",
            kind.as_str(),
            config.backends.for_kind(kind).as_str(),
            config.models.for_kind(kind)
        );
    }

    let ollama = OllamaClient::new(&config.ollama)?;
    match ollama.list_models().await {
        Ok(tags) if tags.is_empty() => println!("Ollama ({}): no models pulled", config.ollama.url),
        Ok(tags) => {
            println!("Ollama ({}):", config.ollama.url);
            for tag in tags {
                let marker = if tag == ollama.model() { " *" } else { "" };
                println!("  {tag}{marker}");
            }
        }
        Err(e) => warn!(url = %config.ollama.url, error = %e, "Ollama not reachable"),
    }
    Ok(())
}

fn show_info(config: &Config, explicit: Option<&Path>) -> anyhow::Result<()> {
    let hw = HardwareInfo::detect();
    println!("promptforge {}", env!("CARGO_PKG_VERSION"));
    println!("Host:    {} {} ({} cpus)", hw.os, hw.arch, hw.cpus);
    println!("Apple silicon: {}", hw.apple_silicon);
    println!("CUDA:    {}", hw.cuda_available);
    println!(
        "Device:  {} (configured: {})",
        config.resolved_device(),
        config.device
    );

    let blender = BlenderRunner::from_config(&config.blender);
    let status = if blender.is_available() { "found" } else { "not found" };
    println!("Blender: {} ({status})", blender.executable().display());

    match Config::locate(explicit) {
        Some(path) => println!("Config:  {}", path.display()),
        None => println!("Config:  (defaults)"),
    }
    println!();
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

fn init(args: InitArgs) -> anyhow::Result<()> {
    if args.path.exists() && !args.force {
        bail!(
            "{} already exists (use --force to overwrite)",
            args.path.display()
        );
    }
    Config::default().save(&args.path)?;
    println!("Wrote {}", args.path.display());
    Ok(())
}

fn print_report(report: &ExportReport) {
    println!("{} ({})", report.stem, report.id);
    println!("  prompt: {}", report.prompt_used);
    for (kind, path) in &report.files {
        let ms = report.timings_ms.get(kind).copied().unwrap_or_default();
        println!("  {:<8}{} ({ms} ms)", kind.as_str(), path.display());
    }
    if let Some(script) = &report.scene_script {
        println!("  {:<8}{}", "scene", script.display());
    }
    if let Some(render) = &report.render {
        println!("  {:<8}{}", "render", render.display());
    }
    println!("  {:<8}{}", "manifest", report.manifest.display());
}

fn print_segment_report(report: &SegmentReport) {
    println!("{} ({}x{})", report.input.display(), report.width, report.height);
    println!("  {:<10}{}", "backend", report.backend);
    println!("  {:<10}{}", "mask", report.mask.display());
    if let Some(segmented) = &report.segmented {
        println!("  {:<10}{}", "cutout", segmented.display());
    }
    println!("  {:<10}{:.1}%", "coverage", report.coverage * 100.0);
}

fn print_reports_json(reports: &[ExportReport]) -> anyhow::Result<()> {
    let json = match reports {
        [single] => serde_json::to_string_pretty(single)?,
        many => serde_json::to_string_pretty(many)?,
    };
    println!("{json}");
    Ok(())
}

fn print_summary(summary: &BatchSummary) {
    for item in &summary.items {
        match (&item.report, &item.error) {
            (Some(report), _) => print_report(report),
            (None, Some(error)) => println!("[{}] {}: FAILED: {error}", item.index + 1, item.prompt),
            (None, None) => {}
        }
    }
    println!(
        "{} succeeded, {} failed",
        summary.succeeded, summary.failed
    );
}
