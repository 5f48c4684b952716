use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use codemash::compiler::Compiler;
use codemash::config::{CliArgs, Command, Config, load_config};
use codemash::mash::{LatestSource, MashReport, Masher, WATCH_PERIOD, gather_units, watch};
use codemash::scheduler::Scheduler;
use codemash::session::Submission;
use codemash::source::SourceUnit;
use codemash::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    match cli.command {
        Command::Serve {
            config_path,
            watch,
            main,
        } => serve(config_path.as_deref(), watch, main).await,
        Command::Run {
            files,
            entry,
            deadline_ms,
            config_path,
        } => run(&files, entry, deadline_ms, config_path.as_deref()).await,
        Command::Mash {
            dir,
            main,
            output,
            watch: true,
        } => mash_watch(dir, main, output).await,
        Command::Mash {
            dir, main, output, ..
        } => mash(&dir, &main, output.as_deref()),
    }
}

async fn serve(
    config_path: Option<&str>,
    watch_dir: Option<PathBuf>,
    main_file: String,
) -> anyhow::Result<()> {
    let Config {
        server: server_config,
        engine: engine_config,
    } = load_config(config_path).context("Failed to load configuration")?;

    if engine_config.slots == 0 {
        bail!("The number of slots must not be 0");
    }

    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let (scheduler, mut workers) = Scheduler::start(engine_config, shutdown_token.clone());
    let latest = Arc::new(LatestSource::default());
    let server = build_server(server_config, scheduler.clone(), latest.clone())
        .context("Failed to build server")?;

    if let Some(dir) = watch_dir {
        let (scheduler, token) = (scheduler.clone(), shutdown_token.clone());
        tokio::spawn(async move {
            let watched = watch(
                dir,
                main_file,
                scheduler.masher(),
                &latest,
                WATCH_PERIOD,
                token,
                |_| {},
            )
            .await;
            if let Err(e) = watched {
                log::error!("Watcher stopped: {e:#}");
            }
        });
    }

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {:?}", e);
            } else {
                log::error!("Worker handle finished with error: {:?}", e);
            }
        }
    }

    // 4. Nobody will pick up what is still queued
    scheduler.drain();

    log::info!("Shutdown complete");
    Ok(())
}

async fn run(
    files: &[PathBuf],
    entry: Option<String>,
    deadline_ms: Option<u64>,
    config_path: Option<&str>,
) -> anyhow::Result<()> {
    let config = load_config(config_path).context("Failed to load configuration")?;

    let mut units = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        units.push(SourceUnit::library(name, text));
    }
    let entry = match entry {
        Some(entry) => entry,
        None => units
            .first()
            .map(|u| u.name.clone())
            .context("no source files given")?,
    };
    let Some(entry_unit) = units.iter_mut().find(|u| u.name == entry) else {
        bail!("entry unit '{entry}' is not among the given files");
    };
    entry_unit.entry_point = true;

    let token = CancellationToken::new();
    let (scheduler, mut workers) = Scheduler::start(config.engine, token.clone());
    let id = scheduler.submit(Submission {
        units,
        deadline_ms,
        arguments: Vec::new(),
    });
    let verdict = scheduler.await_result(id).await?;
    println!("{}", serde_json::to_string_pretty(&verdict)?);

    token.cancel();
    while workers.join_next().await.is_some() {}
    Ok(())
}

fn mash(dir: &Path, main_file: &str, output: Option<&Path>) -> anyhow::Result<()> {
    let units = gather_units(dir, main_file)?;
    let report = codemash::mash::mash(&Compiler::default(), &units)?;

    for diagnostic in &report.diagnostics {
        eprintln!("{diagnostic}");
    }
    if !report.compiles {
        bail!("coalesced source of {} does not compile", dir.display());
    }

    match output {
        Some(path) => {
            std::fs::write(path, &report.source)
                .with_context(|| format!("cannot write {}", path.display()))?;
            log::info!("Mashed {} unit(s) into {}", units.len(), path.display());
        }
        None => print!("{}", report.source),
    }
    Ok(())
}

async fn mash_watch(dir: PathBuf, main_file: String, output: Option<PathBuf>) -> anyhow::Result<()> {
    let masher = Masher::new(Arc::new(Compiler::default()), 1);
    let latest = LatestSource::default();
    let token = CancellationToken::new();

    let publish = |report: &MashReport| match &output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &report.source) {
                log::error!("Cannot write {}: {e}", path.display());
            }
        }
        None => print!("{}", report.source),
    };
    let watcher = watch(dir, main_file, &masher, &latest, WATCH_PERIOD, token.clone(), publish);

    tokio::select! {
        res = watcher => res,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, stopping the watcher");
            token.cancel();
            Ok(())
        }
    }
}
