use clap::{Parser, Subcommand};
use hive::{
    catalog::write_job_list,
    config::{ConfigErrors, CoordinatorConfig, References, WorkerConfig},
    distributed::{
        server::{DispatchServer, ServerOptions},
        worker::{run_workers, WorkerOptions},
    },
    executors::Executors,
    observe::init_tracing,
    sync::{store::JobStateStore, SharedStore},
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version)]
#[command(about = "Distribute simulation jobs to pulling workers")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host the coordinator and serve jobs until all of them are done
    Serve {
        /// Coordinator config file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the port of the configured listen address
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run worker loops pulling jobs from a coordinator
    Work {
        /// Worker config file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the coordinator address (host:port)
        #[arg(long)]
        server: Option<String>,

        /// Override the number of worker loops on this host
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Discover all inputs and report the job count without serving
    Check {
        /// Coordinator config file (YAML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write the flat job list used by batch submission helpers
    Joblist {
        /// Coordinator config file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Output file, defaults to `job_list` from the config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Commands::Serve { config, port } => serve(config, port),
        Commands::Work {
            config,
            server,
            threads,
        } => work(config, server, threads),
        Commands::Check { config } => check(config),
        Commands::Joblist { config, output } => joblist(config, output),
    };

    match result {
        Ok(()) => {
            info!(".Fin.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            eprintln!("hive: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_coordinator(path: PathBuf) -> Result<CoordinatorConfig, ConfigErrors> {
    let config = CoordinatorConfig::load(&path)?;
    init_tracing(config.log_file.as_deref())?;

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight);
    }

    Ok(config)
}

fn serve(path: PathBuf, port: Option<u16>) -> Result<(), ConfigErrors> {
    let mut config = load_coordinator(path)?;
    if let Some(port) = port {
        let host = config
            .listen
            .rsplit_once(':')
            .map(|(host, _)| host.to_owned())
            .unwrap_or_else(|| config.listen.clone());
        config.listen = format!("{host}:{port}");
    }

    info!(">>> Starting new experiment");

    let catalog = config.catalog()?;
    if let Some(job_list) = &config.job_list {
        write_job_list(job_list, &config.collect_jobs(References::AbsolutePaths)?)?;
    }
    info!(
        "Generated job idents: {}",
        catalog
            .iter()
            .map(|(ident, _)| ident.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );

    let store = JobStateStore::new(catalog, config.job_timeout(), config.shuffle_seed);
    let options = ServerOptions {
        monitor_period: config.monitor_period(),
        read_timeout: (config.read_timeout_secs > 0).then(|| config.read_timeout()),
    };

    // a coordinator that can not listen is a fatal startup error
    let server =
        DispatchServer::bind(config.listen.as_str(), SharedStore::new(store), options)
            .unwrap_or_log();
    server.run().unwrap_or_log();

    Ok(())
}

fn work(
    path: PathBuf,
    server: Option<String>,
    threads: Option<usize>,
) -> Result<(), ConfigErrors> {
    let mut config = WorkerConfig::load(&path)?;
    if let Some(server) = server {
        config.server = server;
    }
    if let Some(threads) = threads {
        config.threads = threads;
    }

    init_tracing(config.log_file.as_deref())?;
    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight);
    }

    let options = WorkerOptions {
        server: config.server.clone(),
        output_dir: config.output_dir.clone(),
        sleep: config.sleep(),
        pause: config.pause(),
    };
    let executor = Arc::new(Executors::load(&config));

    info!("Waiting for workers to return ...");
    let reports =
        run_workers(options, config.threads, config.stagger(), executor).unwrap_or_log();

    let executed: usize = reports.iter().map(|report| report.executed).sum();
    let discarded: usize = reports.iter().map(|report| report.discarded).sum();
    info!("Workers executed {executed} jobs, {discarded} results could not be delivered");

    Ok(())
}

fn check(path: PathBuf) -> Result<(), ConfigErrors> {
    let config = load_coordinator(path)?;
    let catalog = config.catalog()?;

    info!("Setup test finished with {} jobs!", catalog.len());

    Ok(())
}

fn joblist(path: PathBuf, output: Option<PathBuf>) -> Result<(), ConfigErrors> {
    let config = load_coordinator(path)?;
    let output = output
        .or_else(|| config.job_list.clone())
        .unwrap_or_else(|| PathBuf::from("joblist.csv"));

    let jobs = config.collect_jobs(References::AbsolutePaths)?;
    let count = write_job_list(&output, &jobs)?;
    info!("Saved {count} jobs to {}", output.to_string_lossy());

    Ok(())
}
