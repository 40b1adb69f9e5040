use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};

use reverb::config::ServerConfig;
use reverb::error::ServerError;
use reverb::executor::ExecutorPool;
use reverb::factory::{PooledSessionFactory, SessionFactory, SimpleSessionFactory};
use reverb::manager::SessionManager;

enum Outcome {
    Signal(&'static str),
    Manager(ServerError),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/echo_server.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: echo_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    std::process::exit(1);
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = ServerConfig::from_file(&conf_file)?;
    let manager_config = config.manager_config()?;

    // session_threads > 0 shards sessions across dedicated I/O threads;
    // otherwise everything shares the supervisor runtime.
    let mut pool = None;
    let factory: Arc<dyn SessionFactory> = if config.session_threads > 0 {
        let executors = ExecutorPool::new(config.session_threads)?;
        let factory = Arc::new(PooledSessionFactory::new(
            executors.handles(),
            config.recycled_session_count,
        ));
        pool = Some(executors);
        factory
    } else {
        Arc::new(SimpleSessionFactory::new(
            tokio::runtime::Handle::current(),
            config.recycled_session_count,
        ))
    };

    let manager = SessionManager::new(manager_config, factory);
    manager
        .start()
        .map_err(|err| anyhow::anyhow!("Cannot start session manager: {}", err))?;
    tracing::info!("[echo_server] [started] Echo Server Started");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let outcome = tokio::select! {
        _ = sigint.recv() => Outcome::Signal("SIGINT"),
        _ = sigterm.recv() => Outcome::Signal("SIGTERM"),
        _ = sigquit.recv() => Outcome::Signal("SIGQUIT"),
        reason = manager.wait() => Outcome::Manager(reason),
    };

    match &outcome {
        Outcome::Signal(name) => {
            tracing::info!("[echo_server] {} received, stopping", name);
        }
        Outcome::Manager(reason) => {
            tracing::info!("[echo_server] session manager finished: {}", reason);
        }
    }

    if let Err(err) = manager.stop().await {
        tracing::warn!("[echo_server] stop completed with: {}", err);
    }

    let stats = manager.stats();
    tracing::info!(
        "[echo_server] [stats] accepted={} shutdowned={} timed_out={} \
         errors={} out_of_work={} max_active={} recycled={}",
        stats.total_accepted,
        stats.active_shutdowned,
        stats.timed_out,
        stats.error_stopped,
        stats.out_of_work,
        stats.max_active,
        stats.recycled,
    );

    if let Some(mut executors) = pool {
        executors.shutdown();
    }

    match outcome {
        Outcome::Signal(_) => Ok(()),
        // A spent accept budget is a configured end, not a failure.
        Outcome::Manager(ServerError::OutOfWork) => Ok(()),
        Outcome::Manager(reason) => {
            anyhow::bail!("session manager terminated unexpectedly: {}", reason)
        }
    }
}
