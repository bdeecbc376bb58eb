//! ShardKV server replica executable.
//!
//! Runs one replica of one group on top of an in-process consensus log in
//! which it is the primary, serving clerks and peer groups over TCP.

use std::fs;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{self, LevelFilter};
use shardkv::{
    logger_init, pf_error, pf_info, ExternalApi, GroupId, LocalLog,
    ReplicaConfigShardKv, ReplicaId, ShardKvError, ShardKvServer,
    StaticCtrler, TcpNetwork, INVALID_GID,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// ID of the group this replica belongs to.
    #[arg(short, long)]
    group: GroupId,

    /// Replica ID within the group.
    #[arg(short, long, default_value_t = 0)]
    replica: ReplicaId,

    /// Address to serve clerks and peer groups on.
    /// This port must be available at process launch.
    #[arg(short, long, default_value = "0.0.0.0:52700")]
    api_addr: SocketAddr,

    /// TOML file listing the configuration sequence.
    #[arg(long)]
    configs: String,

    /// Server replica configuration TOML string.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(ShardKvError)` on any error.
    fn sanitize(&self) -> Result<(), ShardKvError> {
        if self.group == INVALID_GID {
            Err(ShardKvError::msg(format!("invalid group {}", self.group)))
        } else if self.api_addr.port() <= 1024 {
            Err(ShardKvError::msg(format!(
                "invalid api_addr port {}",
                self.api_addr.port()
            )))
        } else if self.configs.is_empty() {
            Err(ShardKvError::msg("configs file path is empty"))
        } else if self.threads < 2 {
            Err(ShardKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }

    fn config_str(&self) -> Option<&str> {
        if self.config.is_empty() {
            None
        } else {
            Some(&self.config)
        }
    }
}

/// Actual main function of the server replica.
fn server_main() -> Result<(), ShardKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = ReplicaConfigShardKv::parse(args.config_str())?;
    let ctrler = Arc::new(StaticCtrler::from_toml(&fs::read_to_string(
        &args.configs,
    )?)?);

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("main"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replica")
            .build()?;

        // enter tokio runtime, setup the server replica, and wait until
        // terminated
        runtime.block_on(async move {
            let log = LocalLog::new();
            let (handle, rx_apply) = log.connect(args.replica)?;
            log.set_leader(Some(args.replica))?;

            let network = Arc::new(TcpNetwork::new(Duration::from_millis(
                config.rpc_timeout_ms,
            )));
            let server = ShardKvServer::new_and_setup(
                args.replica,
                args.group,
                Box::new(handle),
                rx_apply,
                ctrler,
                network,
                args.config_str(),
            )
            .await?;
            let api =
                ExternalApi::new_and_setup(server.clone(), args.api_addr)
                    .await?;

            tokio::select! {
                _ = rx_term.changed() => {
                    pf_info!("main"; "termination signal received");
                    server.kill();
                },
                _ = server.terminated() => {},
            }
            api.shutdown();
            server.join().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            match server.fatal_error() {
                Some(e) => Err(e),
                None => Ok::<(), ShardKvError>(()),
            }
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the server replica.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("main"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
