use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use clap::Parser;
use eyre::Context;
use spool::{Pool, PoolConfig, common};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Hammer a connection pool with echo round trips
#[derive(Parser, Debug)]
struct Args {
    /// Connections created up front
    #[arg(long, default_value_t = 2)]
    initial: usize,
    /// Creation cap
    #[arg(long, default_value_t = 4)]
    max: usize,
    #[arg(long, default_value_t = 8)]
    workers: usize,
    /// Round trips per worker
    #[arg(long, default_value_t = 16)]
    rounds: usize,
    /// Consecutive exhausted borrows a worker tolerates before giving up
    #[arg(long, default_value_t = 200)]
    max_backoffs: usize,
    /// Echo server to dial; a local one is started if omitted
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    common::initialize_logging();
    let args = Args::parse();

    let addr = match args.addr {
        Some(addr) => addr,
        None => spawn_echo_server().await?,
    };
    info!(%addr, "using echo server");

    let config = PoolConfig::new(args.initial, args.max);
    let pool = tokio::task::spawn_blocking(move || {
        Pool::with_config(config, move || TcpStream::connect(addr))
    })
    .await?
    .wrap_err("creating connection pool")?;

    let mut workers = JoinSet::new();
    for worker in 0..args.workers {
        let pool = pool.clone();
        let (rounds, max_backoffs) = (args.rounds, args.max_backoffs);
        workers.spawn_blocking(move || run_worker(worker, &pool, rounds, max_backoffs));
    }

    let mut echoed = 0;
    while let Some(result) = workers.join_next().await {
        echoed += result.wrap_err("worker panicked")??;
    }

    info!(echoed, status = ?pool.status(), "all workers finished");
    pool.close();
    Ok(())
}

const BACKOFF: Duration = Duration::from_millis(5);

fn run_worker(
    worker: usize,
    pool: &Pool<TcpStream>,
    rounds: usize,
    max_backoffs: usize,
) -> eyre::Result<usize> {
    let mut done = 0;
    let mut backoffs = 0;
    while done < rounds {
        let mut conn = match pool.get() {
            Ok(conn) => {
                backoffs = 0;
                conn
            }
            // the creation cap never frees up, so an exhausted pool may stay that way
            Err(e) if e.is_exhausted() && backoffs < max_backoffs => {
                backoffs += 1;
                thread::sleep(BACKOFF);
                continue;
            }
            Err(e) => return Err(e).wrap_err("borrowing connection"),
        };

        let msg = format!("worker {worker} round {done}\n");
        let mut buf = vec![0u8; msg.len()];
        let result = conn
            .write_all(msg.as_bytes())
            .and_then(|()| conn.read_exact(&mut buf));
        if let Err(e) = result {
            conn.mark_unusable();
            return Err(e).wrap_err("echo round trip");
        }
        if buf != msg.as_bytes() {
            conn.mark_unusable();
            eyre::bail!("echo mismatch on worker {worker}");
        }

        conn.close().wrap_err("returning connection")?;
        done += 1;
    }
    debug!(worker, "worker finished");
    Ok(done)
}

async fn spawn_echo_server() -> eyre::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .wrap_err("binding echo server")?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "echo server accept failed");
                    continue;
                }
            };
            debug!(%peer, "echo connection accepted");
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                if let Err(e) = tokio::io::copy(&mut rd, &mut wr).await {
                    debug!(%peer, error = %e, "echo connection ended");
                }
            });
        }
    });
    Ok(addr)
}
