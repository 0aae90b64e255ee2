//! Interactive operator console.
//!
//! Hosts any number of DHT nodes in one process and drives them from a
//! line-oriented prompt. `help` lists the commands; `add`/`get` act through
//! the first live node, `node connect` through the most recently started
//! one. A failing command prints its error and the console keeps running.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use xorbit::{Config, Key, Node, PeerResponse};

#[derive(Parser, Debug)]
#[command(name = "xorbit")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface new nodes bind to (port is always ephemeral).
    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Seed endpoints handed to every started node.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Bucket size / replication factor.
    #[arg(long)]
    k: Option<usize>,

    /// Lookup parallelism.
    #[arg(long)]
    alpha: Option<usize>,

    /// Cache-tier capacity in entries.
    #[arg(long)]
    store_size: Option<usize>,
}

/// One console-managed node. `node` is `None` once stopped or failed.
struct Slot {
    node: Option<Node>,
    error: Option<String>,
}

struct Console {
    config: Config,
    ip: IpAddr,
    seeds: Vec<SocketAddr>,
    slots: Vec<Slot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::default();
    if let Some(k) = args.k {
        config.k = k;
    }
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    if let Some(store_size) = args.store_size {
        config.store_size = store_size;
    }

    let mut console = Console {
        config,
        ip: args.ip,
        seeds: args.bootstrap,
        slots: Vec::new(),
    };

    println!("xorbit console; type 'help' for commands");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        if let Err(e) = console.run(line).await {
            println!("error: {e:#}");
        }
    }

    for slot in &console.slots {
        if let Some(node) = &slot.node {
            node.stop().await;
        }
    }
    Ok(())
}

impl Console {
    async fn run(&mut self, line: &str) -> Result<()> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        match command {
            "help" => {
                print_help();
                Ok(())
            }
            "check" => {
                self.check();
                Ok(())
            }
            "node" => {
                let sub = parts.next().context("usage: node <start|list|connect|stop|stat|refresh> …")?;
                self.node_command(sub, parts).await
            }
            "add" => {
                let value = rest_of(line, "add").context("usage: add <value>")?;
                let node = self.first_live()?;
                match node.put(value.as_bytes().to_vec()).await {
                    PeerResponse::Success { success_count, .. } => {
                        println!(
                            "stored as {} on {} peer(s)",
                            Key::compute(value.as_bytes()),
                            success_count
                        );
                        Ok(())
                    }
                    PeerResponse::Failure { kind, message } => {
                        anyhow::bail!("add failed ({kind:?}): {message}")
                    }
                }
            }
            "get" => {
                let hex = parts.next().context("usage: get <hex-key>")?;
                let key = Key::from_hex(hex).context("invalid key (need 64 hex characters)")?;
                let node = self.first_live()?;
                match node.get(key).await {
                    PeerResponse::Success { data: Some(data), success_count } => {
                        println!(
                            "value ({} peer(s) visited): {}",
                            success_count,
                            String::from_utf8_lossy(&data)
                        );
                        Ok(())
                    }
                    PeerResponse::Success { data: None, success_count } => {
                        println!("not found ({success_count} peer(s) visited)");
                        Ok(())
                    }
                    PeerResponse::Failure { kind, message } => {
                        anyhow::bail!("get failed ({kind:?}): {message}")
                    }
                }
            }
            "hash" => {
                let value = rest_of(line, "hash").context("usage: hash <value>")?;
                println!("{}", Key::compute(value.as_bytes()));
                Ok(())
            }
            other => anyhow::bail!("unknown command '{other}'; try 'help'"),
        }
    }

    async fn node_command(
        &mut self,
        sub: &str,
        mut parts: std::str::SplitWhitespace<'_>,
    ) -> Result<()> {
        match sub {
            "start" => {
                let bind = SocketAddr::new(self.ip, 0);
                match Node::start(self.config.clone(), bind, self.seeds.clone()).await {
                    Ok(node) => {
                        println!("node {} started: {}", self.slots.len(), node.peer());
                        self.slots.push(Slot {
                            node: Some(node),
                            error: None,
                        });
                    }
                    Err(e) => {
                        println!("node {} failed to start: {e:#}", self.slots.len());
                        self.slots.push(Slot {
                            node: None,
                            error: Some(format!("{e:#}")),
                        });
                    }
                }
                Ok(())
            }
            "list" => {
                if self.slots.is_empty() {
                    println!("no nodes");
                }
                for (i, slot) in self.slots.iter().enumerate() {
                    match &slot.node {
                        Some(node) => println!("#{i} {} running", node.peer()),
                        None => println!(
                            "#{i} terminated{}",
                            slot.error
                                .as_deref()
                                .map(|e| format!(" ({e})"))
                                .unwrap_or_default()
                        ),
                    }
                }
                Ok(())
            }
            "connect" => {
                let ip: IpAddr = parts
                    .next()
                    .context("usage: node connect <ip> <port>")?
                    .parse()
                    .context("invalid ip")?;
                let port: u16 = parts
                    .next()
                    .context("usage: node connect <ip> <port>")?
                    .parse()
                    .context("invalid port")?;
                let node = self.last_live()?;
                let peers = node.connect(SocketAddr::new(ip, port)).await?;
                println!("connected; seed reported {peers} peer(s)");
                Ok(())
            }
            "stop" => {
                let index = self.parse_index(parts.next())?;
                let slot = &mut self.slots[index];
                match slot.node.take() {
                    Some(node) => {
                        node.stop().await;
                        println!("node {index} stopped");
                        Ok(())
                    }
                    None => anyhow::bail!("node {index} is already terminated"),
                }
            }
            "stat" => {
                let index = self.parse_index(parts.next())?;
                let slot = &self.slots[index];
                match &slot.node {
                    Some(node) => {
                        println!("{}", node.stats().await);
                        Ok(())
                    }
                    None => anyhow::bail!("node {index} is terminated"),
                }
            }
            "refresh" => {
                let index = self.parse_index(parts.next())?;
                let slot = &self.slots[index];
                match &slot.node {
                    Some(node) => match node.refresh(None).await {
                        PeerResponse::Success { success_count, .. } => {
                            println!("refreshed; visited {success_count} peer(s)");
                            Ok(())
                        }
                        PeerResponse::Failure { kind, message } => {
                            anyhow::bail!("refresh failed ({kind:?}): {message}")
                        }
                    },
                    None => anyhow::bail!("node {index} is terminated"),
                }
            }
            other => anyhow::bail!("unknown node command '{other}'"),
        }
    }

    fn check(&self) {
        if self.slots.is_empty() {
            println!("no nodes started");
            return;
        }
        for (i, slot) in self.slots.iter().enumerate() {
            match &slot.node {
                Some(node) if node.is_alive() => println!("#{i} {} ok", node.peer()),
                Some(node) => println!("#{i} {} terminated", node.peer()),
                None => println!(
                    "#{i} terminated{}",
                    slot.error
                        .as_deref()
                        .map(|e| format!(" ({e})"))
                        .unwrap_or_default()
                ),
            }
        }
    }

    fn first_live(&self) -> Result<&Node> {
        self.slots
            .iter()
            .filter_map(|s| s.node.as_ref())
            .find(|n| n.is_alive())
            .context("no running node; use 'node start'")
    }

    fn last_live(&self) -> Result<&Node> {
        self.slots
            .iter()
            .rev()
            .filter_map(|s| s.node.as_ref())
            .find(|n| n.is_alive())
            .context("no running node; use 'node start'")
    }

    fn parse_index(&self, arg: Option<&str>) -> Result<usize> {
        let index: usize = arg
            .context("missing node index")?
            .parse()
            .context("node index must be a number")?;
        if index >= self.slots.len() {
            anyhow::bail!("no node #{index}");
        }
        Ok(index)
    }
}

/// Everything after the command word, preserving inner whitespace.
fn rest_of<'a>(line: &'a str, command: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(command)?.trim();
    (!rest.is_empty()).then_some(rest)
}

fn print_help() {
    println!(
        "commands:
  help                       this text
  quit | exit                stop all nodes and leave
  check                      liveness of every node
  node start                 start a node on an ephemeral port
  node list                  enumerate nodes
  node connect <ip> <port>   bootstrap the newest node to a peer
  node stop <n>              stop node n
  node stat <n>              statistics for node n
  node refresh <n>           self-refresh node n
  add <value>                store a value via the first node
  get <hex-key>              fetch a value via the first node
  hash <value>               print the content key of a value"
    );
}
