use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use commendable_core::{Event, FilterMode, RecommendationsRequest, DEFAULT_LIKE_WEIGHT};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "commendable")]
#[command(about = "Send events to and query a commendable service")]
struct Cli {
    #[arg(long, global = true, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    ip: IpAddr,
    #[arg(long, global = true, default_value_t = 29191)]
    udp_port: u16,
    #[arg(long, global = true, default_value_t = 29192)]
    json_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record that a user likes an object.
    Like(LikeArgs),
    /// Record that a user viewed an object.
    View(ViewArgs),
    /// Drop an object from the active index.
    Deactivate(DeactivateArgs),
    Recommend(RecommendArgs),
    Views(UserArgs),
    Likes(UserArgs),
    Actives,
}

#[derive(Debug, Args)]
struct LikeArgs {
    #[arg(long)]
    uid: String,
    #[arg(long)]
    oid: String,
    #[arg(long, default_value_t = DEFAULT_LIKE_WEIGHT)]
    weight: f64,
    /// Do not mark the object active.
    #[arg(long)]
    dont_activate: bool,
}

#[derive(Debug, Args)]
struct ViewArgs {
    #[arg(long)]
    uid: String,
    #[arg(long)]
    oid: String,
}

#[derive(Debug, Args)]
struct DeactivateArgs {
    #[arg(long)]
    oid: String,
}

#[derive(Debug, Args)]
struct RecommendArgs {
    #[arg(long)]
    uid: String,
    #[arg(long, default_value_t = 16)]
    num: usize,
    /// Keep (`intersect`) or drop (`reject`) currently active objects.
    #[arg(long, value_enum)]
    actives: Option<FilterArg>,
    /// Keep (`intersect`) or drop (`reject`) objects the user viewed.
    #[arg(long, value_enum)]
    viewed: Option<FilterArg>,
}

#[derive(Debug, Args)]
struct UserArgs {
    #[arg(long)]
    uid: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FilterArg {
    Intersect,
    Reject,
}

impl FilterArg {
    fn mode(self) -> FilterMode {
        match self {
            Self::Intersect => FilterMode::Intersect,
            Self::Reject => FilterMode::Reject,
        }
    }
}

struct Endpoints {
    udp: SocketAddr,
    http: String,
}

impl Endpoints {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            udp: SocketAddr::new(cli.ip, cli.udp_port),
            http: format!("http://{}", SocketAddr::new(cli.ip, cli.json_port)),
        }
    }

    /// Fire one event datagram and echo what was sent.
    fn send(&self, event: &Event) -> Result<Value> {
        let message = serde_json::to_value(event.to_message())?;
        let payload = serde_json::to_vec(&message)?;
        let bind = if self.udp.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).context("failed to bind local udp socket")?;
        let sent = socket
            .send_to(&payload, self.udp)
            .with_context(|| format!("failed to send datagram to {}", self.udp))?;
        if sent != payload.len() {
            return Err(anyhow!("datagram truncated: sent {sent} of {} bytes", payload.len()));
        }
        Ok(message)
    }

    fn get(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.http);
        let response = ureq::get(&url).call().with_context(|| format!("GET {url} failed"))?;
        response.into_json().with_context(|| format!("GET {url} returned invalid JSON"))
    }

    fn post(&self, path: &str, body: &RecommendationsRequest) -> Result<Value> {
        let url = format!("{}{path}", self.http);
        let response =
            ureq::post(&url).send_json(body).with_context(|| format!("POST {url} failed"))?;
        response.into_json().with_context(|| format!("POST {url} returned invalid JSON"))
    }
}

fn emit_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let endpoints = Endpoints::from_cli(&cli);
    let output = match cli.command {
        Command::Like(args) => endpoints.send(&Event::Like {
            user: args.uid,
            object: args.oid,
            weight: args.weight,
            dont_activate: args.dont_activate,
        })?,
        Command::View(args) => endpoints.send(&Event::View { user: args.uid, object: args.oid })?,
        Command::Deactivate(args) => endpoints.send(&Event::Deactivate { object: args.oid })?,
        Command::Recommend(args) => {
            let request = RecommendationsRequest {
                num: args.num,
                actives: args.actives.map_or(FilterMode::None, FilterArg::mode),
                viewed: args.viewed.map_or(FilterMode::None, FilterArg::mode),
            };
            endpoints.post(&format!("/recommend/{}", args.uid), &request)?
        }
        Command::Views(args) => endpoints.get(&format!("/views/{}", args.uid))?,
        Command::Likes(args) => endpoints.get(&format!("/likes/{}", args.uid))?,
        Command::Actives => endpoints.get("/actives")?,
    };
    emit_json(&output)
}
