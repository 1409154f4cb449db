use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use cloudplay_protocol::IceConfig;

use crate::capture::CaptureArea;

pub const DEFAULT_BROKER_URL: &str = "http://127.0.0.1:50501";
pub const DEFAULT_MEDIA_ADDR: &str = "127.0.0.1:5004";
pub const DEFAULT_CAPTURE_AREA: &str = "1920x1080+0+0";
pub const DEFAULT_POLL_MS: u64 = 500;

const HELP: &str = "\
cloudplay-agent - Cloudplay game-host agent

USAGE:
    cloudplay-agent --host-id <ID> [OPTIONS]

OPTIONS:
    --broker-url <URL>           Broker gRPC endpoint [default: http://127.0.0.1:50501]
    --host-id <ID>               Identity this host was allocated under (or CLOUDPLAY_HOST_ID)
    --media-addr <ADDR>          Listen address for the local streamer [default: 127.0.0.1:5004]
    --stun <URL>                 STUN server, repeatable [default: Google public STUN]
    --turn <URL>                 TURN server, repeatable
    --turn-username <NAME>       TURN username
    --turn-credential <SECRET>   TURN credential (or CLOUDPLAY_TURN_CREDENTIAL)
    --watch                      Use WatchSession instead of polling FindSession
    --capture-area <WxH+X+Y>     Initial capture area [default: 1920x1080+0+0]
    --poll-ms <MS>               Poll interval for session and offer [default: 500]
    --launch                     Start the game's command once the player connects
    -V, --version                Print version and exit
    -h, --help                   Print this help and exit";

#[derive(Debug, Clone)]
pub struct Args {
    pub broker_url: String,
    pub host_id: String,
    pub media_addr: SocketAddr,
    pub ice: IceConfig,
    pub watch: bool,
    pub capture_area: CaptureArea,
    pub poll: Duration,
    pub launch_game: bool,
}

#[derive(Debug)]
pub enum Invocation {
    Run(Args),
    Help,
    Version,
}

pub fn help_text() -> &'static str {
    HELP
}

/// Parse the process arguments (program name excluded), falling back to
/// environment variables for the host id and TURN credential.
pub fn parse_args<I>(args: I) -> anyhow::Result<Invocation>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut broker_url = DEFAULT_BROKER_URL.to_string();
    let mut host_id = None;
    let mut media_addr = DEFAULT_MEDIA_ADDR.to_string();
    let mut stun_urls = Vec::new();
    let mut turn_urls = Vec::new();
    let mut turn_username = None;
    let mut turn_credential = None;
    let mut watch = false;
    let mut capture_area = DEFAULT_CAPTURE_AREA.to_string();
    let mut poll_ms = DEFAULT_POLL_MS;
    let mut launch_game = false;

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().with_context(|| format!("Missing {flag} value"));
        match arg.as_str() {
            "-V" | "--version" => return Ok(Invocation::Version),
            "-h" | "--help" => return Ok(Invocation::Help),
            "--broker-url" => broker_url = value("--broker-url")?,
            "--host-id" => host_id = Some(value("--host-id")?),
            "--media-addr" => media_addr = value("--media-addr")?,
            "--stun" => stun_urls.push(value("--stun")?),
            "--turn" => turn_urls.push(value("--turn")?),
            "--turn-username" => turn_username = Some(value("--turn-username")?),
            "--turn-credential" => turn_credential = Some(value("--turn-credential")?),
            "--watch" => watch = true,
            "--launch" => launch_game = true,
            "--capture-area" => capture_area = value("--capture-area")?,
            "--poll-ms" => {
                poll_ms = value("--poll-ms")?
                    .parse()
                    .context("Invalid --poll-ms value")?;
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
    }

    let host_id = host_id
        .or_else(|| std::env::var("CLOUDPLAY_HOST_ID").ok())
        .filter(|h| !h.trim().is_empty())
        .context("--host-id is required")?;
    // Prefer the env var for secrets; argv is visible in /proc.
    if turn_credential.is_none() {
        turn_credential = std::env::var("CLOUDPLAY_TURN_CREDENTIAL").ok();
    }
    anyhow::ensure!(poll_ms > 0, "--poll-ms must be greater than zero");

    let mut ice = IceConfig::default();
    if !stun_urls.is_empty() {
        ice.stun_urls = stun_urls;
    }
    ice.turn_urls = turn_urls;
    ice.turn_username = turn_username;
    ice.turn_credential = turn_credential;

    Ok(Invocation::Run(Args {
        broker_url,
        host_id,
        media_addr: media_addr
            .parse()
            .with_context(|| format!("Invalid --media-addr value: {media_addr}"))?,
        ice,
        watch,
        capture_area: capture_area
            .parse::<CaptureArea>()
            .context("Invalid --capture-area value")?
            .fit_for_h264()?,
        poll: Duration::from_millis(poll_ms),
        launch_game,
    }))
}
