use clap::Parser;

/// Signaling relay for huddle meeting rooms.
#[derive(Parser, Debug)]
#[command(name = "huddle-relay", version, about)]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "HUDDLE_RELAY_PORT")]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "HUDDLE_RELAY_BIND")]
    pub bind: Option<String>,
}
