use clap::{Args, Parser, Subcommand};
use transport_datachannel::{PeerConfig, DEFAULT_LABEL};

#[derive(Debug, Parser)]
#[command(
    name = "dc-peer",
    about = "Single data-channel chat with copy/paste signaling",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect two in-process peers and exchange a few messages.
    Loopback {
        /// Number of messages each side sends.
        #[arg(long, default_value_t = 3)]
        messages: usize,
        #[arg(long, default_value = DEFAULT_LABEL)]
        label: String,
    },
    /// Print an offer, read the answer from stdin, then chat over stdio.
    Offer {
        #[command(flatten)]
        peer: PeerArgs,
        #[arg(long, default_value = DEFAULT_LABEL)]
        label: String,
    },
    /// Read an offer from stdin, print the answer, then chat over stdio.
    Answer {
        #[command(flatten)]
        peer: PeerArgs,
    },
}

#[derive(Debug, Args)]
pub struct PeerArgs {
    /// STUN/TURN server URI; repeat for several. Defaults to public STUN.
    #[arg(
        long = "ice-server",
        env = "DATACHANNEL_ICE_SERVERS",
        value_delimiter = ','
    )]
    pub ice_servers: Vec<String>,
    /// Forward libdatachannel's own debug log to the tracing output.
    #[arg(long)]
    pub engine_log: bool,
}

impl PeerArgs {
    pub fn config(&self) -> PeerConfig {
        if self.ice_servers.is_empty() {
            return PeerConfig::from_env();
        }
        self.ice_servers
            .iter()
            .fold(PeerConfig::localhost(), |config, server| {
                config.with_ice_server(server.trim())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_ice_servers_are_kept_in_order() {
        let cli = Cli::parse_from([
            "dc-peer",
            "answer",
            "--ice-server",
            "stun:a.test:3478",
            "--ice-server",
            "turn:b.test:3478",
        ]);
        let Commands::Answer { peer } = cli.command else {
            panic!("expected answer subcommand");
        };
        assert_eq!(
            peer.config().ice_servers,
            vec!["stun:a.test:3478".to_string(), "turn:b.test:3478".to_string()]
        );
    }

    #[test]
    fn offer_label_defaults() {
        let cli = Cli::parse_from(["dc-peer", "offer", "--ice-server", "stun:a.test:1"]);
        let Commands::Offer { label, .. } = cli.command else {
            panic!("expected offer subcommand");
        };
        assert_eq!(label, DEFAULT_LABEL);
    }
}
