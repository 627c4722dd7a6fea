use clap::Parser;

/// Signed-claim resolver: hosts operator/account/activation JWTs for a
/// broker fleet, propagates updates over NATS, and syncs against peers.
#[derive(Parser, Debug)]
#[command(name = "claimsrv", version)]
pub struct Cli {
    /// Path to a TOML config file. Config values load first; any flag below
    /// overrides the matching field.
    #[arg(short = 'c', long = "config")]
    pub config: Option<String>,

    /// Directory backing the claim store.
    #[arg(long = "dir")]
    pub dir: Option<String>,

    /// NATS server URL(s), comma-separated.
    #[arg(long = "nats")]
    pub nats: Option<String>,

    /// Path to a NATS user credentials file.
    #[arg(long = "creds")]
    pub creds: Option<String>,

    /// Primary resolver URL to bootstrap from at startup.
    #[arg(long = "primary")]
    pub primary: Option<String>,

    /// HTTP listen address, `host:port`.
    #[arg(long = "hp")]
    pub hp: Option<String>,

    /// Debug-level logging.
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    /// Verbose (trace-level) logging.
    #[arg(short = 'V', long = "verbose")]
    pub verbose: bool,

    /// TLS certificate for the HTTP listener.
    #[arg(long = "tls-cert")]
    pub tls_cert: Option<String>,

    /// TLS private key for the HTTP listener.
    #[arg(long = "tls-key")]
    pub tls_key: Option<String>,

    /// CA bundle used to validate the NATS server and primary resolver.
    #[arg(long = "tls-ca")]
    pub tls_ca: Option<String>,
}
