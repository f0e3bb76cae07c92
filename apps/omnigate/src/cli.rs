use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "omnigate", version, about = "Multi-tenant AI API gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Database DSN (required to bootstrap the rest of config).
    #[arg(long, env = "OMNIGATE_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "OMNIGATE_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "OMNIGATE_PORT")]
    pub port: Option<u16>,

    /// Admin key (plaintext). Stored as hash.
    #[arg(long, env = "OMNIGATE_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Redis URL for the usage stream and advisory locks.
    #[arg(long, env = "OMNIGATE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Optional outbound proxy for upstream egress.
    #[arg(long, env = "OMNIGATE_PROXY")]
    pub proxy: Option<String>,

    /// IANA timezone for cron schedules.
    #[arg(long, env = "OMNIGATE_TIMEZONE")]
    pub timezone: Option<String>,

    /// Fail settlement instead of recording zero cost when a required
    /// billing dimension is missing.
    #[arg(long, env = "OMNIGATE_STRICT_BILLING")]
    pub strict_billing: Option<bool>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the gateway (default).
    Serve,
    /// Emit a random secret suitable for OMNIGATE_ADMIN_KEY.
    GenerateSecret {
        #[arg(long, default_value_t = 32)]
        bytes: usize,
    },
}
