use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "encoder-server", about = "Encrypts MQTT telemetry into the datastore")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the encoder until Ctrl+C.
    Serve(ServeArgs),
}

#[derive(Args, Clone)]
pub struct ServeArgs {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "encoder.toml", env = "ENCODER_CONFIG")]
    pub config: String,

    /// Passphrase sealing recipient keys at rest; overrides the file.
    #[arg(long, env = "ENCODER_ENCRYPTION_PASSWORD", hide_env_values = true)]
    pub encryption_password: Option<String>,

    /// Listen address of the RPC surface; overrides the file.
    #[arg(long, env = "ENCODER_LISTEN_ADDR")]
    pub listen_addr: Option<String>,
}

impl std::fmt::Debug for ServeArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeArgs")
            .field("config", &self.config)
            .field("encryption_password", &self.encryption_password.as_ref().map(|_| "<redacted>"))
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}
