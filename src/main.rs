mod server;

use std::net::SocketAddr;

use axum::http::HeaderName;
use byok_relay::{
    ByokRelay, CodecError, HttpCompletion, KeySource, PassphraseDerivation, RelayConfig,
    SecretCodec, UsageLimits,
    completion::{
        DEFAULT_COMPLETIONS_ENDPOINT, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_MODELS_ENDPOINT,
    },
    ledger::{DEFAULT_DAILY_LIMIT, DEFAULT_MONTHLY_LIMIT},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenvy::dotenv;
use rand::{RngCore, rngs::OsRng};

#[derive(Debug, Parser)]
#[command(author, version, about = "Bring-your-own-key chat relay")]
struct Cli {
    /// Default log filter when RUST_LOG is not set.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server.
    Serve(ServeArgs),
    /// Check that the configured encryption key can round-trip a value.
    Verify(KeyArgs),
    /// Print a fresh random 64-character hex encryption secret.
    Keygen,
}

#[derive(Args)]
struct KeyArgs {
    /// 64 hex characters (32 bytes) used directly as the AES-256 key.
    #[arg(long, env = "ENCRYPTION_SECRET", hide_env_values = true)]
    encryption_secret: Option<String>,

    /// Passphrase turned into a key with --passphrase-derivation.
    #[arg(long, env = "ENCRYPTION_PASSPHRASE", hide_env_values = true)]
    encryption_passphrase: Option<String>,

    #[arg(
        long,
        env = "PASSPHRASE_DERIVATION",
        value_enum,
        default_value_t = PassphraseDerivation::Sha256
    )]
    passphrase_derivation: PassphraseDerivation,
}

impl std::fmt::Debug for KeyArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("KeyArgs")
            .field("encryption_secret", &redact(&self.encryption_secret))
            .field("encryption_passphrase", &redact(&self.encryption_passphrase))
            .field("passphrase_derivation", &self.passphrase_derivation)
            .finish()
    }
}

impl KeyArgs {
    fn key_source(self) -> Result<KeySource, CodecError> {
        match (self.encryption_secret, self.encryption_passphrase) {
            (Some(hex), None) => Ok(KeySource::Hex(hex)),
            (None, Some(passphrase)) => Ok(KeySource::Passphrase {
                passphrase,
                derivation: self.passphrase_derivation,
            }),
            (Some(_), Some(_)) => Err(CodecError::Configuration(
                "set either ENCRYPTION_SECRET or ENCRYPTION_PASSPHRASE, not both".into(),
            )),
            (None, None) => Err(CodecError::Configuration(
                "ENCRYPTION_SECRET or ENCRYPTION_PASSPHRASE must be set".into(),
            )),
        }
    }
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[command(flatten)]
    key: KeyArgs,

    /// SQLite database path for keys, chats and usage counters.
    #[arg(long, env = "BYOK_DB_PATH", default_value = "byok_relay.db")]
    db_path: String,

    #[arg(long, env = "BYOK_BIND", default_value = "127.0.0.1")]
    bind: String,

    #[arg(long, env = "BYOK_PORT", default_value_t = 8080)]
    port: u16,

    /// OpenAI-compatible chat completion endpoint.
    #[arg(long, env = "UPSTREAM_ENDPOINT", default_value = DEFAULT_COMPLETIONS_ENDPOINT)]
    upstream_endpoint: String,

    #[arg(long, env = "UPSTREAM_MODELS_ENDPOINT", default_value = DEFAULT_MODELS_ENDPOINT)]
    models_endpoint: String,

    #[arg(long, env = "UPSTREAM_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long, env = "UPSTREAM_MAX_TOKENS", default_value_t = DEFAULT_MAX_TOKENS)]
    max_tokens: u32,

    #[arg(long, env = "DAILY_LIMIT", default_value_t = DEFAULT_DAILY_LIMIT)]
    daily_limit: i64,

    #[arg(long, env = "MONTHLY_LIMIT", default_value_t = DEFAULT_MONTHLY_LIMIT)]
    monthly_limit: i64,

    /// Earlier chat messages sent along as context.
    #[arg(long, env = "HISTORY_LIMIT", default_value_t = 20)]
    history_limit: usize,

    /// Header carrying the authenticated user id, set by the reverse proxy.
    #[arg(long, env = "FORWARD_AUTH_HEADER", default_value = "x-forwarded-user")]
    forward_auth_header: String,

    /// User id (as sent in the forward-auth header) allowed to manage other users' keys.
    #[arg(long, env = "FORWARD_AUTH_ADMIN_VALUE")]
    forward_auth_admin_value: Option<String>,

    #[arg(long, env = "FORWARD_AUTH_NICKNAME_HEADER")]
    forward_auth_nickname_header: Option<String>,

    /// Treat every request as this user. Local development only.
    #[arg(long, env = "DEV_USER")]
    dev_user: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    match cli.command {
        Command::Serve(args) => run_server(args).await?,
        Command::Verify(args) => {
            if let Err(err) = run_verify(args) {
                tracing::error!(error = %err, "encryption setup check failed");
                std::process::exit(1);
            }
        }
        Command::Keygen => {
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            println!("{}", hex::encode(key));
        }
    }

    Ok(())
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

/// Resolve the key and run the codec self-test.
fn build_codec(key: KeyArgs) -> Result<SecretCodec, CodecError> {
    let source = key.key_source()?;
    let codec = SecretCodec::from_source(&source)?;
    if !codec.verify_setup() {
        return Err(CodecError::Configuration(
            "encryption self-test did not round-trip".into(),
        ));
    }
    Ok(codec)
}

fn run_verify(args: KeyArgs) -> Result<(), CodecError> {
    build_codec(args)?;
    tracing::info!("encryption setup verified");
    println!("ok");
    Ok(())
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let codec = build_codec(args.key)?;
    let backend = HttpCompletion::new(&args.upstream_endpoint, &args.models_endpoint)?;
    let config = RelayConfig {
        limits: UsageLimits {
            daily: args.daily_limit,
            monthly: args.monthly_limit,
        },
        model: args.model,
        max_tokens: args.max_tokens,
        history_limit: args.history_limit,
    };

    let relay = ByokRelay::open(&args.db_path, codec, backend, config).await?;
    tracing::info!(
        db_path = %args.db_path,
        upstream = %args.upstream_endpoint,
        daily_limit = args.daily_limit,
        monthly_limit = args.monthly_limit,
        "relay initialised"
    );

    let forward_auth = server::ForwardAuthConfig::new(
        Some(HeaderName::from_bytes(args.forward_auth_header.as_bytes())?),
        args.forward_auth_admin_value,
        args.forward_auth_nickname_header
            .as_deref()
            .map(|name| HeaderName::from_bytes(name.as_bytes()))
            .transpose()?,
        args.dev_user,
    );
    if forward_auth.is_dev_mode() {
        tracing::warn!("dev user override active; forward-auth headers are ignored");
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    server::serve(addr, relay, forward_auth).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_args(secret: Option<&str>, passphrase: Option<&str>) -> KeyArgs {
        KeyArgs {
            encryption_secret: secret.map(str::to_owned),
            encryption_passphrase: passphrase.map(str::to_owned),
            passphrase_derivation: PassphraseDerivation::Sha256,
        }
    }

    #[test]
    fn key_source_requires_exactly_one_setting() {
        assert!(matches!(
            key_args(None, None).key_source(),
            Err(CodecError::Configuration(_))
        ));
        assert!(matches!(
            key_args(Some(&"a".repeat(64)), Some("pass")).key_source(),
            Err(CodecError::Configuration(_))
        ));
        assert!(matches!(
            key_args(Some(&"a".repeat(64)), None).key_source(),
            Ok(KeySource::Hex(_))
        ));
        assert!(matches!(
            key_args(None, Some("pass")).key_source(),
            Ok(KeySource::Passphrase { .. })
        ));
    }

    #[test]
    fn build_codec_rejects_short_hex_secret() {
        let err = build_codec(key_args(Some("abcd"), None)).unwrap_err();
        assert!(matches!(err, CodecError::Configuration(_)));
        assert!(!err.to_string().contains("abcd"));
    }

    #[test]
    fn build_codec_accepts_passphrase() {
        build_codec(key_args(None, Some("correct horse battery staple"))).unwrap();
    }

    #[test]
    fn cli_parses_serve_defaults() {
        let cli = Cli::try_parse_from(["byok-relay", "serve", "--encryption-passphrase", "p"])
            .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, 8080);
        assert_eq!(args.daily_limit, 100);
        assert_eq!(args.monthly_limit, 3000);
        assert_eq!(args.forward_auth_header, "x-forwarded-user");
    }
}
