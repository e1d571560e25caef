//! OIDC Gateway - identity-token authenticated tunnels
//!
//! Accepts `CONNECT` tunnels and a fixed API relay from GitHub Actions
//! workflows that present a verified OIDC token for the allowed repository.

use anyhow::{Context, Result};
use clap::Parser;
use oidc_gateway_auth::{
    Algorithm, ClaimEquals, ClaimPolicy, JwksCache, JwksOptions, TokenVerifier, VerifierConfig,
    DEFAULT_JWKS_URL,
};
use oidc_gateway_auth::policy::{DEFAULT_AUDIENCE, DEFAULT_REPOSITORY};
use oidc_gateway_server::{GatewayConfig, GatewayServer, ServerTimeouts, TlsConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// OIDC gateway - tunnels and API relay for GitHub Actions workflows
#[derive(Parser, Debug)]
#[command(name = "oidc-gateway")]
#[command(about = "Authenticating CONNECT gateway for GitHub Actions OIDC tokens")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
OIDC Gateway accepts CONNECT tunnels and a fixed API relay from callers that
present a GitHub Actions OIDC token in the Gateway-Authorization header.
Tokens are verified against the provider's published signing keys and must
name the allowed repository and audience.

EXAMPLES:
  # Start with defaults (listen on :8000)
  oidc-gateway

  # Allow a different repository and audience
  oidc-gateway --repository my-org/deploy --audience api://Deploy

  # Require an extra claim and use a config file
  oidc-gateway --config gateway.yaml --require ref=refs/heads/main

ENVIRONMENT VARIABLES:
  OIDC_GATEWAY_LISTEN      Listen address (host:port)
  OIDC_GATEWAY_JWKS_URL    Signing key set URL
  OIDC_GATEWAY_REPOSITORY  Allowed repository (owner/name)
  OIDC_GATEWAY_AUDIENCE    Required token audience
"#)]
struct Args {
    /// Address to listen on (e.g., 0.0.0.0:8000)
    #[arg(long, env = "OIDC_GATEWAY_LISTEN")]
    listen: Option<String>,

    /// Request header carrying the identity token
    #[arg(long, env = "OIDC_GATEWAY_TOKEN_HEADER")]
    token_header: Option<String>,

    /// URL of the identity provider's JWKS document
    #[arg(long, env = "OIDC_GATEWAY_JWKS_URL")]
    jwks_url: Option<String>,

    /// Seconds between signing key refreshes
    #[arg(long, env = "OIDC_GATEWAY_JWKS_REFRESH")]
    jwks_refresh: Option<u64>,

    /// Timeout in seconds for one signing key fetch
    #[arg(long, env = "OIDC_GATEWAY_JWKS_TIMEOUT")]
    jwks_timeout: Option<u64>,

    /// Accepted token signing algorithms (comma separated)
    #[arg(long, env = "OIDC_GATEWAY_ALGORITHMS", value_delimiter = ',')]
    algorithms: Option<Vec<String>>,

    /// Clock skew in seconds tolerated on exp, nbf and iat
    #[arg(long, env = "OIDC_GATEWAY_LEEWAY")]
    leeway: Option<u64>,

    /// Required token issuer (not checked when unset)
    #[arg(long, env = "OIDC_GATEWAY_ISSUER")]
    issuer: Option<String>,

    /// Repository allowed to use the gateway (owner/name)
    #[arg(long, env = "OIDC_GATEWAY_REPOSITORY")]
    repository: Option<String>,

    /// Audience the token must be issued for
    #[arg(long, env = "OIDC_GATEWAY_AUDIENCE")]
    audience: Option<String>,

    /// Additional required claim as claim=value (repeatable)
    #[arg(long = "require", value_name = "CLAIM=VALUE")]
    require: Vec<String>,

    /// Timeout in seconds for connecting to a tunnel target
    #[arg(long, env = "OIDC_GATEWAY_DIAL_TIMEOUT")]
    dial_timeout: Option<u64>,

    /// Timeout in seconds for receiving request headers
    #[arg(long, env = "OIDC_GATEWAY_READ_TIMEOUT")]
    read_timeout: Option<u64>,

    /// Timeout in seconds for the relay's upstream exchange
    #[arg(long, env = "OIDC_GATEWAY_WRITE_TIMEOUT")]
    write_timeout: Option<u64>,

    /// Upstream URL fetched by GET /apiExample
    #[arg(long, env = "OIDC_GATEWAY_RELAY_UPSTREAM")]
    relay_upstream: Option<String>,

    /// TLS certificate (PEM); enables HTTPS together with --tls-key
    #[arg(long, env = "OIDC_GATEWAY_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "OIDC_GATEWAY_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OIDC_GATEWAY_LOG_LEVEL")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    listen: Option<String>,
    token_header: Option<String>,
    jwks: JwksFileConfig,
    token: TokenFileConfig,
    policy: PolicyFileConfig,
    timeouts: TimeoutFileConfig,
    relay: RelayFileConfig,
    tls: Option<TlsFileConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct JwksFileConfig {
    url: Option<String>,
    refresh_interval_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TokenFileConfig {
    algorithms: Option<Vec<String>>,
    leeway_secs: Option<u64>,
    issuer: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PolicyFileConfig {
    repository: Option<String>,
    audience: Option<String>,
    /// Extra claims that must equal the given values
    require: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TimeoutFileConfig {
    read_secs: Option<u64>,
    write_secs: Option<u64>,
    dial_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RelayFileConfig {
    upstream: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TlsFileConfig {
    cert: PathBuf,
    key: PathBuf,
}

/// Fully resolved process configuration
#[derive(Debug)]
struct Settings {
    gateway: GatewayConfig,
    jwks_url: String,
    jwks: JwksOptions,
    verifier: VerifierConfig,
    repository: String,
    audience: String,
    required_claims: BTreeMap<String, String>,
}

impl Settings {
    fn policy(&self) -> ClaimPolicy {
        self.required_claims.iter().fold(
            ClaimPolicy::for_repository(&self.repository, &self.audience),
            |policy, (claim, value)| policy.require(ClaimEquals::new(claim, value)),
        )
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

fn seconds(value: u64, name: &str) -> Result<Duration> {
    if value == 0 {
        anyhow::bail!("{} must be greater than zero", name);
    }
    Ok(Duration::from_secs(value))
}

fn parse_algorithms(names: &[String]) -> Result<Vec<Algorithm>> {
    if names.is_empty() {
        anyhow::bail!("At least one signing algorithm must be allowed");
    }
    names
        .iter()
        .map(|name| {
            Algorithm::from_str(name.trim())
                .map_err(|_| anyhow::anyhow!("Unknown signing algorithm: '{}'", name))
        })
        .collect()
}

/// Parse `claim=value`
fn parse_requirement(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((claim, value)) if !claim.trim().is_empty() => {
            Ok((claim.trim().to_string(), value.to_string()))
        }
        _ => anyhow::bail!(
            "Invalid claim requirement: '{}' (expected format: claim=value)",
            raw
        ),
    }
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_settings(args: Args) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };
    merge_settings(args, file)
}

fn merge_settings(args: Args, file: ConfigFile) -> Result<Settings> {
    let defaults = GatewayConfig::default();
    let default_timeouts = ServerTimeouts::default();
    let default_jwks = JwksOptions::default();
    let default_verifier = VerifierConfig::default();

    let bind_addr = match args.listen.or(file.listen) {
        Some(listen) => SocketAddr::from_str(&listen)
            .with_context(|| format!("Invalid listen address: '{}'", listen))?,
        None => defaults.bind_addr,
    };

    let timeouts = ServerTimeouts {
        read: match args.read_timeout.or(file.timeouts.read_secs) {
            Some(secs) => seconds(secs, "Read timeout")?,
            None => default_timeouts.read,
        },
        write: match args.write_timeout.or(file.timeouts.write_secs) {
            Some(secs) => seconds(secs, "Write timeout")?,
            None => default_timeouts.write,
        },
        dial: match args.dial_timeout.or(file.timeouts.dial_secs) {
            Some(secs) => seconds(secs, "Dial timeout")?,
            None => default_timeouts.dial,
        },
    };

    let tls = match (args.tls_cert, args.tls_key) {
        (Some(cert_path), Some(key_path)) => Some(TlsConfig {
            cert_path,
            key_path,
        }),
        (None, None) => file.tls.map(|tls| TlsConfig {
            cert_path: tls.cert,
            key_path: tls.key,
        }),
        _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
    };

    let gateway = GatewayConfig {
        bind_addr,
        token_header: args
            .token_header
            .or(file.token_header)
            .unwrap_or(defaults.token_header),
        relay_upstream: args
            .relay_upstream
            .or(file.relay.upstream)
            .unwrap_or(defaults.relay_upstream),
        timeouts,
        tls,
    };

    let jwks = JwksOptions {
        refresh_interval: match args.jwks_refresh.or(file.jwks.refresh_interval_secs) {
            Some(secs) => seconds(secs, "Key refresh interval")?,
            None => default_jwks.refresh_interval,
        },
        request_timeout: match args.jwks_timeout.or(file.jwks.fetch_timeout_secs) {
            Some(secs) => seconds(secs, "Key fetch timeout")?,
            None => default_jwks.request_timeout,
        },
    };

    let verifier = VerifierConfig {
        algorithms: match args.algorithms.or(file.token.algorithms) {
            Some(names) => parse_algorithms(&names)?,
            None => default_verifier.algorithms,
        },
        leeway: args
            .leeway
            .or(file.token.leeway_secs)
            .unwrap_or(default_verifier.leeway),
        issuer: args.issuer.or(file.token.issuer),
    };

    let mut required_claims = file.policy.require;
    for raw in &args.require {
        let (claim, value) = parse_requirement(raw)?;
        required_claims.insert(claim, value);
    }

    Ok(Settings {
        gateway,
        jwks_url: args
            .jwks_url
            .or(file.jwks.url)
            .unwrap_or_else(|| DEFAULT_JWKS_URL.to_string()),
        jwks,
        verifier,
        repository: args
            .repository
            .or(file.policy.repository)
            .unwrap_or_else(|| DEFAULT_REPOSITORY.to_string()),
        audience: args
            .audience
            .or(file.policy.audience)
            .unwrap_or_else(|| DEFAULT_AUDIENCE.to_string()),
        required_claims,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    let settings = build_settings(args).context("Failed to build gateway configuration")?;
    let policy = settings.policy();

    info!("Listen address: {}", settings.gateway.bind_addr);
    info!("Signing keys: {}", settings.jwks_url);
    info!("Policy: {}", policy.names().join(", "));

    // Without signing keys no request can ever be authorized
    let jwks = Arc::new(
        JwksCache::fetch(settings.jwks_url.clone(), settings.jwks.clone())
            .await
            .with_context(|| format!("Failed to fetch signing keys from {}", settings.jwks_url))?,
    );
    info!("Loaded {} signing keys", jwks.snapshot().len());

    let refresh = jwks.spawn_refresh();
    let verifier = TokenVerifier::with_config(jwks, settings.verifier);

    let server = GatewayServer::from_config(settings.gateway, verifier, policy)
        .context("Failed to create gateway server")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };

    server.run(shutdown).await.context("Gateway server failed")?;

    refresh.stop();
    info!("Gateway stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["oidc-gateway"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = merge_settings(args(&[]), ConfigFile::default()).unwrap();

        assert_eq!(settings.gateway.bind_addr.to_string(), "0.0.0.0:8000");
        assert_eq!(settings.gateway.token_header, "Gateway-Authorization");
        assert_eq!(settings.jwks_url, DEFAULT_JWKS_URL);
        assert_eq!(settings.jwks.refresh_interval, Duration::from_secs(60));
        assert_eq!(settings.verifier.algorithms, vec![Algorithm::RS256]);
        assert_eq!(settings.repository, "octo-org/octo-repo");
        assert_eq!(settings.audience, "api://ActionsOIDCGateway");
        assert_eq!(
            settings.policy().names(),
            vec!["repository-equals", "aud-equals"]
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
listen: "127.0.0.1:9000"
policy:
  repository: file-org/file-repo
  audience: file-audience
  require:
    ref: refs/heads/main
timeouts:
  dial_secs: 2
"#,
        )
        .unwrap();

        let settings = merge_settings(
            args(&[
                "--repository",
                "cli-org/cli-repo",
                "--require",
                "ref=refs/heads/release",
                "--require",
                "environment=production",
            ]),
            file,
        )
        .unwrap();

        assert_eq!(settings.gateway.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(settings.gateway.timeouts.dial, Duration::from_secs(2));
        assert_eq!(settings.repository, "cli-org/cli-repo");
        assert_eq!(settings.audience, "file-audience");
        assert_eq!(
            settings.required_claims.get("ref").map(String::as_str),
            Some("refs/heads/release")
        );
        assert_eq!(
            settings.policy().names(),
            vec![
                "repository-equals",
                "aud-equals",
                "environment-equals",
                "ref-equals"
            ]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(merge_settings(args(&["--listen", "not-an-address"]), ConfigFile::default()).is_err());
        assert!(merge_settings(args(&["--read-timeout", "0"]), ConfigFile::default()).is_err());
        assert!(merge_settings(args(&["--algorithms", "RS999"]), ConfigFile::default()).is_err());
        assert!(merge_settings(args(&["--require", "=x"]), ConfigFile::default()).is_err());
        assert!(merge_settings(args(&["--tls-cert", "cert.pem"]), ConfigFile::default()).is_err());
    }

    #[test]
    fn test_algorithm_list() {
        let settings =
            merge_settings(args(&["--algorithms", "RS256,ES256"]), ConfigFile::default()).unwrap();
        assert_eq!(
            settings.verifier.algorithms,
            vec![Algorithm::RS256, Algorithm::ES256]
        );
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
token_header: X-Identity
jwks:
  url: http://127.0.0.1:1/jwks
  refresh_interval_secs: 300
tls:
  cert: /etc/gateway/cert.pem
  key: /etc/gateway/key.pem
"#
        )
        .unwrap();

        let path = file.path().to_path_buf();
        let settings = build_settings(args(&["--config", path.to_str().unwrap()])).unwrap();

        assert_eq!(settings.gateway.token_header, "X-Identity");
        assert_eq!(settings.jwks_url, "http://127.0.0.1:1/jwks");
        assert_eq!(settings.jwks.refresh_interval, Duration::from_secs(300));
        assert_eq!(
            settings.gateway.tls,
            Some(TlsConfig {
                cert_path: "/etc/gateway/cert.pem".into(),
                key_path: "/etc/gateway/key.pem".into(),
            })
        );
    }

    #[test]
    fn test_unknown_config_keys_rejected() {
        let parsed: Result<ConfigFile, _> = serde_yaml::from_str("listen_addr: \"0.0.0.0:1\"\n");
        assert!(parsed.is_err());
    }
}
