use std::io::Read;

use clap::{Parser, Subcommand};
use gen3_reqwest::{AuthMiddleware, ResponseHistory};
use gen3_tokens::{
    claims,
    sources::{broker, BrokerTokenSource},
    AuthConfig, AuthSession, IdpName,
};
use reqwest_middleware::ClientBuilder;

#[derive(Debug, Parser)]
struct Opts {
    /// Credentials file, a short name under ~/.gen3, or idp://wts/<idp>
    #[arg(short = 'f', long)]
    refresh_file: Option<String>,

    /// Identity provider to request workspace tokens for
    #[arg(short, long, value_parser = parse_idp)]
    idp: Option<IdpName>,

    /// Workspace namespace, overriding $NAMESPACE
    #[arg(short, long)]
    namespace: Option<String>,

    /// Expected commons endpoint
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Base URL of the workspace token service, replacing the cluster address
    #[arg(long, env = "GEN3_WTS_URL")]
    broker_url: Option<reqwest::Url>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the commons endpoint named by the credentials
    Endpoint,
    /// Print a current access token
    AccessToken,
    /// Print the claims of a token read from a file, or `-` for stdin
    TokenDecode { file: String },
    /// Print the address of the workspace token service
    WtsEndpoint,
    /// List the identity providers the workspace token service supports
    WtsList,
    /// Send an authenticated GET to a path under the commons endpoint
    Curl { path: String },
}

fn parse_idp(value: &str) -> Result<IdpName, std::convert::Infallible> {
    Ok(IdpName::new(value.to_owned()))
}

impl Opts {
    fn config(&self) -> AuthConfig {
        let mut config = AuthConfig::from_env();
        if let Some(file) = &self.refresh_file {
            config = config.with_refresh_file(file.as_str());
        }
        if let Some(idp) = &self.idp {
            config = config.with_idp(idp.clone());
        }
        if let Some(namespace) = &self.namespace {
            config = config.with_namespace(namespace.as_str());
        }
        if let Some(endpoint) = &self.endpoint {
            config = config.with_endpoint(endpoint.as_str());
        }
        if let Some(url) = &self.broker_url {
            config = config.with_broker_url(url.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let config = opts.config();

    match &opts.command {
        Command::Endpoint => {
            let session = AuthSession::new(config).await?;
            println!("{}", session.endpoint());
        }
        Command::AccessToken => {
            let session = AuthSession::new(config).await?;
            let token = session.access_token().await?;
            tracing::debug!(
                token = format_args!("{:#?}", token),
                "obtained access token"
            );
            println!("{}", token.as_str());
        }
        Command::TokenDecode { file } => {
            let token = if file == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(file)?
            };
            let claims = claims::decode(&token)?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
        Command::WtsEndpoint => match config.broker_url() {
            Some(url) => println!("{}", url),
            None => println!("{}", broker::broker_url(config.namespace())),
        },
        Command::WtsList => {
            let client = reqwest::Client::new();
            let source = match config.broker_url() {
                Some(url) => BrokerTokenSource::new(client, url.clone(), None),
                None => BrokerTokenSource::for_namespace(client, config.namespace(), None)?,
            };
            let providers = source.list_idps().await?;
            println!("{}", serde_json::to_string_pretty(&providers)?);
        }
        Command::Curl { path } => {
            let session = AuthSession::new(config).await?;
            let url = format!(
                "{}/{}",
                session.endpoint(),
                path.trim_start_matches('/')
            );

            let client = ClientBuilder::new(reqwest::Client::new())
                .with(AuthMiddleware::new(session))
                .build();

            let resp = client.get(url).send().await?;
            for rejected in ResponseHistory::of(&resp) {
                tracing::warn!(
                    status = rejected.status().as_u16(),
                    "first attempt was rejected"
                );
            }

            eprintln!("{}", resp.status());
            println!("{}", resp.text().await?);
        }
    }

    Ok(())
}
