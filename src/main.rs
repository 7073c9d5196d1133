use anyhow::{Context, Result};
use std::sync::Arc;
use tokensync::api::{create_token_router, TokenAppState};
use tokensync::auth::{StaticAuthorizer, TokenAuthenticator};
use tokensync::config::Config;
use tokensync::directory::{Directory, RecordDirectory, User};
use tokensync::hashers::HashRegistry;
use tokensync::store::{ReadMode, SqliteRecordStore};
use tokensync::tokens::{SystemTokenStore, Token, TokenStore, WriteOptions};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokensync=info".into()),
        )
        .init();

    info!("Tokensync starting...");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        store = %config.store.path,
        listen = %config.api.listen,
        algorithm = %config.hashing.default_algorithm,
        "Configuration loaded"
    );

    let store = Arc::new(
        SqliteRecordStore::open(&config.store.path).context("Failed to open record store")?,
    );
    let directory = Arc::new(RecordDirectory::new(store.clone()));
    let hashers = HashRegistry::new(&config.hashing).context("Invalid hashing configuration")?;

    let system = Arc::new(SystemTokenStore::new(
        store.clone(),
        directory.clone(),
        hashers,
        config.tokens.clone(),
    ));
    let authorizer = Arc::new(StaticAuthorizer::new(config.api.administrators.clone()));

    // Issue a first administrator token so the API can be reached at all.
    if let Ok(admin) = std::env::var("TOKENSYNC_BOOTSTRAP_ADMIN") {
        if directory.get_user(&admin, ReadMode::Consistent).is_err() {
            directory
                .put_user(&User::new(&admin))
                .context("Failed to create bootstrap administrator")?;
        }
        authorizer.add_administrator(admin.clone());
        let mut token = Token::new(&admin);
        token.spec.description = "bootstrap".to_string();
        let token = system
            .create(token, WriteOptions::default())
            .context("Failed to issue bootstrap token")?;
        info!(user = %admin, token = %token.name, "Bootstrap token issued");
        println!("{}", token.status.bearer_token);
    }

    let state = TokenAppState {
        tokens: Arc::new(TokenStore::new(system.clone(), authorizer)),
        authenticator: Arc::new(TokenAuthenticator::new(system)),
    };
    let router = create_token_router(state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.api.listen))?;
    info!(listen = %config.api.listen, "Token API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Token API server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("Tokensync stopped");

    Ok(())
}
