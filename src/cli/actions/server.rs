use crate::api;
use crate::broker::Broker;
use crate::cli::actions::Action;
use crate::config::Config;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Handle the server action: build the broker and serve until it idles.
///
/// # Errors
/// Returns an error if the configuration cannot be loaded, the secret key
/// cannot be seeded, or the listener cannot bind.
pub async fn handle(action: Action) -> Result<()> {
    let Action::Server {
        port,
        config,
        local_ssh,
        no_tls,
    } = action;

    let config = match config {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    let broker = Arc::new(
        Broker::builder(config)
            .login_loopback(local_ssh)
            .cookie_insecure(no_tls)
            .build()
            .context("failed to initialize the authentication broker")?,
    );

    let app = api::router(Arc::clone(&broker));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;
    info!("Listening on [::]:{}", port);

    let mut idling = broker.subscribe_idling();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = idling.recv().await;
            info!("broker is idle, shutting down");
        })
        .await?;

    Ok(())
}
