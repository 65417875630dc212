//! Greetings Server
//!
//! Serves the reference engine over `graphql-transport-ws`:
//!
//! ```text
//! cargo run -p gqlws-server --example greetings-server --features test-utils -- --port 4000
//! ```
//!
//! Try it with any graphql-ws client, e.g. `subscription { greetings }` or
//! `subscription { ticks }`. Pass `--token secret` to require
//! `{"token": "secret"}` in the `connection_init` payload.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Map, Value, json};
use tracing::info;

use gqlws_server::prelude::*;
use gqlws_server::test_utils::TestEngine;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "4000")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: std::net::IpAddr,

    /// Seconds a client may take to send connection_init (0 disables)
    #[arg(long, default_value = "3")]
    init_timeout: u64,

    /// Seconds between server pings (0 disables)
    #[arg(long, default_value = "12")]
    keep_alive: u64,

    /// Milliseconds between `ticks` subscription events
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Require this token in the connection_init payload
    #[arg(long)]
    token: Option<String>,
}

/// Logs the lifecycle and optionally checks a shared token
struct GreetingsHooks {
    token: Option<String>,
}

#[async_trait]
impl ServerHooks for GreetingsHooks {
    async fn on_connect(
        &self,
        ctx: &ConnectionContext,
        payload: Option<&Payload>,
    ) -> std::result::Result<ConnectDecision, HookError> {
        let offered = payload
            .and_then(|payload| payload.get("token"))
            .and_then(Value::as_str);

        if let Some(expected) = &self.token {
            if offered != Some(expected.as_str()) {
                return Ok(ConnectDecision::Reject("Invalid token".to_string()));
            }
        }

        info!("Client {} connected", ctx.connection_id());
        let mut state = Map::new();
        state.insert("connectedAt".to_string(), json!(ctx.connected_at().to_rfc3339()));
        Ok(ConnectDecision::Augment(state))
    }

    async fn on_subscribe(
        &self,
        ctx: &ConnectionContext,
        id: &str,
        payload: &SubscribePayload,
    ) -> std::result::Result<SubscribeDecision, HookError> {
        info!("Client {} started {}: {}", ctx.connection_id(), id, payload.query);
        Ok(SubscribeDecision::Continue)
    }

    async fn on_close(
        &self,
        ctx: &ConnectionContext,
        code: u16,
        reason: &str,
    ) -> std::result::Result<(), HookError> {
        info!("Client {} closed ({}: {})", ctx.connection_id(), code, reason);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let bind_address = SocketAddr::new(args.host, args.port);

    let server = GraphQLWsServer::builder()
        .engine(TestEngine::new().with_tick_interval(Duration::from_millis(args.tick_ms)))
        .hooks(GreetingsHooks { token: args.token })
        .bind_address(bind_address)
        .connection_init_wait_timeout(Duration::from_secs(args.init_timeout))
        .keep_alive_interval(Duration::from_secs(args.keep_alive))
        .build()?;

    info!("Starting greetings server on ws://{}/graphql", bind_address);
    server.run().await?;
    Ok(())
}
