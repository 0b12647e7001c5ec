//! Small demo server.
//!
//! ```text
//! cargo run --example hello
//! curl localhost:8080/hello
//! curl -d 'name=trellis' localhost:8080/user/greet
//! ```

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use trellis::chain::handler;
use trellis::security::Cors;
use trellis::{Engine, EngineConfig, Error, RouteTable, Server, StatusCode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut routes = RouteTable::new();
    routes.add_middleware(Cors::new().into_handler());

    routes.get("/hello", |ctx| {
        ctx.write_str("Hello, World!")?;
        Ok(())
    });

    routes.get("/private", |ctx| {
        if ctx.header("authorization").is_none() {
            ctx.set_status(StatusCode::UNAUTHORIZED);
            ctx.commit_now();
            ctx.abort();
            return Ok(());
        }
        ctx.write_str("secret")?;
        Ok(())
    });

    routes.prefix_fill_routes(
        "user",
        &[
            (
                "PostGreet",
                handler(|ctx| {
                    let name = ctx.form_value("name").unwrap_or("stranger").to_owned();
                    ctx.write_str(&format!("hi {name}"))?;
                    Ok(())
                }),
            ),
            (
                "GetFail",
                handler(|_ctx| Err(Error::msg("this route always fails"))),
            ),
        ],
    );

    routes.set_not_found(|ctx| {
        ctx.set_status(StatusCode::NOT_FOUND);
        ctx.write_str("nothing here")?;
        Ok(())
    });

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default().compression(true),
    };
    let engine = Arc::new(Engine::new(config, routes));

    let server = Server::bind("127.0.0.1:8080").await?;
    server.serve(engine).await?;
    Ok(())
}
