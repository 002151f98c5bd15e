use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use switchyard::{
    adapters::{
        FileRouteLocator, HttpClientAdapter, HttpHandler, HttpRouteLocator,
        InMemoryRateLimitStore, RedisRateLimitStore,
    },
    config::{
        ConfigValidator,
        loader::load_config,
        models::{GatewayConfig, RateLimiterStoreConfig},
    },
    core::{Collaborators, GatewayHandler, Registry, RouteTable},
    ports::{http_client::HttpClient, rate_limit_store::RateLimitStore, route_locator::RouteLocator},
    tracing_setup,
    utils::GracefulShutdown,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "switchyard.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "switchyard.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "switchyard.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "switchyard.yaml")]
        config: String,
        /// Fetch route definitions from this URL instead of the config file
        #[clap(long)]
        routes_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config, routes_url }) => serve(&config, routes_url).await,
        None => serve(&args.config, None).await,
    }
}

async fn create_rate_limit_store(
    config: &RateLimiterStoreConfig,
    shutdown: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<Arc<dyn RateLimitStore>> {
    match config {
        RateLimiterStoreConfig::InMemory { idle_timeout } => {
            let store = Arc::new(InMemoryRateLimitStore::new());
            let sweeper = store.clone();
            let idle_timeout = *idle_timeout;
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(idle_timeout);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            let evicted = sweeper.evict_idle(idle_timeout).await;
                            if evicted > 0 {
                                tracing::debug!(evicted, remaining = sweeper.len(), "Evicted idle rate limit buckets");
                            }
                        }
                    }
                }
            }));
            tracing::info!(idle_timeout = ?idle_timeout, "Using in-memory rate limit store");
            Ok(store)
        }
        RateLimiterStoreConfig::Redis { url } => Ok(Arc::new(
            RedisRateLimitStore::connect(url)
                .await
                .context("Failed to create Redis rate limit store")?,
        )),
    }
}

fn create_route_locator(
    config_path: &str,
    routes_url: Option<String>,
    config: &GatewayConfig,
) -> Result<Arc<dyn RouteLocator>> {
    match routes_url {
        Some(url) => {
            tracing::info!(url = %url, "Loading routes from remote source");
            Ok(Arc::new(HttpRouteLocator::new(url, config.refresh.poll_interval)))
        }
        None => Ok(Arc::new(
            FileRouteLocator::new(config_path).context("Failed to watch route file")?,
        )),
    }
}

async fn serve(config_path: &str, routes_url: Option<String>) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    tracing_setup::init_from_config(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    tracing::info!("Loaded configuration from {config_path}");

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let shutdown = graceful_shutdown.token();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let store = create_rate_limit_store(&config.rate_limiter, &shutdown, &mut background).await?;
    let registry = Arc::new(Registry::with_defaults(Collaborators::new(store)));

    ConfigValidator::new(&registry)
        .validate(&config)
        .map_err(|e| eyre!("{e}"))
        .context("Invalid configuration")?;

    let locator = create_route_locator(config_path, routes_url, &config)?;
    let routes = Arc::new(RouteTable::new(locator, registry));
    routes
        .refresh()
        .await
        .context("Failed to build initial routes")?;
    for route in routes.snapshot().routes() {
        tracing::info!(
            route = route.id(),
            uri = %route.uri(),
            order = route.order(),
            predicate = %route.predicate().describe(),
            "Configured route"
        );
    }
    if let Some(watcher) = routes.spawn_watcher(config.refresh.debounce, shutdown.clone()) {
        background.push(watcher);
    }

    let http_client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new(&config.http_client));
    let gateway = Arc::new(GatewayHandler::new(routes, http_client));
    let http_handler = Arc::new(HttpHandler::new(gateway, config.management.clone()));

    let app = HttpHandler::router(http_handler).layer(TraceLayer::new_for_http());

    let signal_handler = graceful_shutdown.clone();
    tokio::spawn(async move { signal_handler.run_signal_handler().await });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("switchyard gateway starting on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await
    .context("Server error")?;

    // The server can also stop without a signal; make sure tasks see it.
    graceful_shutdown.trigger_shutdown();
    graceful_shutdown.drain(background).await;
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    // Validation never contacts the Redis store; buckets are irrelevant here.
    let registry = Registry::with_defaults(Collaborators::in_memory());
    match ConfigValidator::new(&registry).validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Routes: {}", config.routes.len());
            println!("   • Default Filters: {}", config.default_filters.len());
            println!(
                "   • Management: {}",
                if config.management.enabled {
                    config.management.base_path.as_str()
                } else {
                    "disabled"
                }
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all route URIs start with http:// or https://");
            println!("   • Check predicate and filter names against the built-in list");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Durations use units such as '100ms', '5s' or '1m'");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# switchyard gateway configuration

# The address to listen on
listen_addr: "127.0.0.1:8080"

logging:
  level: info
  json: false

http_client:
  connect_timeout: 5s
  response_timeout: 30s

# Route changes in this file are picked up after the debounce period
refresh:
  debounce: 500ms

rate_limiter:
  type: in_memory
  idle_timeout: 10m
  # type: redis
  # url: "redis://127.0.0.1:6379/"

management:
  enabled: true
  base_path: /actuator/gateway

# Applied to every route, before the route's own filters
default_filters:
  - name: add_response_header
    args: { name: X-Gateway, value: switchyard }

routes:
  # Example Route: proxy /api/** to a backend, retrying idempotent calls
  - id: api
    uri: "http://localhost:3000"
    predicates:
      - name: path
        args: { patterns: ["/api/**"] }
    filters:
      - name: retry
        args:
          max_attempts: 3
          statuses: [5xx]
          backoff: { first_backoff: 10ms, max_backoff: 100ms, factor: 2.0 }

  # Example Route: circuit breaker with a local fallback
  # - id: orders
  #   uri: "http://localhost:3001"
  #   predicates:
  #     - name: path
  #       args: { patterns: ["/orders/{id}"] }
  #   filters:
  #     - name: circuit_breaker
  #       args: { fallback_uri: "forward:/fallback/orders/{id}", status_codes: [500, 503] }

  # Example Route: rate limited by client address
  # - id: search
  #   uri: "http://localhost:3002"
  #   predicates:
  #     - name: path
  #       args: { patterns: ["/search"] }
  #   filters:
  #     - name: request_rate_limiter
  #       args: { replenish_rate: 10, burst_capacity: 20, key_resolver: { type: remote_addr } }
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'switchyard serve --config {config_path}' to start the server");
    Ok(())
}
