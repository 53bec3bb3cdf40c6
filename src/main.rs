use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use nl_sql::config::{AppConfig, CliArgs};
use nl_sql::db::catalog::DuckDbCatalog;
use nl_sql::db::db_pool::build_pool;
use nl_sql::db::executor::QueryExecutor;
use nl_sql::db::schema_manager::SchemaIntrospector;
use nl_sql::pipeline::Pipeline;
use nl_sql::util::logging::init_tracing;
use nl_sql::web;
use nl_sql::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Initialize logging
    init_tracing(args.log_json);

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("Initializing DuckDB connection pool");
    let pool = build_pool(&config.database)?;

    let catalog = DuckDbCatalog::new(pool.clone(), &config.database.schema_name);
    let introspector = SchemaIntrospector::new(
        Arc::new(catalog),
        config.pipeline.schema_cache_ttl(),
        config.pipeline.metadata_timeout(),
    );

    // Initialize the language model
    info!("Initializing LLM backend: {}", config.llm.backend);
    let model = nl_sql::llm::connect(&config.llm)?;
    let model_id = model.model_id().to_string();

    let executor = QueryExecutor::new(pool, config.pipeline.execution_timeout());
    let pipeline = Pipeline::new(introspector.clone(), model, executor, &config);

    // Warm the schema cache
    info!("Initializing schema cache");
    if let Err(e) = introspector.get_schema().await {
        warn!("Failed to initialize schema cache: {}", e);
        // Continue anyway, it will be loaded on the first request
    }

    let app_state = Arc::new(AppState::new(
        config.clone(),
        pipeline,
        introspector,
        &model_id,
    ));

    // Start the web server
    info!("Starting nl-sql server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
