use crate::config::AppConfig;
use crate::db::schema_manager::SchemaIntrospector;
use crate::pipeline::Pipeline;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Pipeline,
    /// Same cache the pipeline reads, exposed for `/api/schema` and `/api/status`
    pub introspector: SchemaIntrospector,
    pub model_id: String,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        pipeline: Pipeline,
        introspector: SchemaIntrospector,
        model_id: &str,
    ) -> Self {
        Self {
            config,
            pipeline,
            introspector,
            model_id: model_id.to_string(),
            startup_time: chrono::Utc::now(),
        }
    }
}
