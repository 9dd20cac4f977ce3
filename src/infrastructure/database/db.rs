use mongodb::{
    bson::doc,
    options::{ClientOptions, IndexOptions, ServerApi, ServerApiVersion},
    Client, Collection, Database, IndexModel,
};
use tracing::info;

use crate::{
    ci::pipeline::{JobRecord, RepoConfig, SessionDetail},
    error::AppError,
};

pub const SESSIONS_COLLECTION: &str = "sessions";
pub const REPO_CONFIGS_COLLECTION: &str = "repo_configs";
pub const JOBS_HISTORY_COLLECTION: &str = "jobs_history";

#[derive(Clone)]
pub struct DatabaseManager {
    pub client: Client,
    pub database: Database,
}

impl DatabaseManager {
    pub async fn new(mongodb_uri: &str, database_name: &str) -> Result<Self, AppError> {
        if mongodb_uri.trim().is_empty() {
            return Err(AppError::DatabaseError(
                "MONGO_DB_URL is not set".to_string(),
            ));
        }

        info!("🔄 Connecting to MongoDB...");

        let mut client_options = ClientOptions::parse(mongodb_uri)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to parse MongoDB URI: {}", e)))?;

        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let client = Client::with_options(client_options).map_err(|e| {
            AppError::DatabaseError(format!("Failed to create MongoDB client: {}", e))
        })?;

        client
            .database("admin")
            .run_command(doc! {"ping": 1}, None)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to ping MongoDB: {}", e)))?;

        info!("✅ Successfully connected to MongoDB!");

        let database = client.database(database_name);
        let manager = DatabaseManager { client, database };
        manager.create_indexes().await?;

        Ok(manager)
    }

    pub fn sessions(&self) -> Collection<SessionDetail> {
        self.database
            .collection::<SessionDetail>(SESSIONS_COLLECTION)
    }

    pub fn repo_configs(&self) -> Collection<RepoConfig> {
        self.database
            .collection::<RepoConfig>(REPO_CONFIGS_COLLECTION)
    }

    pub fn jobs_history(&self) -> Collection<JobRecord> {
        self.database
            .collection::<JobRecord>(JOBS_HISTORY_COLLECTION)
    }

    /// Unique keys for every collection.
    async fn create_indexes(&self) -> Result<(), AppError> {
        let unique = |name: &str| {
            IndexOptions::builder()
                .unique(true)
                .name(name.to_string())
                .build()
        };

        self.sessions()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1 })
                    .options(unique("session_user_idx"))
                    .build(),
                None,
            )
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to create session index: {}", e)))?;

        self.repo_configs()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "repo_name": 1, "repo_url": 1, "branch": 1 })
                    .options(unique("repo_key_idx"))
                    .build(),
                None,
            )
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to create repo index: {}", e)))?;

        self.jobs_history()
            .create_index(
                IndexModel::builder()
                    .keys(doc! {
                        "repo_url": 1,
                        "pipeline_name": 1,
                        "run_number": 1,
                        "log.job_name": 1
                    })
                    .options(unique("job_run_idx"))
                    .build(),
                None,
            )
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to create job index: {}", e)))?;

        info!("📇 MongoDB indexes ready");
        Ok(())
    }
}
