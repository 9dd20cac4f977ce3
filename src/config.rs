use dotenv::dotenv;
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_DATABASE_NAME: &str = "cicd";
pub const DEFAULT_SEED_IMAGE: &str = "alpine:latest";
pub const DEFAULT_MAX_PARALLEL_JOBS: usize = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub mongodb_uri: String,
    pub mongodb_database: String,
    pub user_id: String,
    pub workspace_root: PathBuf,
    pub artifact_dir: PathBuf,
    pub max_parallel_jobs: usize,
    pub seed_image: String,
}

impl Config {
    /// Reads configuration from the process environment, loading `.env` first.
    pub fn init() -> Config {
        match dotenv() {
            Ok(path) => debug!("Loaded environment from {}", path.display()),
            Err(_) => debug!("No .env file found, using system environment variables"),
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Config
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = std::env::temp_dir().join("rustci");

        let mongodb_uri = lookup("MONGO_DB_URL").unwrap_or_default();
        let mongodb_database = lookup("MONGO_DB_NAME")
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_owned());

        let user_id = lookup("CICD_USER")
            .or_else(|| lookup("USER"))
            .filter(|user| !user.is_empty())
            .unwrap_or_else(|| "default".to_owned());

        let workspace_root = lookup("CICD_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| base.join("repos"));
        let artifact_dir = lookup("CICD_ARTIFACT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| base.join("artifacts"));

        let max_parallel_jobs = lookup("CICD_MAX_PARALLEL_JOBS")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_PARALLEL_JOBS)
            .max(1);

        let seed_image = lookup("CICD_SEED_IMAGE")
            .filter(|image| !image.is_empty())
            .unwrap_or_else(|| DEFAULT_SEED_IMAGE.to_owned());

        Config {
            mongodb_uri,
            mongodb_database,
            user_id,
            workspace_root,
            artifact_dir,
            max_parallel_jobs,
            seed_image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.mongodb_uri, "");
        assert_eq!(config.mongodb_database, DEFAULT_DATABASE_NAME);
        assert_eq!(config.user_id, "default");
        assert_eq!(config.max_parallel_jobs, DEFAULT_MAX_PARALLEL_JOBS);
        assert_eq!(config.seed_image, DEFAULT_SEED_IMAGE);
    }

    #[test]
    fn test_environment_values_are_used() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MONGO_DB_URL", "mongodb://localhost:27017"),
            ("MONGO_DB_NAME", "pipelines"),
            ("USER", "alice"),
            ("CICD_MAX_PARALLEL_JOBS", "0"),
            ("CICD_ARTIFACT_DIR", "/var/artifacts"),
        ]);
        let config = Config::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.mongodb_uri, "mongodb://localhost:27017");
        assert_eq!(config.mongodb_database, "pipelines");
        assert_eq!(config.user_id, "alice");
        assert_eq!(config.max_parallel_jobs, 1);
        assert_eq!(config.artifact_dir, PathBuf::from("/var/artifacts"));
    }
}
