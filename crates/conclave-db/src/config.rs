use std::env;

/// Where the shared store lives.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
}

impl DbConfig {
    /// Environment variable consulted by [`DbConfig::from_env`].
    pub const URL_VAR: &str = "CONCLAVE_DATABASE_URL";

    /// Fallback when neither an override nor the environment supplies a URL.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/conclave";

    /// Wrap an explicit URL (tests, programmatic construction).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Resolve the URL with the usual precedence: an explicit override
    /// (typically a `--database-url` flag) beats the environment, which
    /// beats the compiled default.
    pub fn resolve(override_url: Option<&str>) -> Self {
        let database_url = override_url
            .map(str::to_owned)
            .or_else(|| env::var(Self::URL_VAR).ok())
            .unwrap_or_else(|| Self::DEFAULT_URL.to_owned());
        Self { database_url }
    }

    /// Read the URL from the environment alone.
    pub fn from_env() -> Self {
        Self::resolve(None)
    }

    /// The database-name component of the URL, if it has one.
    ///
    /// Query parameters (`?sslmode=...`) are not part of the name, and a
    /// URL that stops at the host (`postgresql://host:5432`) has none.
    pub fn database_name(&self) -> Option<&str> {
        let (_, tail) = self.database_url.rsplit_once('/')?;
        let name = tail.split('?').next().unwrap_or(tail);
        if name.is_empty() || name.contains(':') || name.contains('@') {
            None
        } else {
            Some(name)
        }
    }

    /// The same server, pointed at the `postgres` maintenance database.
    ///
    /// `CREATE DATABASE` must be issued from a database that already
    /// exists, so bootstrap paths connect here first. Query parameters of
    /// the target database are dropped; maintenance work does not need
    /// them.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rsplit_once('/') {
            Some((server, tail))
                if !tail.is_empty() && !tail.contains(':') && !tail.contains('@') =>
            {
                format!("{server}/postgres")
            }
            _ => format!("{}/postgres", self.database_url.trim_end_matches('/')),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
