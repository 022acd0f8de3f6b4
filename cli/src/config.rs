use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    /// Base URL serving `version.json` and `products.jsonl.gz`.
    pub data_url: Option<String>,
}

impl Config {
    pub fn load(data_url: Option<String>) -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "foodscan").context("Could not determine home directory")?;
        Self::in_dir(proj_dirs.data_dir(), data_url)
    }

    pub fn in_dir(data_dir: &Path, data_url: Option<String>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let data_url = data_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        Ok(Config {
            db_path: data_dir.join("foodscan.db"),
            data_dir: data_dir.to_path_buf(),
            data_url,
        })
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)`.
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Include in requests: Authorization: Bearer {key}");
        Ok((key, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_dir_paths_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(
            &dir.path().join("nested"),
            Some("https://data.example.org/foodscan/ ".to_string()),
        )
        .unwrap();
        assert!(config.data_dir.is_dir());
        assert_eq!(config.db_path, dir.path().join("nested").join("foodscan.db"));
        assert_eq!(
            config.data_url.as_deref(),
            Some("https://data.example.org/foodscan")
        );

        let blank = Config::in_dir(dir.path(), Some("  ".to_string())).unwrap();
        assert!(blank.data_url.is_none());
    }

    #[test]
    fn test_api_key_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path(), None).unwrap();

        let (key, created) = config.load_or_create_api_key().unwrap();
        assert!(created);
        assert_eq!(key.len(), 64);

        let (again, created) = config.load_or_create_api_key().unwrap();
        assert!(!created);
        assert_eq!(again, key);
    }
}
