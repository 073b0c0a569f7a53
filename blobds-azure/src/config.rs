use serde::Deserialize;
use std::path::Path;

const DEFAULT_FETCH_CONCURRENCY: usize = 16;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct AzureConfig {
    pub account_name: String,
    /// Base64 shared key of the storage account.
    pub account_key: String,
    pub container: String,
    /// Overrides `https://{account_name}.blob.core.windows.net`, e.g. for a
    /// local emulator.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Maximum value downloads in flight during a query.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Requested listing page size; the service default when unset.
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_fetch_concurrency() -> usize {
    DEFAULT_FETCH_CONCURRENCY
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl AzureConfig {
    pub fn new(
        account_name: impl Into<String>,
        account_key: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            account_key: account_key.into(),
            container: container.into(),
            endpoint: None,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            page_size: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: AzureConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Credentials from `AZURE_STORAGE_ACCOUNT` and `AZURE_STORAGE_KEY`,
    /// with an optional `AZURE_STORAGE_ENDPOINT`.
    pub fn from_env(container: &str) -> anyhow::Result<Self> {
        let account_name = std::env::var("AZURE_STORAGE_ACCOUNT")
            .map_err(|_| anyhow::anyhow!("AZURE_STORAGE_ACCOUNT must be set"))?;
        let account_key = std::env::var("AZURE_STORAGE_KEY")
            .map_err(|_| anyhow::anyhow!("AZURE_STORAGE_KEY must be set"))?;
        let mut config = Self::new(account_name, account_key, container);
        config.endpoint = std::env::var("AZURE_STORAGE_ENDPOINT").ok();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.account_name.is_empty() {
            anyhow::bail!("account_name must not be empty");
        }
        if self.account_key.is_empty() {
            anyhow::bail!("account_key must not be empty");
        }
        validate_container_name(&self.container)?;
        if self.fetch_concurrency == 0 {
            anyhow::bail!("fetch_concurrency must be at least 1");
        }
        if self.page_size == Some(0) {
            anyhow::bail!("page_size must be at least 1");
        }
        if let Some(ep) = &self.endpoint {
            if !ep.starts_with("https://") && !ep.starts_with("http://") {
                anyhow::bail!("endpoint must be an http(s) URL: {}", ep);
            }
        }
        Ok(())
    }

    /// Account endpoint without a trailing slash.
    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(ep) => ep.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.account_name),
        }
    }
}

/// Container names are 3-63 characters of lowercase letters, digits and
/// single hyphens, starting and ending with a letter or digit.
fn validate_container_name(name: &str) -> anyhow::Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !(3..=63).contains(&name.len())
        || !valid_chars
        || name.starts_with('-')
        || name.ends_with('-')
        || name.contains("--")
    {
        anyhow::bail!("invalid container name: {:?}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let toml_str = r#"
account_name = "myaccount"
account_key = "c2VjcmV0"
container = "ipfs-blocks"
fetch_concurrency = 4
page_size = 1000
"#;
        let config: AzureConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.fetch_concurrency, 4);
        assert_eq!(config.page_size, Some(1000));
        assert_eq!(config.request_timeout_secs, 300);
        assert_eq!(config.endpoint(), "https://myaccount.blob.core.windows.net");
    }

    #[test]
    fn test_defaults_and_endpoint_override() {
        let toml_str = r#"
account_name = "devstoreaccount1"
account_key = "c2VjcmV0"
container = "blocks"
endpoint = "http://127.0.0.1:10000/devstoreaccount1/"
"#;
        let config: AzureConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.fetch_concurrency, 16);
        assert_eq!(config.page_size, None);
        assert_eq!(config.endpoint(), "http://127.0.0.1:10000/devstoreaccount1");
    }

    #[test]
    fn test_invalid_container_names() {
        for name in ["ab", "Upper", "-lead", "trail-", "dou--ble", "under_score"] {
            let config = AzureConfig::new("acct", "c2VjcmV0", name);
            assert!(config.validate().is_err(), "{} should be rejected", name);
        }
        assert!(AzureConfig::new("acct", "c2VjcmV0", "ok-name-1").validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = AzureConfig::new("acct", "c2VjcmV0", "blocks");
        config.fetch_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure.toml");
        std::fs::write(
            &path,
            "account_name = \"acct\"\naccount_key = \"c2VjcmV0\"\ncontainer = \"blocks\"\n",
        )
        .unwrap();
        let config = AzureConfig::load(&path).unwrap();
        assert_eq!(config.container, "blocks");

        std::fs::write(&path, "account_name = \"acct\"\n").unwrap();
        assert!(AzureConfig::load(&path).is_err());
    }
}
