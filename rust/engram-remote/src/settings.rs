use std::time::Duration;

use engram_facts::Space;
use url::Url;

use crate::EngramRemoteError;

/// The environment variable that selects the remote memory service
pub const API_URL_VAR: &str = "ENGRAM_API_URL";

/// The URL scheme that selects the in-process emulated transport
pub const EMULATED_SCHEME: &str = "memory";

/// How long a connection handshake may take before it is abandoned and
/// retried
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for a remote session.
#[derive(Clone, Debug)]
pub struct Settings {
    /// The base URL of the remote memory service
    pub api_url: Url,
    /// How long a connection handshake may take before reconnecting
    pub connect_timeout: Duration,
}

impl Settings {
    /// Create settings for the given API URL with default timings
    pub fn new(api_url: Url) -> Self {
        Self {
            api_url,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Read settings from the environment ([`API_URL_VAR`])
    pub fn from_env() -> Result<Self, EngramRemoteError> {
        let raw = std::env::var(API_URL_VAR).map_err(|_| {
            EngramRemoteError::Connection(format!("{API_URL_VAR} is not configured"))
        })?;

        let api_url = raw.parse().map_err(|error| {
            EngramRemoteError::Connection(format!("{API_URL_VAR} is not a URL: {error}"))
        })?;

        Ok(Self::new(api_url))
    }

    /// Whether these settings select the in-process emulated transport
    pub fn is_emulated(&self) -> bool {
        self.api_url.scheme() == EMULATED_SCHEME
    }

    /// Derive the websocket URL for a space: the API URL with its scheme
    /// swapped to the websocket equivalent and the memory endpoint path and
    /// space query appended.
    pub fn socket_url(&self, space: &Space) -> Result<Url, EngramRemoteError> {
        let mut url = self.api_url.clone();

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(EngramRemoteError::Connection(format!(
                    "Cannot derive a websocket URL from scheme \"{other}\""
                )));
            }
        };

        url.set_scheme(scheme)
            .map_err(|_| EngramRemoteError::Connection("Could not swap URL scheme".into()))?;

        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                EngramRemoteError::Connection("API URL cannot carry a path".into())
            })?;
            segments.pop_if_empty();
            segments.extend(["api", "storage", "memory"]);
        }

        url.query_pairs_mut().append_pair("space", space.as_str());

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use engram_facts::Space;

    use super::Settings;

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    use wasm_bindgen_test::wasm_bindgen_test;

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_derives_the_socket_url_from_the_api_url() -> Result<()> {
        let space = Space::generate()?;
        let settings = Settings::new("https://memory.example.com".parse()?);

        let url = settings.socket_url(&space)?;

        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/api/storage/memory");

        let (key, value) = url.query_pairs().next().expect("space query is appended");
        assert_eq!(key, "space");
        assert_eq!(value, space.as_str());

        Ok(())
    }

    #[cfg_attr(all(target_arch = "wasm32", target_os = "unknown"), wasm_bindgen_test)]
    #[cfg_attr(not(target_arch = "wasm32"), test)]
    fn it_recognizes_the_emulated_scheme() -> Result<()> {
        assert!(Settings::new("memory:".parse()?).is_emulated());
        assert!(!Settings::new("http://localhost:8000".parse()?).is_emulated());

        Ok(())
    }
}
