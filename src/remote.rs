use crate::DrainError;
use reqwest::blocking::{Body, Client};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

pub type Headers = Vec<(String, String)>;

pub const ACCESS_KEY_VAR: &str = "DRAIN_ACCESS_KEY";
pub const SECRET_KEY_VAR: &str = "DRAIN_SECRET_KEY";

/// Archive object store as seen by the transfer engine.
///
/// Every call reports the HTTP status, with `0` standing for a transport
/// failure. `Err` is reserved for local problems such as an unreadable file.
pub trait RemoteStore {
    fn create_item(&self, item: &str, manifest: &[u8], headers: &Headers) -> Result<u16, DrainError>;
    fn probe_item(&self, item: &str) -> Result<u16, DrainError>;
    fn upload(
        &self,
        item: &str,
        filename: &str,
        path: &Path,
        headers: &Headers,
    ) -> Result<u16, DrainError>;
}

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    /// Read the key pair from the environment, loading `.env` first if present.
    pub fn from_env() -> Result<Self, DrainError> {
        dotenv::dotenv().ok();
        let access_key = std::env::var(ACCESS_KEY_VAR)
            .map_err(|_| DrainError::Config(format!("{} not set", ACCESS_KEY_VAR)))?;
        let secret_key = std::env::var(SECRET_KEY_VAR)
            .map_err(|_| DrainError::Config(format!("{} not set", SECRET_KEY_VAR)))?;
        Ok(Self {
            access_key,
            secret_key,
        })
    }

    pub fn authorization(&self) -> String {
        format!("LOW {}:{}", self.access_key, self.secret_key)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .finish()
    }
}

/// IAS3-style store over blocking HTTP.
pub struct HttpStore {
    client: Client,
    endpoint: String,
    credentials: Credentials,
}

impl HttpStore {
    pub fn new(endpoint: &str, credentials: Credentials) -> Result<Self, DrainError> {
        // uploads of multi-gigabyte files must not hit a request timeout
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(60))
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| DrainError::Remote(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, item: &str, filename: &str) -> String {
        format!("{}/{}/{}", self.endpoint, item, filename)
    }

    /// Status of the call, `0` on transport failure. A request that cannot
    /// be built is a local error and never reaches the retry loop.
    fn send(
        &self,
        request: reqwest::blocking::RequestBuilder,
        headers: &Headers,
        what: &str,
    ) -> Result<u16, DrainError> {
        let mut request = request.header("authorization", self.credentials.authorization());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        match request.send() {
            Ok(response) => {
                let status = response.status().as_u16();
                tracing::debug!(status, "{}", what);
                Ok(status)
            }
            Err(e) if e.is_builder() => Err(DrainError::Remote(format!("{}: bad request: {}", what, e))),
            Err(e) => {
                tracing::warn!("{} failed: {}", what, e);
                Ok(0)
            }
        }
    }
}

impl RemoteStore for HttpStore {
    fn create_item(&self, item: &str, manifest: &[u8], headers: &Headers) -> Result<u16, DrainError> {
        let request = self.client.put(self.url(item, "MANIFEST")).body(manifest.to_vec());
        self.send(request, headers, &format!("PUT {}/MANIFEST", item))
    }

    fn probe_item(&self, item: &str) -> Result<u16, DrainError> {
        let request = self.client.head(self.url(item, ""));
        self.send(request, &Headers::new(), &format!("HEAD {}/", item))
    }

    fn upload(
        &self,
        item: &str,
        filename: &str,
        path: &Path,
        headers: &Headers,
    ) -> Result<u16, DrainError> {
        let file = File::open(path)?;
        let request = self.client.put(self.url(item, filename)).body(Body::from(file));
        self.send(request, headers, &format!("PUT {}/{}", item, filename))
    }
}
