use std::io::Read;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use scanview_core::{FetchError, ImageDownloader, ImageId};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },

    #[error("reading response body from {url} failed: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected payload from {url}: {reason}")]
    Payload { url: String, reason: String },

    #[error(transparent)]
    Tree(#[from] scanview_core::CoreError),
}

/// Connection settings for the imaging server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the API, without a trailing slash.
    pub base_url: String,
    /// Bearer token, if the server requires one.
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// List endpoints wrap their payload in a `results` array.
#[derive(Debug, Deserialize)]
struct Paginated<T> {
    results: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanRecord {
    pub id: String,
    pub scan_type: String,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub notes: Vec<NoteRecord>,
    #[serde(default)]
    pub decisions: Vec<DecisionRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoteRecord {
    pub note: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionRecord {
    pub decision: String,
    #[serde(default)]
    pub creator: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
struct DecisionPayload<'a> {
    decision: &'a str,
}

#[derive(Debug, Serialize)]
struct NotePayload<'a> {
    scan: &'a str,
    note: &'a str,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Blocking HTTP client for the imaging server's REST surface.
///
/// Shareable across the engine's worker threads; each request is
/// independent.
pub struct RestClient {
    agent: ureq::Agent,
    config: ApiConfig,
}

impl RestClient {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            config,
        }
    }

    pub fn sessions(&self) -> Result<Vec<SessionRecord>, ClientError> {
        self.get_results("/sessions", None)
    }

    pub fn sites(&self) -> Result<Vec<SiteRecord>, ClientError> {
        self.get_results("/sites", None)
    }

    pub fn experiments(&self, session: &str) -> Result<Vec<ExperimentRecord>, ClientError> {
        self.get_results("/experiments", Some(("session", session)))
    }

    pub fn scans(&self, experiment: &str) -> Result<Vec<ScanRecord>, ClientError> {
        self.get_results("/scans", Some(("experiment", experiment)))
    }

    pub fn images(&self, scan: &str) -> Result<Vec<ImageRecord>, ClientError> {
        self.get_results("/images", Some(("scan", scan)))
    }

    /// Fetch a single scan, e.g. to refresh its decisions after a post.
    pub fn scan(&self, scan: &str) -> Result<ScanRecord, ClientError> {
        let url = format!("{}/scans/{scan}", self.config.base_url);
        let mut response = self
            .request(self.agent.get(&url))
            .call()
            .map_err(|source| ClientError::Http {
                url: url.clone(),
                source: Box::new(source),
            })?;
        response
            .body_mut()
            .read_json()
            .map_err(|err| ClientError::Payload {
                url,
                reason: err.to_string(),
            })
    }

    /// Record a reviewer decision on a scan.
    pub fn set_decision(&self, scan: &str, decision: &str) -> Result<(), ClientError> {
        let url = format!("{}/scans/{scan}/decision", self.config.base_url);
        debug!(scan, decision, "posting decision");
        self.request(self.agent.post(&url))
            .send_json(DecisionPayload { decision })
            .map_err(|source| ClientError::Http {
                url,
                source: Box::new(source),
            })?;
        Ok(())
    }

    /// Attach a free-text note to a scan.
    pub fn add_scan_note(&self, scan: &str, note: &str) -> Result<(), ClientError> {
        let url = format!("{}/scan_notes", self.config.base_url);
        debug!(scan, "posting scan note");
        self.request(self.agent.post(&url))
            .send_json(NotePayload { scan, note })
            .map_err(|source| ClientError::Http {
                url,
                source: Box::new(source),
            })?;
        Ok(())
    }

    /// Download an image file's raw bytes.
    pub fn download_image(&self, id: &ImageId) -> Result<Vec<u8>, ClientError> {
        let url = format!("{}/images/{id}/download", self.config.base_url);
        trace!(image = %id, "downloading image file");
        let response = self
            .request(self.agent.get(&url))
            .call()
            .map_err(|source| ClientError::Http {
                url: url.clone(),
                source: Box::new(source),
            })?;
        let (_, body) = response.into_parts();
        let mut bytes = Vec::new();
        body.into_reader()
            .read_to_end(&mut bytes)
            .map_err(|source| ClientError::Io { url, source })?;
        Ok(bytes)
    }

    fn get_results<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Option<(&str, &str)>,
    ) -> Result<Vec<T>, ClientError> {
        let url = format!("{}{path}", self.config.base_url);
        let mut request = self.agent.get(&url);
        if let Some((key, value)) = query {
            request = request.query(key, value);
        }
        let mut response =
            self.request(request)
                .call()
                .map_err(|source| ClientError::Http {
                    url: url.clone(),
                    source: Box::new(source),
                })?;
        let page: Paginated<T> =
            response
                .body_mut()
                .read_json()
                .map_err(|err| ClientError::Payload {
                    url,
                    reason: err.to_string(),
                })?;
        Ok(page.results)
    }

    fn request<B>(&self, builder: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        match &self.config.token {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }
}

impl ImageDownloader for RestClient {
    fn download(&self, id: &ImageId) -> Result<Vec<u8>, FetchError> {
        self.download_image(id).map_err(|err| match err {
            ClientError::Http { source, .. } => match *source {
                ureq::Error::StatusCode(status) => FetchError::Http {
                    id: id.clone(),
                    status,
                },
                other => FetchError::Download {
                    id: id.clone(),
                    reason: other.to_string(),
                },
            },
            other => FetchError::Download {
                id: id.clone(),
                reason: other.to_string(),
            },
        })
    }
}
