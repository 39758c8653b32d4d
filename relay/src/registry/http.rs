use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Payload, Registry};
use crate::error::RegistryError;
use crate::ident::ArtifactId;
use crate::{Error, Result};

/// Wire document exchanged with the registry for one artifact version.
#[derive(Debug, Serialize, Deserialize)]
struct Document {
    name: String,
    version: String,
    /// Base64-encoded file contents, by file name.
    files: BTreeMap<String, String>,
}

/// HTTP registry client.
///
/// Artifacts live at `{base}/{name}/{version}`: a `PUT` publishes a version, a `GET` returns it. Both exchange a
/// JSON document holding the base64-encoded artifact files.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpRegistry {
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base).map_err(|err| Error::Config(format!("invalid registry url {base:?}: {err}")))?;

        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("invalid registry url {base:?}")));
        }

        Ok(Self {
            client: Client::default(),
            base,
            token: None,
        })
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    #[inline]
    pub fn with_token(self, token: Option<String>) -> Self {
        Self { token, ..self }
    }

    /// Return the URL of artifact `id`, escaping both name and version.
    pub fn url(&self, id: &ArtifactId) -> Url {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .expect("checked on construction")
            .pop_if_empty()
            .extend([id.name.as_str(), id.version.as_str()]);
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn document(&self, id: &ArtifactId) -> Result<Document, RegistryError> {
        let resp = self.authorize(self.client.get(self.url(id))).send().await?;

        classify(id, resp.status())?;

        Ok(resp.json().await?)
    }
}

impl Registry for HttpRegistry {
    async fn push(&self, id: &ArtifactId, files: &[PathBuf]) -> Result<(), RegistryError> {
        let payload = Payload::read(files).await?;

        let document = Document {
            name: id.name.clone(),
            version: id.version.clone(),
            files: payload.iter().map(|(name, data)| (name.clone(), STANDARD.encode(data))).collect(),
        };

        tracing::trace!("PUT `{}`", self.url(id));

        let resp = self.authorize(self.client.put(self.url(id))).json(&document).send().await?;

        classify(id, resp.status())
    }

    async fn fetch(&self, id: &ArtifactId) -> Result<Payload, RegistryError> {
        tracing::trace!("GET `{}`", self.url(id));

        let document = self.document(id).await?;

        document
            .files
            .into_iter()
            .map(|(name, data)| match STANDARD.decode(&data) {
                Ok(data) => Ok((name, Bytes::from(data))),
                Err(err) => Err(RegistryError::Fatal(format!("malformed file `{name}` in {id}: {err}"))),
            })
            .collect()
    }

    async fn fetch_field(&self, id: &ArtifactId, pointer: &str) -> Result<serde_json::Value, RegistryError> {
        self.fetch(id).await?.descriptor_field(id, pointer)
    }
}

/// Map an HTTP status to the registry error taxonomy.
fn classify(id: &ArtifactId, status: StatusCode) -> Result<(), RegistryError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::NOT_FOUND => Err(RegistryError::NotFound(id.clone())),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Err(RegistryError::Transient(format!("{id}: {status}"))),
        s if s.is_server_error() => Err(RegistryError::Transient(format!("{id}: {status}"))),
        _ => Err(RegistryError::Fatal(format!("{id}: {status}"))),
    }
}
