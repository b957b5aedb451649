//! Nexus3 backend
//!
//! Talks to a Sonatype Nexus3 raw repository:
//! - `POST {base}/service/rest/v1/components?repository=<repo>` with a
//!   multipart form (`raw.directory`, `raw.assetN.filename`,
//!   `raw.assetN`) uploads the artifact, seal and repository metadata
//!   as one component.
//! - `GET {base}/service/rest/v1/assets?repository=<repo>` lists assets
//!   with continuation-token pagination.
//! - `GET {base}/repository/<repo>/<group>/<name>/<file>` downloads a
//!   file directly.
//!
//! Nexus serves an HTML 404 page for files that do not exist, so every
//! body that should be JSON is sniffed first: a missing
//! `repository.json` means an empty repository, while a non-JSON asset
//! listing means the backend URI is wrong.

use fabriq_model::{PackageEntry, PackageName, Repository};
use reqwest::blocking::multipart::Form;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::{is_json, Backend, BackendError, Credentials};

/// Fixed request timeout for metadata and upload calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A Nexus3 remote registry.
#[derive(Debug, Clone)]
pub struct Nexus3Backend {
    /// Base URI including scheme, e.g. `https://nexus.example.com`
    base: String,
    /// Name of the raw repository packages are stored in
    repository: String,
    client: Client,
}

impl Nexus3Backend {
    /// Default raw repository name on the Nexus server.
    pub const DEFAULT_REPOSITORY: &'static str = "fabriq";

    /// Create a backend for `domain` (no scheme). `insecure` selects
    /// plain http and accepts self-signed certificates.
    pub fn new(domain: &str, insecure: bool) -> Result<Self, BackendError> {
        let scheme = if insecure { "http" } else { "https" };
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self {
            base: format!("{}://{}", scheme, domain),
            repository: Self::DEFAULT_REPOSITORY.to_string(),
            client,
        })
    }

    /// Use a raw repository other than the default.
    pub fn with_repository(mut self, repository: &str) -> Self {
        self.repository = repository.to_string();
        self
    }

    fn components_uri(&self) -> String {
        format!(
            "{}/service/rest/v1/components?repository={}",
            self.base, self.repository
        )
    }

    fn assets_uri(&self, continuation: Option<&str>) -> String {
        match continuation {
            Some(token) => format!(
                "{}/service/rest/v1/assets?repository={}&continuationToken={}",
                self.base, self.repository, token
            ),
            None => format!(
                "{}/service/rest/v1/assets?repository={}",
                self.base, self.repository
            ),
        }
    }

    fn file_uri(&self, group: &str, name: &str, file: &str) -> String {
        format!(
            "{}/repository/{}/{}/{}/{}",
            self.base, self.repository, group, name, file
        )
    }

    fn authenticated(
        &self,
        request: RequestBuilder,
        credentials: Option<&Credentials>,
    ) -> RequestBuilder {
        match credentials {
            Some(c) => request.basic_auth(&c.user, Some(&c.password)),
            None => request,
        }
    }

    /// Fetch the raw body of a repository file.
    fn get_file(
        &self,
        group: &str,
        name: &str,
        file: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(u16, Vec<u8>), BackendError> {
        let uri = self.file_uri(group, name, file);
        debug!(%uri, "fetching file from nexus");
        let response = self
            .authenticated(self.client.get(&uri), credentials)
            .header("accept", "application/json")
            .send()?;
        let status = response.status().as_u16();
        Ok((status, response.bytes()?.to_vec()))
    }

    /// Upload a multipart form as a component, checking the status.
    fn post_component(
        &self,
        form: Form,
        credentials: Option<&Credentials>,
    ) -> Result<(), BackendError> {
        let response = self
            .authenticated(self.client.post(self.components_uri()), credentials)
            .header("accept", "application/json")
            .multipart(form)
            .send()?;
        let status = response.status();
        if status.as_u16() > 299 {
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: format!(
                    "failed to push, {}",
                    response.text().unwrap_or_default().trim().to_string()
                ),
            });
        }
        Ok(())
    }

    /// List all assets in the raw repository, following continuation
    /// tokens until the listing is exhausted.
    fn list_assets(&self, credentials: Option<&Credentials>) -> Result<Vec<Asset>, BackendError> {
        let mut assets = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let uri = self.assets_uri(continuation.as_deref());
            let response = self
                .authenticated(self.client.get(&uri), credentials)
                .header("accept", "application/json")
                .send()?;
            let body = response.text()?;
            if !is_json(&body) {
                return Err(BackendError::NotJson { uri: self.base.clone() });
            }
            let page: AssetPage = serde_json::from_str(&body)?;
            assets.extend(page.items);
            match page.continuation_token {
                Some(token) if !token.is_empty() => continuation = Some(token),
                _ => break,
            }
        }
        Ok(assets)
    }

    /// Upload the repository metadata document on its own.
    fn upload_metadata(
        &self,
        group: &str,
        name: &str,
        repository: &Repository,
        credentials: Option<&Credentials>,
    ) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec_pretty(repository)?;
        let form = Form::new()
            .text("raw.directory", format!("{}/{}", group, name))
            .text("raw.asset1.filename", "repository.json")
            .part(
                "raw.asset1",
                reqwest::blocking::multipart::Part::bytes(bytes)
                    .file_name("repository.json")
                    .mime_str("application/json")?,
            );
        self.post_component(form, credentials)
    }
}

impl Backend for Nexus3Backend {
    fn name(&self) -> &'static str {
        "nexus3"
    }

    fn upload_artifact(
        &self,
        name: &PackageName,
        file_ref: &str,
        zip_path: &Path,
        seal_path: &Path,
        repository: &Repository,
        credentials: Option<&Credentials>,
    ) -> Result<(), BackendError> {
        let repo_bytes = serde_json::to_vec_pretty(repository)?;
        let form = Form::new()
            .text("raw.directory", name.repository())
            .text("raw.asset1.filename", format!("{}.json", file_ref))
            .file("raw.asset1", seal_path)?
            .text("raw.asset2.filename", format!("{}.zip", file_ref))
            .file("raw.asset2", zip_path)?
            .text("raw.asset3.filename", "repository.json")
            .part(
                "raw.asset3",
                reqwest::blocking::multipart::Part::bytes(repo_bytes)
                    .file_name("repository.json")
                    .mime_str("application/json")?,
            );
        self.post_component(form, credentials)
    }

    fn get_repository_info(
        &self,
        group: &str,
        name: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Repository, BackendError> {
        let (_, body) = self.get_file(group, name, "repository.json", credentials)?;
        let body = String::from_utf8_lossy(&body);
        if !is_json(&body) {
            // Nexus answers with an HTML 404 page: the repository has
            // not been pushed to yet
            return Ok(Repository::empty(group, name));
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn update_package_info(
        &self,
        group: &str,
        name: &str,
        package: &PackageEntry,
        credentials: Option<&Credentials>,
    ) -> Result<(), BackendError> {
        let mut repo = self.get_repository_info(group, name, credentials)?;
        if !repo.update_package(package) {
            return Err(BackendError::PackageNotFound);
        }
        self.upload_metadata(group, name, &repo, credentials)
    }

    fn delete_package(
        &self,
        group: &str,
        name: &str,
        file_ref: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(), BackendError> {
        let prefix = format!("{}/{}/{}", group, name, file_ref);
        let assets = self.list_assets(credentials)?;
        for asset in assets.iter().filter(|a| a.path.starts_with(&prefix)) {
            let uri = format!("{}/service/rest/v1/assets/{}", self.base, asset.id);
            let response = self
                .authenticated(self.client.delete(&uri), credentials)
                .send()?;
            let status = response.status().as_u16();
            if status > 299 && status != 404 {
                return Err(BackendError::Status {
                    status,
                    message: format!("cannot delete asset {}", asset.path),
                });
            }
        }
        Ok(())
    }

    fn download(
        &self,
        group: &str,
        name: &str,
        file_name: &str,
        dest_dir: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<PathBuf, BackendError> {
        let (status, body) = self.get_file(group, name, file_name, credentials)?;
        if status == 404 {
            return Err(BackendError::FileNotFound {
                repository: format!("{}/{}", group, name),
                file: file_name.to_string(),
            });
        }
        if status > 299 {
            return Err(BackendError::Status {
                status,
                message: format!("cannot download {}", file_name),
            });
        }
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(file_name);
        fs::write(&dest, body)?;
        Ok(dest)
    }
}

/// One page of the Nexus asset listing.
#[derive(Debug, Deserialize)]
struct AssetPage {
    items: Vec<Asset>,
    #[serde(rename = "continuationToken")]
    continuation_token: Option<String>,
}

/// A single asset entry as returned by the listing API.
#[derive(Debug, Deserialize)]
struct Asset {
    id: String,
    path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uris() {
        let backend = Nexus3Backend::new("nexus.example.com:8081", false).unwrap();
        assert_eq!(
            backend.components_uri(),
            "https://nexus.example.com:8081/service/rest/v1/components?repository=fabriq"
        );
        assert_eq!(
            backend.file_uri("tools", "builder", "repository.json"),
            "https://nexus.example.com:8081/repository/fabriq/tools/builder/repository.json"
        );
        assert_eq!(
            backend.assets_uri(Some("abc")),
            "https://nexus.example.com:8081/service/rest/v1/assets?repository=fabriq&continuationToken=abc"
        );
    }

    #[test]
    fn test_insecure_uses_http() {
        let backend = Nexus3Backend::new("localhost:8081", true)
            .unwrap()
            .with_repository("packages");
        assert_eq!(
            backend.components_uri(),
            "http://localhost:8081/service/rest/v1/components?repository=packages"
        );
    }

    #[test]
    fn test_missing_repository_json_is_empty_repo() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/repository/fabriq/tools/builder/repository.json")
            .with_status(404)
            .with_body("<html>404 not found</html>")
            .create();

        let domain = server.host_with_port();
        let backend = Nexus3Backend::new(&domain, true).unwrap();
        let repo = backend.get_repository_info("tools", "builder", None).unwrap();
        assert!(repo.packages.is_empty());
        assert_eq!(repo.repository, "tools/builder");
        mock.assert();
    }

    #[test]
    fn test_repository_json_parsed() {
        let mut server = mockito::Server::new();
        let body = r#"{"repository":"tools/builder","packages":[{"id":"aaa","repository":"tools/builder","file_ref":"ref-aaa","tags":["latest"],"size":"1KB","created":"Friday, 07-Aug-26 10:15:30 UTC"}]}"#;
        let _mock = server
            .mock("GET", "/repository/fabriq/tools/builder/repository.json")
            .with_status(200)
            .with_body(body)
            .create();

        let backend = Nexus3Backend::new(&server.host_with_port(), true).unwrap();
        let repo = backend.get_repository_info("tools", "builder", None).unwrap();
        assert_eq!(repo.packages.len(), 1);
        assert!(repo.find_by_tag("latest").is_some());
    }

    #[test]
    fn test_asset_listing_follows_continuation() {
        let mut server = mockito::Server::new();
        let page1 = r#"{"items":[{"id":"id1","path":"tools/builder/a.zip"}],"continuationToken":"next"}"#;
        let page2 = r#"{"items":[{"id":"id2","path":"tools/builder/a.json"}],"continuationToken":null}"#;
        let _m1 = server
            .mock("GET", "/service/rest/v1/assets?repository=fabriq")
            .with_body(page1)
            .create();
        let _m2 = server
            .mock(
                "GET",
                "/service/rest/v1/assets?repository=fabriq&continuationToken=next",
            )
            .with_body(page2)
            .create();

        let backend = Nexus3Backend::new(&server.host_with_port(), true).unwrap();
        let assets = backend.list_assets(None).unwrap();
        assert_eq!(assets.len(), 2);
    }

    #[test]
    fn test_non_json_asset_listing_is_misconfiguration() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/service/rest/v1/assets?repository=fabriq")
            .with_body("<html>login page</html>")
            .create();

        let backend = Nexus3Backend::new(&server.host_with_port(), true).unwrap();
        assert!(matches!(
            backend.list_assets(None),
            Err(BackendError::NotJson { .. })
        ));
    }

    #[test]
    fn test_download_writes_file() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/repository/fabriq/tools/builder/ref-aaa.zip")
            .with_body("zip-bytes")
            .create();

        let backend = Nexus3Backend::new(&server.host_with_port(), true).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let path = backend
            .download("tools", "builder", "ref-aaa.zip", dir.path(), None)
            .unwrap();
        assert_eq!(fs::read(path).unwrap(), b"zip-bytes");
    }
}
