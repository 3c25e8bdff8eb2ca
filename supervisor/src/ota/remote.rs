use std::{future::Future, path::Path};

use crate::error::UpdateError;

/// Where updates come from. Paths are relative to the source's configured root.
pub trait RemoteSource: Send + Sync {
    /// Fetches a small artifact such as the version manifest into memory.
    fn fetch(&self, path: &str) -> impl Future<Output = Result<Vec<u8>, UpdateError>> + Send;

    /// Streams `path` into `dest`, returning the number of bytes written.
    fn download(
        &self,
        path: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, UpdateError>> + Send;
}

#[cfg(not(any(target_arch = "xtensa", target_arch = "riscv32")))]
pub use github::GithubRawSource;

#[cfg(not(any(target_arch = "xtensa", target_arch = "riscv32")))]
mod github {
    use std::{path::Path, time::Duration};

    use fridge_common::OtaConfig;
    use reqwest::{header::USER_AGENT, Client, RequestBuilder, Response};
    use tokio::io::AsyncWriteExt;
    use tracing::debug;

    use super::RemoteSource;
    use crate::error::UpdateError;

    const AGENT: &str = concat!("fridge-monitor/", env!("CARGO_PKG_VERSION"));
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Reads files from `raw.githubusercontent.com/{user}/{repo}/{branch}/`.
    #[derive(Debug, Clone)]
    pub struct GithubRawSource {
        client: Client,
        base: String,
        token: Option<String>,
    }

    impl GithubRawSource {
        pub fn new(
            user: &str,
            repo: &str,
            branch: &str,
            token: Option<String>,
        ) -> Result<Self, UpdateError> {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(network)?;
            Ok(Self {
                client,
                base: format!("https://raw.githubusercontent.com/{user}/{repo}/{branch}"),
                token: token.filter(|token| !token.is_empty()),
            })
        }

        pub fn from_config(config: &OtaConfig) -> Result<Self, UpdateError> {
            Self::new(
                &config.user,
                &config.repo,
                &config.branch,
                Some(config.token.clone()),
            )
        }

        pub fn url(&self, path: &str) -> String {
            format!("{}/{}", self.base, path.trim_start_matches('/'))
        }

        fn request(&self, path: &str) -> RequestBuilder {
            let request = self.client.get(self.url(path)).header(USER_AGENT, AGENT);
            match &self.token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        }

        async fn get(&self, path: &str) -> Result<Response, UpdateError> {
            let response = self.request(path).send().await.map_err(network)?;
            let status = response.status();
            if !status.is_success() {
                return Err(UpdateError::Http {
                    status: status.as_u16(),
                    path: path.to_string(),
                });
            }
            Ok(response)
        }
    }

    impl RemoteSource for GithubRawSource {
        async fn fetch(&self, path: &str) -> Result<Vec<u8>, UpdateError> {
            let body = self.get(path).await?.bytes().await.map_err(network)?;
            Ok(body.to_vec())
        }

        async fn download(&self, path: &str, dest: &Path) -> Result<u64, UpdateError> {
            let mut response = self.get(path).await?;
            let mut file = tokio::fs::File::create(dest).await?;
            let mut total = 0_u64;
            while let Some(chunk) = response.chunk().await.map_err(network)? {
                file.write_all(&chunk).await?;
                total = total.saturating_add(chunk.len() as u64);
            }
            file.sync_all().await?;
            debug!("downloaded {total} bytes of {path}");
            Ok(total)
        }
    }

    fn network(err: reqwest::Error) -> UpdateError {
        UpdateError::Network(err.to_string())
    }

}
