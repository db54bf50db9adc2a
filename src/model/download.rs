use crate::error::UpscaleError;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Fetches a weights file to a local path
///
/// Abstracted so runs can be tested without network access.
#[cfg_attr(test, mockall::automock)]
pub trait WeightsFetcher {
    /// Downloads `url` into `dest`, returning the number of bytes written
    ///
    /// # Errors
    /// Returns `Network` for transport/HTTP failures, `Filesystem` for local write failures
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, UpscaleError>;
}

/// Plain HTTP(S) GET without timeout or retry
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFetcher;

impl WeightsFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, UpscaleError> {
        download_weights(url, dest)
    }
}

/// Ensures the weights exist locally, returns true if downloaded, false if already existed
///
/// `on_fetch` runs only when a download is about to start. An existing file is
/// trusted as-is and never re-validated.
///
/// # Errors
/// Propagates the fetcher's failure
pub fn ensure_weights(
    url: &str,
    weights_path: &Path,
    fetcher: &dyn WeightsFetcher,
    on_fetch: impl FnOnce(),
) -> Result<bool, UpscaleError> {
    if weights_path.exists() {
        tracing::info!(
            path = %weights_path.display(),
            "weights already exist, skipping download"
        );
        return Ok(false);
    }

    tracing::info!(
        url,
        path = %weights_path.display(),
        "weights not found, starting download"
    );
    on_fetch();

    let size = fetcher.fetch(url, weights_path)?;

    tracing::info!(
        path = %weights_path.display(),
        size,
        "weights downloaded successfully"
    );

    Ok(true)
}

fn download_weights(url: &str, weights_path: &Path) -> Result<u64, UpscaleError> {
    let network = |message: String| UpscaleError::Network {
        url: url.to_owned(),
        message,
    };

    // Create parent directory if it doesn't exist
    if let Some(parent) = weights_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| UpscaleError::filesystem(parent, e))?;
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(None::<Duration>)
        .build()
        .map_err(|e| network(e.to_string()))?;

    tracing::info!(url, "downloading weights");

    let mut response = client.get(url).send().map_err(|e| network(e.to_string()))?;

    if !response.status().is_success() {
        return Err(network(format!(
            "download failed with status {}",
            response.status()
        )));
    }

    // Stream into a temp file, renamed into place once complete
    let temp_path = weights_path.with_extension("tmp");

    let mut file =
        fs::File::create(&temp_path).map_err(|e| UpscaleError::filesystem(&temp_path, e))?;

    let size = response
        .copy_to(&mut file)
        .map_err(|e| network(e.to_string()))?;

    // Drop file handle before rename
    drop(file);

    fs::rename(&temp_path, weights_path).map_err(|e| UpscaleError::filesystem(weights_path, e))?;

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_existing_weights_skip_fetch() {
        let dir = TempDir::new().unwrap();
        let weights = dir.path().join("model.pth");
        fs::write(&weights, b"dummy weights").unwrap();

        let mut fetcher = MockWeightsFetcher::new();
        fetcher.expect_fetch().never();
        let mut announced = false;

        let downloaded =
            ensure_weights("https://example.invalid/model.pth", &weights, &fetcher, || {
                announced = true;
            })
            .unwrap();

        assert!(!downloaded);
        assert!(!announced);
    }

    #[test]
    fn test_missing_weights_are_fetched_once() {
        let dir = TempDir::new().unwrap();
        let weights = dir.path().join("model.pth");

        let mut fetcher = MockWeightsFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|url, dest| {
                assert_eq!(url, "https://example.invalid/model.pth");
                fs::write(dest, b"weights").unwrap();
                Ok(7)
            });
        let mut announced = false;

        let downloaded =
            ensure_weights("https://example.invalid/model.pth", &weights, &fetcher, || {
                announced = true;
            })
            .unwrap();

        assert!(downloaded);
        assert!(announced);
        assert!(weights.exists());
    }

    #[test]
    fn test_fetch_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let weights = dir.path().join("model.pth");

        let mut fetcher = MockWeightsFetcher::new();
        fetcher.expect_fetch().returning(|url, _| {
            Err(UpscaleError::Network {
                url: url.to_owned(),
                message: "connection refused".to_owned(),
            })
        });

        let result = ensure_weights("https://example.invalid/model.pth", &weights, &fetcher, || {});

        assert!(matches!(result, Err(UpscaleError::Network { .. })));
        assert!(!weights.exists());
    }

    #[test]
    fn test_download_unreachable_host() {
        let dir = TempDir::new().unwrap();
        let weights = dir.path().join("nested").join("model.pth");

        // Port 9 (discard) on localhost is closed in test environments
        let result = download_weights("http://127.0.0.1:9/model.pth", &weights);

        assert!(matches!(result, Err(UpscaleError::Network { .. })));
        assert!(!weights.exists());
    }

    #[test]
    #[ignore] // Requires network access
    fn test_download_published_weights() {
        let dir = TempDir::new().unwrap();
        let weights = dir.path().join("realesr-animevideov3.pth");

        let size = HttpFetcher
            .fetch(crate::config::DEFAULT_MODEL_URL, &weights)
            .unwrap();

        assert!(size > 0);
        assert_eq!(fs::metadata(&weights).unwrap().len(), size);
    }
}
