//! # Secondary Payload
//!
//! Download of the disguised artifact, its double base64 decode, and the
//! URL-keyed cache shared across sessions.

pub mod cache;
pub mod decode;
pub mod download;

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;

pub use cache::PayloadCache;
pub use decode::{DecodedPayload, UnpackedPayload, decode, decode_layers, unpack_payload};
pub use download::{HttpFetcher, PayloadFetcher, download, download_with, file_name_for_url};

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub path: PathBuf,
    pub from_cache: bool,
}

/// Place the artifact behind `url` in `dest_dir`, from `cache` when possible.
/// Fresh downloads are written back to the cache; a failed write is logged
/// and the fresh copy is still returned.
pub fn fetch_payload(
    fetcher: &dyn PayloadFetcher,
    cache: Option<&PayloadCache>,
    url: &str,
    dest_dir: &Path,
) -> Result<FetchedPayload> {
    if let Some(cache) = cache {
        let dest = dest_dir.join(file_name_for_url(url));
        if cache.restore(url, &dest)? {
            info!("using cached payload url={url}");
            return Ok(FetchedPayload {
                path: dest,
                from_cache: true,
            });
        }
    }

    let path = download_with(fetcher, url, dest_dir)?;
    if let Some(cache) = cache {
        if let Err(err) = cache.put(url, &path) {
            warn!(
                "could not cache payload url={url} dir={}: {err}",
                cache.dir().display()
            );
        }
    }
    Ok(FetchedPayload {
        path,
        from_cache: false,
    })
}
