//! Static whitelists read at startup.

use camino::Utf8Path;
use std::{collections::HashSet, net::IpAddr};
use tracing::info;

use crate::error::GreylistError;
use crate::lists::{keys, ListStore};

async fn read_entries(path: &Utf8Path) -> Result<Vec<(usize, String)>, GreylistError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| GreylistError::ListFile {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(contents
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(lineno, line)| (lineno, line.to_string()))
        .collect())
}

/// Seeds the address whitelist with every address of `path`, as if each had
/// been seen at `now`. Any line that is not an IP address is an error.
pub async fn load_ip_whitelist(
    path: &Utf8Path,
    store: &dyn ListStore,
    now: i64,
) -> Result<usize, GreylistError> {
    let mut loaded = 0;
    for (line, entry) in read_entries(path).await? {
        let ip: IpAddr = entry.parse().map_err(|_| GreylistError::InvalidEntry {
            path: path.to_path_buf(),
            line,
            entry: entry.clone(),
        })?;
        store.set(&keys::ip(ip), now).await;
        loaded += 1;
    }
    info!(%path, loaded, "address whitelist loaded");
    Ok(loaded)
}

/// Reads the static sender domain whitelist. Domains are lowercased.
pub async fn load_domain_whitelist(path: &Utf8Path) -> Result<HashSet<String>, GreylistError> {
    let domains: HashSet<String> = read_entries(path)
        .await?
        .into_iter()
        .map(|(_, domain)| domain.to_lowercase())
        .collect();
    info!(%path, loaded = domains.len(), "domain whitelist loaded");
    Ok(domains)
}
