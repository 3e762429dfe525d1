use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, KvClient};
use tracing::{debug, info, instrument};
use undelete_core::store::{KvStore, StoreConnector, StoreError, StoredEntry};

use crate::tls::{TlsMaterial, TlsPaths};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 2379;
pub const DEFAULT_PAGE_SIZE: i64 = 500;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to reach one etcd member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdSettings {
    pub host: String,
    pub port: u16,
    pub tls: TlsPaths,
    /// Name checked against the server certificate instead of `host`.
    pub tls_server_name: Option<String>,
    pub connect_timeout: Duration,
    /// Keys per range request; 0 asks for the whole prefix in one response.
    pub page_size: i64,
}

impl EtcdSettings {
    pub fn new(tls: TlsPaths) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls,
            tls_server_name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("https://[{}]:{}", self.host, self.port)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }
}

/// Opens TLS connections described by [`EtcdSettings`].
pub struct EtcdConnector {
    settings: EtcdSettings,
}

impl EtcdConnector {
    pub fn new(settings: EtcdSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl StoreConnector for EtcdConnector {
    type Store = EtcdStore;

    fn describe(&self) -> String {
        self.settings.endpoint()
    }

    #[instrument(skip_all, fields(endpoint = %self.settings.endpoint()))]
    async fn connect(&self) -> Result<EtcdStore, StoreError> {
        let settings = &self.settings;
        info!(
            ca = %settings.tls.ca.display(),
            cert = %settings.tls.cert.display(),
            key = %settings.tls.key.display(),
            "loading TLS material"
        );
        let material = TlsMaterial::load(&settings.tls)?;

        let endpoint = settings.endpoint();
        let options = ConnectOptions::new()
            .with_tls(material.to_options(settings.tls_server_name.as_deref()))
            .with_connect_timeout(settings.connect_timeout);
        let client = Client::connect([endpoint.as_str()], Some(options))
            .await
            .map_err(|err| StoreError::Connection {
                endpoint: endpoint.clone(),
                reason: err.to_string(),
            })?;
        debug!("connected");

        Ok(EtcdStore {
            client,
            page_size: settings.page_size,
        })
    }
}

/// Connected etcd handle implementing the store contract.
pub struct EtcdStore {
    client: Client,
    page_size: i64,
}

#[async_trait]
impl KvStore for EtcdStore {
    #[instrument(skip_all, fields(prefix = %prefix, page_size = self.page_size))]
    async fn scan(&self, prefix: &str) -> Result<Vec<StoredEntry>, StoreError> {
        let scan_err = |err: etcd_client::Error| StoreError::Scan {
            prefix: prefix.to_string(),
            reason: err.to_string(),
        };
        let mut kv = self.client.kv_client();

        if self.page_size <= 0 {
            let resp = kv
                .get(prefix, Some(GetOptions::new().with_prefix()))
                .await
                .map_err(scan_err)?;
            return Ok(resp
                .kvs()
                .iter()
                .map(|kv| StoredEntry::new(kv.key(), kv.value()))
                .collect());
        }

        let mut reader = RangeReader {
            kv,
            prefix,
            range_end: prefix_range_end(prefix.as_bytes()),
            page_size: self.page_size,
        };
        collect_pages(&mut reader, prefix.as_bytes()).await
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut kv = self.client.kv_client();
        kv.put(key, value.to_vec(), None)
            .await
            .map_err(|err| StoreError::Write {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        Ok(())
    }
}

/// One bounded range response.
#[derive(Debug, Default, PartialEq, Eq)]
struct Page {
    entries: Vec<StoredEntry>,
    /// Keys remain in the range past the last entry.
    more: bool,
    /// Store revision the page was read at; 0 when the response had no header.
    revision: i64,
}

/// Fetches one page of a range starting at `start`, optionally at a fixed revision.
#[async_trait]
trait PageSource: Send {
    async fn fetch(&mut self, start: Vec<u8>, revision: Option<i64>) -> Result<Page, StoreError>;
}

struct RangeReader<'a> {
    kv: KvClient,
    prefix: &'a str,
    range_end: Vec<u8>,
    page_size: i64,
}

#[async_trait]
impl PageSource for RangeReader<'_> {
    async fn fetch(&mut self, start: Vec<u8>, revision: Option<i64>) -> Result<Page, StoreError> {
        let mut options = GetOptions::new()
            .with_range(self.range_end.clone())
            .with_limit(self.page_size);
        if let Some(revision) = revision {
            options = options.with_revision(revision);
        }
        let resp = self
            .kv
            .get(start, Some(options))
            .await
            .map_err(|err| StoreError::Scan {
                prefix: self.prefix.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Page {
            entries: resp
                .kvs()
                .iter()
                .map(|kv| StoredEntry::new(kv.key(), kv.value()))
                .collect(),
            more: resp.more(),
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }
}

/// Read pages until the range is exhausted. Pages after the first are pinned to the
/// first page's revision so the result is one snapshot.
async fn collect_pages<S: PageSource>(
    source: &mut S,
    first_key: &[u8],
) -> Result<Vec<StoredEntry>, StoreError> {
    let mut start = first_key.to_vec();
    let mut revision = None;
    let mut entries = Vec::new();
    loop {
        let page = source.fetch(start, revision).await?;
        if revision.is_none() && page.revision > 0 {
            revision = Some(page.revision);
        }

        let next = match (page.more, page.entries.last()) {
            (true, Some(last)) => Some(next_key(&last.key)),
            _ => None,
        };
        entries.extend(page.entries);
        debug!(fetched = entries.len(), revision = ?revision, "page read");

        match next {
            Some(key) => start = key,
            None => return Ok(entries),
        }
    }
}

/// Smallest key greater than every key starting with `prefix`.
/// `[0]` means no upper bound, which is how etcd spells an all-`0xff` prefix.
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

/// Smallest key strictly after `key`.
fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}
