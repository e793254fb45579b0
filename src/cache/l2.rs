//! L2 cross-node result cache
//!
//! An optional remote key-value store reached over the RESP2 request/response
//! protocol, keyed by the 64-hex content hash. Probed only on L1 miss, and
//! only when an address is configured. Everything here is best-effort: a
//! transient error downgrades the run to L1-only and never fails a document.
//! Duplicated cross-node parses are acceptable, so no locking surrounds L2.

use super::CachedDocument;
use redis::Commands;
use std::sync::Mutex;
use tracing::warn;

/// Handle to the optional L2 endpoint
///
/// The connection is lazy and re-established after an error. A node that
/// cannot reach L2 keeps processing with L1 only.
pub struct L2Cache {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
}

impl L2Cache {
    /// Build a handle from the configured address. `None` disables L2.
    pub fn connect(address: Option<&str>) -> Option<Self> {
        let address = address?;
        let url = if address.starts_with("redis://") {
            address.to_string()
        } else {
            format!("redis://{}", address)
        };
        match redis::Client::open(url.as_str()) {
            Ok(client) => Some(Self {
                client,
                conn: Mutex::new(None),
            }),
            Err(e) => {
                warn!(error = %e, address = %url, "Invalid L2 address; continuing L1-only");
                None
            }
        }
    }

    /// Look up by content hash. Any error reports a miss.
    pub fn get(&self, content_hash: &str) -> Option<CachedDocument> {
        let mut guard = self.conn.lock().ok()?;
        let conn = self.ensure_conn(&mut *guard)?;
        match conn.get::<_, Option<Vec<u8>>>(content_hash) {
            Ok(Some(blob)) => CachedDocument::from_bytes(&blob),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "L2 get failed; downgrading to L1-only for this document");
                *guard = None;
                None
            }
        }
    }

    /// Store by content hash, best-effort
    pub fn put(&self, content_hash: &str, doc: &CachedDocument) {
        let Ok(mut guard) = self.conn.lock() else {
            return;
        };
        let Some(conn) = self.ensure_conn(&mut *guard) else {
            return;
        };
        if let Err(e) = conn.set::<_, _, ()>(content_hash, doc.to_bytes()) {
            warn!(error = %e, "L2 put failed; entry not replicated");
            *guard = None;
        }
    }

    fn ensure_conn<'a>(
        &self,
        guard: &'a mut Option<redis::Connection>,
    ) -> Option<&'a mut redis::Connection> {
        if guard.is_none() {
            match self.client.get_connection() {
                Ok(conn) => *guard = Some(conn),
                Err(e) => {
                    warn!(error = %e, "L2 connect failed; continuing L1-only");
                    return None;
                }
            }
        }
        guard.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_address_disables_l2() {
        assert!(L2Cache::connect(None).is_none());
    }

    #[test]
    fn bare_host_port_is_accepted() {
        // Only address parsing; no connection is attempted until first use
        assert!(L2Cache::connect(Some("cache-host:6379")).is_some());
        assert!(L2Cache::connect(Some("redis://cache-host:6379")).is_some());
    }

    #[test]
    fn unreachable_endpoint_reports_miss() {
        let cache = L2Cache::connect(Some("redis://127.0.0.1:1")).unwrap();
        assert!(cache.get(&"ab".repeat(32)).is_none());
    }
}
