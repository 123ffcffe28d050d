//! Streaming HTTP provider.
//!
//! The management service keeps the response open and writes a new
//! configuration blob, followed by four newlines, every time the topology
//! changes. One connection therefore delivers any number of configs.

use super::hostlist::HostList;
use super::provider::{record_specific, ConfigProvider, ProviderContext, ProviderKind, ProviderOutput, ProviderState};
use crate::error::{Error, ProtocolError};
use crate::topology::ClusterConfig;
use crate::types::HostPort;
use bytes::{Buf, BytesMut};
use std::sync::Arc;

/// Separator between successive configuration blobs.
pub const STREAM_DELIMITER: &[u8] = b"\n\n\n\n";

/// Splits a configuration stream into blobs.
#[derive(Debug, Default)]
pub struct HttpConfigStream {
    buf: BytesMut,
}

impl HttpConfigStream {
    /// Create an empty stream parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every blob completed by it, oldest first.
    /// Bytes after the last delimiter are kept for the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut blobs = Vec::new();
        while let Some(pos) = find(&self.buf, STREAM_DELIMITER) {
            let blob = self.buf.split_to(pos);
            self.buf.advance(STREAM_DELIMITER.len());
            let text = String::from_utf8_lossy(&blob);
            let text = text.trim();
            if !text.is_empty() {
                blobs.push(text.to_string());
            }
        }
        blobs
    }

    /// Bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial blob.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Receives configurations over a long-lived HTTP stream.
#[derive(Debug)]
pub struct HttpProvider {
    hosts: HostList,
    bucket: String,
    stream_host: Option<HostPort>,
    parser: HttpConfigStream,
    cached: Option<Arc<ClusterConfig>>,
    cycle_error: Option<Error>,
    randomize: bool,
}

impl HttpProvider {
    /// Create a provider seeded with management `hosts`.
    pub fn new(hosts: HostList, bucket: impl Into<String>, randomize: bool) -> Self {
        let mut hosts = hosts;
        if randomize {
            hosts.randomize();
        }
        Self {
            hosts,
            bucket: bucket.into(),
            stream_host: None,
            parser: HttpConfigStream::new(),
            cached: None,
            cycle_error: None,
            randomize,
        }
    }

    /// Streaming endpoint for the bucket.
    pub fn stream_path(&self) -> String {
        format!("/pools/default/bs/{}", self.bucket)
    }

    /// Host whose stream is currently open.
    pub fn stream_host(&self) -> Option<&HostPort> {
        self.stream_host.as_ref()
    }

    fn open_next(
        &mut self,
        error: Option<Error>,
        mut rollover: bool,
        ctx: &mut ProviderContext<'_>,
    ) -> Option<ProviderOutput> {
        if let Some(error) = error {
            record_specific(&mut self.cycle_error, error);
        }
        let path = self.stream_path();
        loop {
            let Some(host) = self.hosts.next(rollover) else {
                self.stream_host = None;
                return Some(match self.cycle_error.take() {
                    Some(error) => ProviderOutput::Failed(error),
                    None => ProviderOutput::Exhausted,
                });
            };

            let credentials = ctx.auth.credentials(&host);
            match ctx.transport.open_stream(&host, &path, &credentials) {
                Ok(()) => {
                    tracing::debug!(host = %host, path = %path, "Opening configuration stream");
                    self.parser.reset();
                    self.stream_host = Some(host);
                    return None;
                }
                Err(err) => {
                    tracing::info!(host = %host, error = %err, "Configuration stream could not be opened");
                    record_specific(&mut self.cycle_error, err);
                    rollover = false;
                }
            }
        }
    }

    fn close(&mut self, ctx: &mut ProviderContext<'_>) {
        if let Some(host) = self.stream_host.take() {
            ctx.transport.close_stream(&host);
        }
        self.parser.reset();
    }
}

impl ConfigProvider for HttpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Http
    }

    fn state(&self) -> ProviderState {
        if self.stream_host.is_some() {
            ProviderState::Fetching
        } else {
            ProviderState::Idle
        }
    }

    fn refresh(&mut self, ctx: &mut ProviderContext<'_>) -> Option<ProviderOutput> {
        if self.stream_host.is_some() {
            // The stream pushes every change; the latest blob is as fresh as
            // anything a new request could return.
            return self.cached.clone().map(ProviderOutput::Config);
        }
        self.cycle_error = None;
        self.open_next(None, true, ctx)
    }

    fn cached(&self) -> Option<Arc<ClusterConfig>> {
        self.cached.clone()
    }

    fn pause(&mut self, _ctx: &mut ProviderContext<'_>) {
        // Streams stay open across refresh cycles.
    }

    fn shutdown(&mut self, ctx: &mut ProviderContext<'_>) {
        self.close(ctx);
    }

    fn config_updated(
        &mut self,
        config: &Arc<ClusterConfig>,
        _origin: ProviderKind,
        _ctx: &mut ProviderContext<'_>,
    ) {
        let mgmt = config.mgmt_hosts();
        if mgmt.is_empty() {
            return;
        }
        self.hosts.replace(mgmt);
        if self.randomize {
            self.hosts.randomize();
        }
        // Keep the cursor past the host we are streaming from.
        if let Some(current) = &self.stream_host {
            while let Some(host) = self.hosts.next(false) {
                if &host == current {
                    break;
                }
            }
        }
    }

    fn on_stream_data(
        &mut self,
        host: &HostPort,
        data: &[u8],
        ctx: &mut ProviderContext<'_>,
    ) -> Vec<ProviderOutput> {
        if self.stream_host.as_ref() != Some(host) {
            return Vec::new();
        }

        let mut outputs = Vec::new();
        for blob in self.parser.feed(data) {
            match ClusterConfig::parse(&blob, &host.host) {
                Ok(config) => {
                    let config = Arc::new(config);
                    self.cached = Some(config.clone());
                    outputs.push(ProviderOutput::Config(config));
                }
                Err(err) => {
                    tracing::warn!(host = %host, error = %err, "Unparsable configuration on stream");
                    self.close(ctx);
                    let err = match err {
                        Error::Protocol(_) => err,
                        other => ProtocolError::InvalidConfig(other.to_string()).into(),
                    };
                    outputs.extend(self.open_next(Some(err), false, ctx));
                    break;
                }
            }
        }
        outputs
    }

    fn on_stream_closed(
        &mut self,
        host: &HostPort,
        error: Error,
        ctx: &mut ProviderContext<'_>,
    ) -> Option<ProviderOutput> {
        if self.stream_host.as_ref() != Some(host) {
            return None;
        }
        tracing::info!(host = %host, error = %error, "Configuration stream closed");
        self.stream_host = None;
        self.parser.reset();
        self.open_next(Some(error), false, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::testing::{fixtures, ProviderHarness};

    #[test]
    fn test_stream_splits_blobs() {
        let mut stream = HttpConfigStream::new();
        assert!(stream.feed(b"{\"rev\":1}\n\n").is_empty());
        assert_eq!(stream.feed(b"\n\n{\"rev\":2}\n\n\n\n{\"re"), vec!["{\"rev\":1}", "{\"rev\":2}"]);
        assert_eq!(stream.pending(), 4);
        assert_eq!(stream.feed(b"v\":3}\n\n\n\n"), vec!["{\"rev\":3}"]);
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_stream_skips_empty_blobs() {
        let mut stream = HttpConfigStream::new();
        assert!(stream.feed(b"\n\n\n\n\n\n\n\n").is_empty());
    }

    #[test]
    fn test_provider_streams_successive_configs() {
        let mut harness = ProviderHarness::new();
        let hosts = HostList::new(["m1:8091".parse().unwrap()]);
        let mut p = HttpProvider::new(hosts, "travel", false);

        assert!(p.refresh(&mut harness.ctx()).is_none());
        assert_eq!(
            harness.transport.streams(),
            vec![(HostPort::new("m1", 8091), "/pools/default/bs/travel".to_string())]
        );

        let host = HostPort::new("m1", 8091);
        let mut chunk = fixtures::vbucket_config_json(1, 1, 4, 0, |_| vec![0]);
        chunk.push_str("\n\n\n\n");
        chunk.push_str(&fixtures::vbucket_config_json(2, 1, 4, 0, |_| vec![0]));
        chunk.push_str("\n\n\n\n");

        let outputs = p.on_stream_data(&host, chunk.as_bytes(), &mut harness.ctx());
        let revisions: Vec<_> = outputs
            .iter()
            .map(|o| match o {
                ProviderOutput::Config(c) => c.revision(),
                ProviderOutput::Failed(_) | ProviderOutput::Exhausted => None,
            })
            .collect();
        assert_eq!(revisions, vec![Some(1), Some(2)]);
        assert_eq!(p.cached().and_then(|c| c.revision()), Some(2));

        // Refresh with the stream open hands back the latest blob.
        assert!(matches!(p.refresh(&mut harness.ctx()), Some(ProviderOutput::Config(_))));
    }

    #[test]
    fn test_stream_close_moves_to_next_host() {
        let mut harness = ProviderHarness::new();
        let hosts = HostList::new(["m1:8091".parse().unwrap(), "m2:8091".parse().unwrap()]);
        let mut p = HttpProvider::new(hosts, "default", false);
        p.refresh(&mut harness.ctx());

        let m1 = HostPort::new("m1", 8091);
        let err: Error = NetworkError::ConnectionReset { addr: "m1:8091".into() }.into();
        assert!(p.on_stream_closed(&m1, err.clone(), &mut harness.ctx()).is_none());
        assert_eq!(p.stream_host(), Some(&HostPort::new("m2", 8091)));

        let m2 = HostPort::new("m2", 8091);
        let out = p.on_stream_closed(&m2, err, &mut harness.ctx());
        assert!(matches!(out, Some(ProviderOutput::Failed(_))));
        assert_eq!(p.state(), ProviderState::Idle);
    }

    #[test]
    fn test_shutdown_closes_stream() {
        let mut harness = ProviderHarness::new();
        let mut p = HttpProvider::new(HostList::new(["m1:8091".parse().unwrap()]), "default", false);
        p.refresh(&mut harness.ctx());
        p.shutdown(&mut harness.ctx());
        assert_eq!(harness.transport.closed(), vec![HostPort::new("m1", 8091)]);
        assert_eq!(p.state(), ProviderState::Idle);
    }
}
