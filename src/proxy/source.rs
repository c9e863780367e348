//! File-backed proxy source
//!
//! Reads one proxy per line, either as a full URL (`socks5://host:port`) or
//! as a bare `host:port` that takes its protocol from the caller. Blank lines
//! are skipped. A repeating source reopens the file at end-of-file and starts
//! again from the first line.
//!
//! Reads use blocking file I/O; async callers pull from a blocking task.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, RotanetError};
use crate::models::{ProxyDescriptor, ProxyProtocol};

/// How lines in a proxy file are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// `scheme://[user[:pass]@]host:port`
    Typed,
    /// `host:port`, every entry using the given protocol
    Untyped(ProxyProtocol),
}

/// Supplier of proxy descriptors read from a file
#[derive(Debug)]
pub struct ProxySource {
    path: PathBuf,
    format: LineFormat,
    repeat_forever: bool,
    route_dns_via_proxy: bool,
    cursor: Option<ProxyIter>,
}

impl ProxySource {
    /// Build a source from the raw settings.
    ///
    /// `default_type` is required when lines are not self-typed.
    pub fn new(
        path: impl Into<PathBuf>,
        self_typed: bool,
        default_type: Option<ProxyProtocol>,
    ) -> Result<Self> {
        let format = if self_typed {
            LineFormat::Typed
        } else {
            let protocol = default_type.ok_or_else(|| {
                RotanetError::InvalidConfig(
                    "a proxy type must be supplied when proxy lines carry no scheme".into(),
                )
            })?;
            LineFormat::Untyped(protocol)
        };
        Ok(Self::with_format(path, format))
    }

    pub fn typed(path: impl Into<PathBuf>) -> Self {
        Self::with_format(path, LineFormat::Typed)
    }

    pub fn untyped(path: impl Into<PathBuf>, protocol: ProxyProtocol) -> Self {
        Self::with_format(path, LineFormat::Untyped(protocol))
    }

    fn with_format(path: impl Into<PathBuf>, format: LineFormat) -> Self {
        Self {
            path: path.into(),
            format,
            repeat_forever: false,
            route_dns_via_proxy: false,
            cursor: None,
        }
    }

    pub fn repeat_forever(mut self, enabled: bool) -> Self {
        self.repeat_forever = enabled;
        self
    }

    pub fn route_dns_via_proxy(mut self, enabled: bool) -> Self {
        self.route_dns_via_proxy = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> LineFormat {
        self.format
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat_forever
    }

    /// A fresh lazy sequence starting at the first line of the file.
    ///
    /// The file is not opened until the first item is pulled.
    pub fn iterate(&self) -> ProxyIter {
        ProxyIter {
            path: self.path.clone(),
            format: self.format,
            repeat_forever: self.repeat_forever,
            route_dns_via_proxy: self.route_dns_via_proxy,
            lines: None,
            line_num: 0,
            yielded_this_pass: 0,
            finished: false,
        }
    }

    /// Pull the next descriptor from this source's own sequence
    pub fn next_proxy(&mut self) -> Result<ProxyDescriptor> {
        if self.cursor.is_none() {
            self.cursor = Some(self.iterate());
        }
        match self.cursor.as_mut().and_then(Iterator::next) {
            Some(item) => item,
            None => Err(RotanetError::ExhaustedSource),
        }
    }

    /// Drop the current position; the next pull re-reads from the file start
    pub fn restart(&mut self) {
        self.cursor = None;
    }
}

/// Lazy sequence over a proxy file.
///
/// Ends after the first error; a repeating sequence also ends if a whole pass
/// over the file produced nothing.
#[derive(Debug)]
pub struct ProxyIter {
    path: PathBuf,
    format: LineFormat,
    repeat_forever: bool,
    route_dns_via_proxy: bool,
    lines: Option<Lines<BufReader<File>>>,
    line_num: usize,
    yielded_this_pass: usize,
    finished: bool,
}

impl ProxyIter {
    fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path)?;
        debug!("Reading proxies from {}", self.path.display());
        self.lines = Some(BufReader::new(file).lines());
        self.line_num = 0;
        self.yielded_this_pass = 0;
        Ok(())
    }

    fn fail(&mut self, err: RotanetError) -> Option<Result<ProxyDescriptor>> {
        self.finished = true;
        self.lines = None;
        Some(Err(err))
    }
}

impl Iterator for ProxyIter {
    type Item = Result<ProxyDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            if self.lines.is_none() {
                if let Err(e) = self.open() {
                    return self.fail(e);
                }
            }

            let next_line = self.lines.as_mut().and_then(Iterator::next);
            match next_line {
                Some(Ok(line)) => {
                    self.line_num += 1;
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return match parse_line(
                        trimmed,
                        self.format,
                        self.route_dns_via_proxy,
                        self.line_num,
                    ) {
                        Ok(proxy) => {
                            self.yielded_this_pass += 1;
                            Some(Ok(proxy))
                        }
                        Err(e) => self.fail(e),
                    };
                }
                Some(Err(e)) => return self.fail(e.into()),
                None => {
                    self.lines = None;
                    if !self.repeat_forever || self.yielded_this_pass == 0 {
                        self.finished = true;
                        return None;
                    }
                    debug!("Reached end of {}, starting over", self.path.display());
                }
            }
        }
    }
}

impl FusedIterator for ProxyIter {}

/// Parse one non-blank line of a proxy file
pub fn parse_line(
    line: &str,
    format: LineFormat,
    route_dns_via_proxy: bool,
    line_num: usize,
) -> Result<ProxyDescriptor> {
    let malformed = |reason: String| RotanetError::MalformedProxyLine {
        line: line_num,
        content: line.to_string(),
        reason,
    };

    match format {
        LineFormat::Typed => ProxyDescriptor::parse_url(line, route_dns_via_proxy)
            .map_err(|e| malformed(e.to_string())),
        LineFormat::Untyped(protocol) => {
            let (host, port) = line
                .split_once(':')
                .ok_or_else(|| malformed("expected host:port".into()))?;
            let host = host.trim();
            if host.is_empty() || host.contains(char::is_whitespace) {
                return Err(malformed("invalid host".into()));
            }
            let port: u16 = port
                .trim()
                .parse()
                .ok()
                .filter(|&port| port != 0)
                .ok_or_else(|| malformed(format!("invalid port {:?}", port)))?;

            Ok(ProxyDescriptor::new(protocol, host, port).with_route_dns_via_proxy(route_dns_via_proxy))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};

    fn proxy_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_new_requires_type_for_untyped_lines() {
        let err = ProxySource::new("proxies.txt", false, None).unwrap_err();
        assert!(matches!(err, RotanetError::InvalidConfig(_)));

        let source = ProxySource::new("proxies.txt", false, Some(ProxyProtocol::Http)).unwrap();
        assert_eq!(source.format(), LineFormat::Untyped(ProxyProtocol::Http));

        let source = ProxySource::new("proxies.txt", true, None).unwrap();
        assert_eq!(source.format(), LineFormat::Typed);
    }

    #[test]
    fn test_one_shot_source_exhausts_after_last_line() {
        let file = proxy_file("10.0.0.1:8080\n10.0.0.2:8080\n\n10.0.0.3:8080\n");
        let mut source = ProxySource::untyped(file.path(), ProxyProtocol::Http);

        let ports: Vec<String> = (0..3)
            .map(|_| source.next_proxy().unwrap().host().to_string())
            .collect();
        assert_eq!(ports, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        assert!(matches!(
            source.next_proxy(),
            Err(RotanetError::ExhaustedSource)
        ));
        assert!(matches!(
            source.next_proxy(),
            Err(RotanetError::ExhaustedSource)
        ));
    }

    #[test]
    fn test_repeating_source_cycles() {
        let file = proxy_file("socks5://a.example:1080\nhttp://user:pw@b.example:3128\n");
        let mut source = ProxySource::typed(file.path()).repeat_forever(true);

        let seen: Vec<ProxyDescriptor> = (0..7).map(|_| source.next_proxy().unwrap()).collect();
        for (i, proxy) in seen.iter().enumerate() {
            assert_eq!(proxy, &seen[i % 2], "position {}", i);
        }
        assert_eq!(seen[0].host(), "a.example");
        assert_eq!(seen[1].username(), Some("user"));
        assert_ne!(seen[0], seen[1]);
    }

    #[test]
    fn test_malformed_line_aborts_sequence() {
        let file = proxy_file("10.0.0.1:8080\nbadformat\n10.0.0.3:8080\n");
        let source = ProxySource::untyped(file.path(), ProxyProtocol::Socks5).repeat_forever(true);

        let mut iter = source.iterate();
        assert_eq!(iter.next().unwrap().unwrap().host(), "10.0.0.1");
        match iter.next() {
            Some(Err(RotanetError::MalformedProxyLine { line, content, .. })) => {
                assert_eq!(line, 2);
                assert_eq!(content, "badformat");
            }
            other => panic!("expected malformed line, got {:?}", other),
        }
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_malformed_line_then_exhausted() {
        let file = proxy_file("socks5://ok.example:1080\nnot a url\n");
        let mut source = ProxySource::typed(file.path());

        source.next_proxy().unwrap();
        assert!(matches!(
            source.next_proxy(),
            Err(RotanetError::MalformedProxyLine { line: 2, .. })
        ));
        assert!(matches!(
            source.next_proxy(),
            Err(RotanetError::ExhaustedSource)
        ));
    }

    #[test]
    fn test_untyped_lines_apply_type_and_dns_policy() {
        let file = proxy_file("  proxy.example:1080  \n");
        let mut source = ProxySource::untyped(file.path(), ProxyProtocol::Socks4)
            .route_dns_via_proxy(true);

        let proxy = assert_ok!(source.next_proxy());
        assert_eq!(proxy.protocol(), ProxyProtocol::Socks4);
        assert_eq!(proxy.host(), "proxy.example");
        assert_eq!(proxy.port(), 1080);
        assert_eq!(proxy.username(), None);
        assert!(proxy.route_dns_via_proxy());
    }

    #[test]
    fn test_parse_line_rejects_bad_untyped_lines() {
        let format = LineFormat::Untyped(ProxyProtocol::Http);
        for line in ["badformat", ":8080", "host:", "host:notaport", "host:70000", "host:0", "a b:80"] {
            let err = assert_err!(parse_line(line, format, false, 1));
            assert!(
                matches!(err, RotanetError::MalformedProxyLine { .. }),
                "{}",
                line
            );
        }
    }

    #[test]
    fn test_typed_line_without_port_is_malformed() {
        let err = assert_err!(parse_line("http://proxy.example", LineFormat::Typed, false, 3));
        assert!(matches!(err, RotanetError::MalformedProxyLine { line: 3, .. }));
    }

    #[test]
    fn test_missing_file_is_io_error_then_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ProxySource::typed(dir.path().join("missing.txt")).repeat_forever(true);

        assert!(matches!(source.next_proxy(), Err(RotanetError::Io(_))));
        assert!(matches!(
            source.next_proxy(),
            Err(RotanetError::ExhaustedSource)
        ));
    }

    #[test]
    fn test_repeating_empty_file_does_not_spin() {
        let file = proxy_file("\n\n   \n");
        let mut source = ProxySource::typed(file.path()).repeat_forever(true);
        assert!(matches!(
            source.next_proxy(),
            Err(RotanetError::ExhaustedSource)
        ));
    }

    #[test]
    fn test_restart_rereads_from_first_line() {
        let file = proxy_file("10.0.0.1:80\n10.0.0.2:80\n");
        let mut source = ProxySource::untyped(file.path(), ProxyProtocol::Http);

        assert_eq!(source.next_proxy().unwrap().host(), "10.0.0.1");
        source.restart();
        assert_eq!(source.next_proxy().unwrap().host(), "10.0.0.1");
        assert_eq!(source.next_proxy().unwrap().host(), "10.0.0.2");
    }

    #[test]
    fn test_iterate_is_independent_of_cursor() {
        let file = proxy_file("10.0.0.1:80\n10.0.0.2:80\n");
        let mut source = ProxySource::untyped(file.path(), ProxyProtocol::Http);
        source.next_proxy().unwrap();

        let hosts: Vec<String> = source
            .iterate()
            .map(|p| p.unwrap().host().to_string())
            .collect();
        assert_eq!(hosts, ["10.0.0.1", "10.0.0.2"]);
    }
}
