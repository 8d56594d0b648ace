//! Psiphon tunnel lifecycle.
//!
//! The engine does not implement the psiphon protocol; it integrates the
//! lifecycle of a psiphon client it controls. The configuration comes
//! from the backend (via [`PsiphonConfigSource`]), the working directory
//! is recreated per run so stale tunnel state cannot poison a bootstrap,
//! and the client itself sits behind the [`PsiphonRunner`] seam.
//!
//! The production runner executes the psiphon console client, which
//! reports progress as JSON notice lines on stdout; the
//! `ListeningSocksProxyPort` notice carries the local proxy port and the
//! `Tunnels` notice confirms an established tunnel.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::logger::SessionLogger;
use crate::tunnel::{StartedTunnel, SubprocessHandle, TunnelConfig};

/// Fetches the psiphon configuration bytes.
///
/// Implemented by the backend client; tests use canned sources.
#[async_trait]
pub trait PsiphonConfigSource: Send + Sync {
    /// Returns the psiphon configuration.
    async fn fetch_psiphon_config(&self, token: &CancellationToken) -> Result<Vec<u8>>;
}

/// Starts a psiphon tunnel given its configuration and working
/// directory.
#[async_trait]
pub trait PsiphonRunner: Send + Sync {
    /// Starts the tunnel and waits until it can carry traffic.
    async fn start(
        &self,
        token: &CancellationToken,
        config: &[u8],
        workdir: &Path,
        logger: &SessionLogger,
    ) -> Result<StartedTunnel>;
}

/// Entry point used by the tunnel dispatcher.
///
/// Bootstrap time is the total startup time: config fetch, workdir
/// preparation, and tunnel establishment.
pub(crate) async fn psiphon_start(
    token: &CancellationToken,
    config: &TunnelConfig,
) -> Result<StartedTunnel> {
    if config.tunnel_dir.as_os_str().is_empty() {
        return Err(Error::TunnelStart("empty tunnel dir".to_string()));
    }
    let begin = Instant::now();

    config.logger.info("tunnel: fetching psiphon configuration");
    let config_bytes = config
        .psiphon_config_source
        .fetch_psiphon_config(token)
        .await?;

    let workdir = config.tunnel_dir.join("psiphon");
    if workdir.exists() {
        tokio::fs::remove_dir_all(&workdir).await?;
    }
    tokio::fs::create_dir_all(&workdir).await?;

    let mut started = config
        .psiphon_runner
        .start(token, &config_bytes, &workdir, &config.logger)
        .await?;
    started.bootstrap_time = begin.elapsed();
    config.logger.info(&format!(
        "tunnel: psiphon ready in {:.2}s, socks at {}",
        started.bootstrap_time.as_secs_f64(),
        started.proxy_url
    ));
    Ok(started)
}

/// One JSON notice line from the console client.
pub(crate) struct Notice {
    pub(crate) notice_type: String,
    pub(crate) data: serde_json::Value,
}

/// Parses a console-client notice line; `None` for non-notice output.
pub(crate) fn parse_notice(line: &str) -> Option<Notice> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let notice_type = value.get("noticeType")?.as_str()?.to_string();
    let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
    Some(Notice { notice_type, data })
}

/// The production [`PsiphonRunner`]: executes the psiphon console
/// client and watches its notices.
pub struct ConsoleClientRunner {
    /// The console client binary to execute.
    pub binary: PathBuf,
}

impl Default for ConsoleClientRunner {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("psiphon-tunnel-core"),
        }
    }
}

#[async_trait]
impl PsiphonRunner for ConsoleClientRunner {
    async fn start(
        &self,
        token: &CancellationToken,
        config: &[u8],
        workdir: &Path,
        logger: &SessionLogger,
    ) -> Result<StartedTunnel> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let begin = Instant::now();
        let config_file = workdir.join("psiphon.config");
        tokio::fs::write(&config_file, config).await?;

        logger.info(&format!(
            "tunnel: starting {} in {}",
            self.binary.display(),
            workdir.display()
        ));
        let mut child = tokio::process::Command::new(&self.binary)
            .arg("-config")
            .arg(&config_file)
            .arg("-dataRootDirectory")
            .arg(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::TunnelStart("cannot capture console client stdout".to_string())
        })?;

        match wait_for_tunnel(token, stdout, logger).await {
            Ok(port) => {
                let proxy_url = Url::parse(&format!("socks5://127.0.0.1:{}/", port))?;
                Ok(StartedTunnel {
                    proxy_url,
                    bootstrap_time: begin.elapsed(),
                    handle: Box::new(SubprocessHandle::new(child)),
                })
            }
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(e)
            }
        }
    }
}

/// Reads notices until the proxy port is known and a tunnel is
/// established; returns the SOCKS proxy port.
async fn wait_for_tunnel(
    token: &CancellationToken,
    stdout: tokio::process::ChildStdout,
    logger: &SessionLogger,
) -> Result<u16> {
    let mut lines = BufReader::new(stdout).lines();
    let mut socks_port: Option<u16> = None;
    loop {
        let line = tokio::select! {
            l = lines.next_line() => l?,
            _ = token.cancelled() => return Err(Error::Cancelled),
        };
        let line = match line {
            Some(line) => line,
            None => {
                return Err(Error::TunnelStart(
                    "console client exited before the tunnel came up".to_string(),
                ))
            }
        };
        let notice = match parse_notice(&line) {
            Some(notice) => notice,
            None => continue,
        };
        match notice.notice_type.as_str() {
            "ListeningSocksProxyPort" => {
                socks_port = notice
                    .data
                    .get("port")
                    .and_then(|p| p.as_u64())
                    .map(|p| p as u16);
                logger.debug(&format!("tunnel: psiphon socks port {:?}", socks_port));
            }
            "Tunnels" => {
                let count = notice
                    .data
                    .get("count")
                    .and_then(|c| c.as_u64())
                    .unwrap_or(0);
                if count >= 1 {
                    if let Some(port) = socks_port {
                        return Ok(port);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notice_socks_port() {
        let line = r#"{"noticeType":"ListeningSocksProxyPort","data":{"port":1080},"timestamp":"2024-01-01T00:00:00Z"}"#;
        let notice = parse_notice(line).unwrap();
        assert_eq!(notice.notice_type, "ListeningSocksProxyPort");
        assert_eq!(notice.data.get("port").unwrap().as_u64(), Some(1080));
    }

    #[test]
    fn test_parse_notice_tunnels() {
        let line = r#"{"noticeType":"Tunnels","data":{"count":1}}"#;
        let notice = parse_notice(line).unwrap();
        assert_eq!(notice.notice_type, "Tunnels");
    }

    #[test]
    fn test_parse_notice_rejects_non_json() {
        assert!(parse_notice("plain text output").is_none());
    }

    #[test]
    fn test_parse_notice_rejects_missing_type() {
        assert!(parse_notice(r#"{"data":{}}"#).is_none());
    }

    #[tokio::test]
    async fn test_console_runner_cancelled_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let logger = SessionLogger::new(tx, false);
        let runner = ConsoleClientRunner::default();
        let token = CancellationToken::new();
        token.cancel();
        let err = runner
            .start(&token, b"{}", dir.path(), &logger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        // the config file must not have been written
        assert!(!dir.path().join("psiphon.config").exists());
    }
}
