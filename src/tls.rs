//! HTTPS for the action endpoint.
//!
//! Links are only ever served over TLS. On first run a self-signed
//! certificate is written to the TLS folder; operators replace `cert.pem` and
//! `key.pem` with their own and delete them to regenerate.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ConnectInfo;
use axum::Router;
use chrono::Datelike;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

const TLS_ORG: &str = "Link";

/// Write a self-signed certificate into `dir` unless `cert.pem` already
/// exists. Returns whether one was generated.
pub fn ensure_certificate(dir: &Path, hostnames: &[String]) -> anyhow::Result<bool> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let cert_path = dir.join(CERT_FILE);
    if cert_path.exists() {
        return Ok(false);
    }

    let mut names = vec!["localhost".to_string()];
    for name in hostnames {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }

    let mut params = CertificateParams::new(names).context("invalid certificate subject names")?;
    params
        .distinguished_name
        .push(DnType::OrganizationName, TLS_ORG);
    params.distinguished_name.push(DnType::CommonName, "Link");
    let today = chrono::Utc::now().date_naive();
    let (month, day) = (today.month() as u8, today.day().min(28) as u8);
    params.not_before = rcgen::date_time_ymd(today.year(), month, day);
    params.not_after = rcgen::date_time_ymd(today.year() + 1, month, day);

    let key_pair = KeyPair::generate().context("failed to generate TLS key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign TLS certificate")?;

    std::fs::write(&cert_path, cert.pem()).with_context(|| format!("failed to write {}", cert_path.display()))?;
    let key_path = dir.join(KEY_FILE);
    std::fs::write(&key_path, key_pair.serialize_pem())
        .with_context(|| format!("failed to write {}", key_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %cert_path.display(), "created self-signed TLS certificate");
    Ok(true)
}

/// Build the rustls server config from `cert.pem` and `key.pem` in `dir`.
pub fn load_server_config(dir: &Path) -> anyhow::Result<Arc<ServerConfig>> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);
    let cert_pem = std::fs::read(&cert_path).with_context(|| format!("failed to read {}", cert_path.display()))?;
    let key_pem = std::fs::read(&key_path).with_context(|| format!("failed to read {}", key_path.display()))?;

    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse certificates: {e}"))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }
    let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(|e| anyhow::anyhow!("failed to parse private key: {e}"))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("unsupported TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and key do not match")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Accept TLS connections and serve `app` until `cancel` fires.
///
/// Returns once every request already being handled has finished, so callers
/// may close the store afterwards.
pub async fn serve(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    app: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(config);
    let in_flight = TaskTracker::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };
            serve_connection(tls, peer, app, in_flight).await;
        });
    }

    tracing::info!(in_flight = in_flight.len(), "stopped accepting connections; finishing in-flight requests");
    in_flight.close();
    in_flight.wait().await;
    Ok(())
}

async fn serve_connection<S>(stream: S, peer: SocketAddr, app: Router, in_flight: TaskTracker)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer));
        in_flight.track_future(app.clone().oneshot(req))
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!(%peer, error = %e, "connection closed with error");
    }
}
