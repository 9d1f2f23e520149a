// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! License check against the local license service.
//!
//! The service listens on a unix socket and speaks one JSON line per
//! direction. Both request and response carry an HMAC-SHA256 signature over
//! their own JSON encoding with an empty `sig`. The key is derived with
//! HKDF-SHA256 from a shared master secret, salted with the machine's unique
//! id and short hostname, so a response captured on one host does not verify
//! on another.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::LicenseConfig;
use crate::scheduler::bounded_period;

const HKDF_INFO: &[u8] = b"logrelay-license-hkdf";
const OP_CHECK: &str = "CHECK";

/// Budget for connecting, and separately for the whole exchange.
pub const IPC_TIMEOUT: Duration = Duration::from_secs(3);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("license service unavailable: {0}")]
    IpcUnavailable(String),
    #[error("license response signature mismatch")]
    BadSignature,
    #[error("not licensed: {0}")]
    NotLicensed(String),
    #[error("license key: {0}")]
    Key(String),
    #[error("license protocol error: {0}")]
    Protocol(String),
}

/// One signed line sent to the license service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRequest {
    pub op: String,
    pub package: String,
    pub ts: i64,
    pub nonce: String,
    pub sig: String,
}

/// The service's answer. Only trusted after [`LicenseResponse::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseResponse {
    pub ok: bool,
    pub licensed: bool,
    pub mode: String,
    pub valid_until: i64,
    pub reason: String,
    pub ts: i64,
    pub sig: String,
}

/// Derives the 32-byte signing key.
pub fn derive_key(
    master_secret: &str,
    unique_id: &str,
    short_hostname: &str,
) -> Result<[u8; 32], LicenseError> {
    let salt = format!("{unique_id}:{short_hostname}");
    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), master_secret.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| LicenseError::Key(e.to_string()))?;
    Ok(key)
}

fn mac(key: &[u8], payload: &[u8]) -> Result<HmacSha256, LicenseError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| LicenseError::Key(e.to_string()))?;
    mac.update(payload);
    Ok(mac)
}

/// Hex HMAC-SHA256 of `payload`.
pub fn sign(key: &[u8], payload: &[u8]) -> Result<String, LicenseError> {
    Ok(hex::encode(mac(key, payload)?.finalize().into_bytes()))
}

impl LicenseRequest {
    pub fn signed(package: &str, ts: i64, nonce: &str, key: &[u8]) -> Result<Self, LicenseError> {
        let mut request = Self {
            op: OP_CHECK.to_string(),
            package: package.to_string(),
            ts,
            nonce: nonce.to_string(),
            sig: String::new(),
        };
        let payload =
            serde_json::to_vec(&request).map_err(|e| LicenseError::Protocol(e.to_string()))?;
        request.sig = sign(key, &payload)?;
        Ok(request)
    }
}

impl LicenseResponse {
    /// Fills in `sig` for this response. Used by the service side.
    pub fn sign(mut self, key: &[u8]) -> Result<Self, LicenseError> {
        self.sig = String::new();
        let payload = serde_json::to_vec(&self).map_err(|e| LicenseError::Protocol(e.to_string()))?;
        self.sig = sign(key, &payload)?;
        Ok(self)
    }

    /// Checks `sig` in constant time.
    pub fn verify(&self, key: &[u8]) -> Result<(), LicenseError> {
        if self.sig.trim().is_empty() {
            return Err(LicenseError::BadSignature);
        }
        let signature = hex::decode(self.sig.trim()).map_err(|_| LicenseError::BadSignature)?;
        let unsigned = Self {
            sig: String::new(),
            ..self.clone()
        };
        let payload =
            serde_json::to_vec(&unsigned).map_err(|e| LicenseError::Protocol(e.to_string()))?;
        mac(key, &payload)?
            .verify_slice(&signature)
            .map_err(|_| LicenseError::BadSignature)
    }
}

/// Talks to the local license service over its unix socket.
#[derive(Debug, Clone)]
pub struct LicenseClient {
    socket_path: PathBuf,
    key: [u8; 32],
}

impl LicenseClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
        Self {
            socket_path: socket_path.into(),
            key,
        }
    }

    /// Builds a client from the license settings, the machine's unique id and
    /// its hostname.
    pub fn from_config(config: &LicenseConfig) -> Result<Self, LicenseError> {
        let secret = config
            .master_secret
            .as_deref()
            .ok_or_else(|| LicenseError::Key("no master secret configured".to_string()))?;
        let unique_id = read_unique_id(&config.unique_id_path)?;
        let key = derive_key(secret, &unique_id, &short_hostname()?)?;
        Ok(Self::new(&config.socket_path, key))
    }

    /// Asks the service whether `package` is licensed.
    pub async fn check(&self, package: &str) -> Result<LicenseResponse, LicenseError> {
        let package = package.trim();
        if package.is_empty() {
            return Err(LicenseError::Protocol("empty package name".to_string()));
        }
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let request =
            LicenseRequest::signed(package, chrono::Utc::now().timestamp(), &nonce, &self.key)?;

        let response = self.exchange(&request).await?;
        response.verify(&self.key)?;

        if !response.ok {
            return Err(LicenseError::NotLicensed(reason_or(&response.reason, "ok=false")));
        }
        if !response.licensed {
            return Err(LicenseError::NotLicensed(reason_or(
                &response.reason,
                "not licensed",
            )));
        }
        debug!("License for {package} valid until {}", response.valid_until);
        Ok(response)
    }

    async fn exchange(&self, request: &LicenseRequest) -> Result<LicenseResponse, LicenseError> {
        let stream = timeout(IPC_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| LicenseError::IpcUnavailable("connect timed out".to_string()))?
            .map_err(|e| {
                LicenseError::IpcUnavailable(format!("{}: {e}", self.socket_path.display()))
            })?;

        let mut line =
            serde_json::to_vec(request).map_err(|e| LicenseError::Protocol(e.to_string()))?;
        line.push(b'\n');

        let exchange = async {
            let mut stream = BufReader::new(stream);
            stream.get_mut().write_all(&line).await?;
            let mut reply = String::new();
            stream.read_line(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        };
        let reply = timeout(IPC_TIMEOUT, exchange)
            .await
            .map_err(|_| LicenseError::Protocol("exchange timed out".to_string()))?
            .map_err(|e| LicenseError::Protocol(e.to_string()))?;

        serde_json::from_str(reply.trim())
            .map_err(|e| LicenseError::Protocol(format!("invalid response: {e}")))
    }
}

fn reason_or(reason: &str, fallback: &str) -> String {
    let reason = reason.trim();
    if reason.is_empty() {
        fallback.to_string()
    } else {
        reason.to_string()
    }
}

fn read_unique_id(path: &Path) -> Result<String, LicenseError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| LicenseError::Key(format!("{}: {e}", path.display())))?;
    let id = raw.trim();
    if id.is_empty() {
        return Err(LicenseError::Key(format!("{} is empty", path.display())));
    }
    Ok(id.to_string())
}

fn short_hostname() -> Result<String, LicenseError> {
    let host = nix::unistd::gethostname()
        .map_err(|e| LicenseError::Key(format!("hostname: {e}")))?
        .to_string_lossy()
        .trim()
        .to_string();
    match host.split('.').next() {
        Some(short) if !short.is_empty() => Ok(short.to_string()),
        _ => Err(LicenseError::Key("empty hostname".to_string())),
    }
}

/// Re-checks the license every `every` and cancels `shutdown` on the first
/// failure.
pub fn spawn_monitor(
    client: LicenseClient,
    package: String,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let every = bounded_period(every);
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match client.check(&package).await {
                        Ok(_) => debug!("License re-check passed"),
                        Err(e) => {
                            error!("License re-check failed, shutting down: {e}");
                            shutdown.cancel();
                            break;
                        }
                    }
                }
            }
        }
        info!("License monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    const KEY: [u8; 32] = [7u8; 32];

    /// Answers one request with `respond(request)`, signed with `key` when set.
    fn serve_once<F>(path: &Path, key: Option<[u8; 32]>, respond: F) -> JoinHandle<LicenseRequest>
    where
        F: FnOnce(&LicenseRequest) -> LicenseResponse + Send + 'static,
    {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            let request: LicenseRequest = serde_json::from_str(line.trim()).unwrap();
            let mut response = respond(&request);
            if let Some(key) = key {
                response = response.sign(&key).unwrap();
            }
            let mut out = serde_json::to_vec(&response).unwrap();
            out.push(b'\n');
            stream.get_mut().write_all(&out).await.unwrap();
            request
        })
    }

    fn licensed() -> LicenseResponse {
        LicenseResponse {
            ok: true,
            licensed: true,
            mode: "full".to_string(),
            valid_until: 1_900_000_000,
            ..LicenseResponse::default()
        }
    }

    #[test]
    fn test_derive_key_depends_on_salt() {
        let a = derive_key("secret", "uid-1", "fw").unwrap();
        assert_eq!(a, derive_key("secret", "uid-1", "fw").unwrap());
        assert_ne!(a, derive_key("secret", "uid-2", "fw").unwrap());
        assert_ne!(a, derive_key("other", "uid-1", "fw").unwrap());
    }

    #[test]
    fn test_request_signature_covers_unsigned_json() {
        let request = LicenseRequest::signed("logrelay", 100, "abc", &KEY).unwrap();
        let unsigned = LicenseRequest {
            sig: String::new(),
            ..request.clone()
        };
        let payload = serde_json::to_vec(&unsigned).unwrap();
        assert_eq!(request.sig, sign(&KEY, &payload).unwrap());
        assert_eq!(request.op, "CHECK");
    }

    #[test]
    fn test_response_verification() {
        let signed = licensed().sign(&KEY).unwrap();
        signed.verify(&KEY).unwrap();
        assert!(matches!(signed.verify(&[1u8; 32]), Err(LicenseError::BadSignature)));

        let tampered = LicenseResponse {
            valid_until: 2_000_000_000,
            ..signed
        };
        assert!(matches!(tampered.verify(&KEY), Err(LicenseError::BadSignature)));
        assert!(matches!(licensed().verify(&KEY), Err(LicenseError::BadSignature)));
    }

    #[tokio::test]
    async fn test_check_licensed() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("license.sock");
        let server = serve_once(&socket, Some(KEY), |_| licensed());

        let response = LicenseClient::new(&socket, KEY).check("logrelay").await.unwrap();
        assert_eq!(response.mode, "full");

        let request = server.await.unwrap();
        assert_eq!(request.package, "logrelay");
        assert_eq!(request.nonce.len(), 32);
    }

    #[tokio::test]
    async fn test_check_not_licensed_carries_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("license.sock");
        let _server = serve_once(&socket, Some(KEY), |_| LicenseResponse {
            ok: true,
            licensed: false,
            reason: "expired".to_string(),
            ..LicenseResponse::default()
        });

        let err = LicenseClient::new(&socket, KEY).check("logrelay").await.unwrap_err();
        assert_eq!(err.to_string(), "not licensed: expired");
    }

    #[tokio::test]
    async fn test_check_rejects_foreign_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("license.sock");
        let _server = serve_once(&socket, Some([9u8; 32]), |_| licensed());

        let err = LicenseClient::new(&socket, KEY).check("logrelay").await.unwrap_err();
        assert!(matches!(err, LicenseError::BadSignature));
    }

    #[tokio::test]
    async fn test_check_without_service() {
        let tmp = tempfile::tempdir().unwrap();
        let err = LicenseClient::new(tmp.path().join("absent.sock"), KEY)
            .check("logrelay")
            .await
            .unwrap_err();
        assert!(matches!(err, LicenseError::IpcUnavailable(_)));
    }

    #[tokio::test]
    async fn test_monitor_cancels_shutdown_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let handle = spawn_monitor(
            LicenseClient::new(tmp.path().join("absent.sock"), KEY),
            "logrelay".to_string(),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        timeout(Duration::from_secs(5), shutdown.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_from_config_requires_secret() {
        let config = LicenseConfig::default();
        assert!(matches!(
            LicenseClient::from_config(&config),
            Err(LicenseError::Key(_))
        ));
    }
}
