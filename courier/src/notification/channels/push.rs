//! Web Push channel: VAPID-signed, aes128gcm-encrypted pushes to every
//! subscription a recipient registered.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::SigningKey;
use p256::ecdsa::signature::Signer;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};
use url::Url;

use super::{
    DeliveryError, DeliveryReceipt, DeliveryResult, DispatchOutcome, OutboundMessage,
    ProviderAdapter, RecipientDirectory, error_body, retry_after_delay, send_with_timeout,
};
use crate::config::env_string;
use crate::database::models::{NotificationDbModel, PushSubscriptionDbModel};
use crate::database::time::offset_ms;
use crate::domain::Priority;
use crate::utils::http_client::build_provider_client;
use crate::utils::text::truncate_chars;
use crate::{Error, Result};

const SALT_LEN: usize = 16;
const PUBLIC_KEY_LEN: usize = 65;
const AUTH_SECRET_LEN: usize = 16;
const RECORD_SIZE: u32 = 4096;
const MAX_PAYLOAD_BYTES: usize = 3500;
const FANOUT_CONCURRENCY: usize = 8;
const VAPID_JWT_EXP_SECS: i64 = 12 * 60 * 60;
const VAPID_JWT_SKEW_SECS: i64 = 60;
const DEFAULT_THROTTLE: Duration = Duration::from_secs(60);
const MAX_THROTTLE: Duration = Duration::from_secs(3600);

const IKM_INFO_PREFIX: &[u8] = b"WebPush: info\0";
const KEY_INFO: &[u8] = b"Content-Encoding: aes128gcm\0";
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";

/// VAPID identity of this sender.
#[derive(Debug, Clone)]
pub struct WebPushConfig {
    vapid_public_key_b64: String,
    vapid_private_key_raw: [u8; 32],
    vapid_subject: String,
    /// Seconds the push service may hold an undelivered message.
    ttl_secs: u32,
}

impl WebPushConfig {
    pub fn new(public_key_b64: &str, private_key_b64: &str, subject: &str) -> Result<Self> {
        let public_raw = decode_b64url(public_key_b64)
            .map_err(|e| Error::config(format!("Invalid VAPID public key: {e}")))?;
        if public_raw.len() != PUBLIC_KEY_LEN {
            return Err(Error::config(format!(
                "VAPID public key must decode to {PUBLIC_KEY_LEN} bytes"
            )));
        }
        let private_raw: [u8; 32] = decode_b64url(private_key_b64)
            .map_err(|e| Error::config(format!("Invalid VAPID private key: {e}")))?
            .try_into()
            .map_err(|_| Error::config("VAPID private key must decode to 32 bytes"))?;

        Ok(Self {
            vapid_public_key_b64: public_key_b64.to_string(),
            vapid_private_key_raw: private_raw,
            vapid_subject: subject.to_string(),
            ttl_secs: 24 * 60 * 60,
        })
    }

    /// Read `COURIER_VAPID_PUBLIC_KEY`, `COURIER_VAPID_PRIVATE_KEY` and
    /// `COURIER_VAPID_SUBJECT`. Returns `None` when push is not configured.
    pub fn from_env() -> Result<Option<Self>> {
        let public = env_string("COURIER_VAPID_PUBLIC_KEY");
        let private = env_string("COURIER_VAPID_PRIVATE_KEY");
        let (public, private) = match (public, private) {
            (None, None) => return Ok(None),
            (Some(public), Some(private)) => (public, private),
            _ => {
                return Err(Error::config(
                    "Both COURIER_VAPID_PUBLIC_KEY and COURIER_VAPID_PRIVATE_KEY must be set",
                ));
            }
        };
        let subject = env_string("COURIER_VAPID_SUBJECT")
            .unwrap_or_else(|| "mailto:admin@localhost".to_string());
        Self::new(&public, &private, &subject).map(Some)
    }

    pub fn vapid_public_key_b64(&self) -> &str {
        &self.vapid_public_key_b64
    }
}

#[derive(Debug, Clone)]
struct CachedVapidJwt {
    jwt: String,
    exp_unix: i64,
}

pub struct WebPushProvider {
    config: WebPushConfig,
    client: Client,
    vapid_jwt_cache: DashMap<String, CachedVapidJwt>,
}

impl WebPushProvider {
    pub fn new(config: WebPushConfig, request_timeout: Duration) -> Self {
        let client =
            build_provider_client(request_timeout, concat!("courier/", env!("CARGO_PKG_VERSION")));
        Self {
            config,
            client,
            vapid_jwt_cache: DashMap::new(),
        }
    }

    fn vapid_jwt(&self, aud: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        if let Some(entry) = self.vapid_jwt_cache.get(aud)
            && entry.exp_unix - VAPID_JWT_SKEW_SECS > now
        {
            return Ok(entry.jwt.clone());
        }

        let (jwt, exp_unix) = build_vapid_jwt(
            aud,
            &self.config.vapid_subject,
            &self.config.vapid_private_key_raw,
            now + VAPID_JWT_EXP_SECS,
        )?;
        self.vapid_jwt_cache.insert(
            aud.to_string(),
            CachedVapidJwt {
                jwt: jwt.clone(),
                exp_unix,
            },
        );
        Ok(jwt)
    }
}

#[async_trait]
impl ProviderAdapter for WebPushProvider {
    type Destination = PushSubscriptionDbModel;

    fn name(&self) -> &'static str {
        "web-push"
    }

    async fn send(&self, sub: &PushSubscriptionDbModel, message: &OutboundMessage) -> DeliveryResult {
        // Malformed keys or endpoints can never succeed.
        let prepared = (|| -> Result<(String, Vec<u8>)> {
            let aud = push_service_audience(&sub.endpoint)?;
            let client_pub: [u8; PUBLIC_KEY_LEN] = decode_b64url(&sub.p256dh)
                .ok()
                .and_then(|v| v.try_into().ok())
                .ok_or_else(|| Error::validation("invalid p256dh key"))?;
            let client_auth: [u8; AUTH_SECRET_LEN] = decode_b64url(&sub.auth)
                .ok()
                .and_then(|v| v.try_into().ok())
                .ok_or_else(|| Error::validation("invalid auth secret"))?;
            let payload = PushPayload::from_message(message).into_bytes_capped(MAX_PAYLOAD_BYTES)?;
            let body = encrypt_aes128gcm(&payload, &client_pub, &client_auth)?;
            Ok((aud, body))
        })();
        let (aud, body) =
            prepared.map_err(|e| DeliveryError::invalid_destination(e.to_string()))?;
        let jwt = self
            .vapid_jwt(&aud)
            .map_err(|e| DeliveryError::permanent(format!("cannot sign VAPID token: {e}")))?;

        let response = self
            .client
            .post(&sub.endpoint)
            .header("TTL", self.config.ttl_secs.to_string())
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .header(
                "Authorization",
                format!("vapid t={}, k={}", jwt, self.config.vapid_public_key_b64),
            )
            .header("Urgency", urgency(message.priority))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("accepted")
                .to_string();
            return Ok(DeliveryReceipt::new(location));
        }

        let retry_after = retry_after_delay(&response);
        let body = error_body(response).await;
        let err = DeliveryError::from_status(status, retry_after, &body);
        if status.as_u16() == 429 && err.retry_after().is_none() {
            return Err(DeliveryError::Transient {
                reason: err.reason().to_string(),
                retry_after: Some(DEFAULT_THROTTLE),
            });
        }
        Err(err)
    }
}

fn urgency(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "high",
        Priority::High => "normal",
        Priority::Medium => "low",
        Priority::Low => "very-low",
    }
}

#[derive(Debug, Clone, Serialize)]
struct PushPayload {
    title: String,
    body: String,
    notification_id: String,
    trigger: String,
    priority: Priority,
}

impl PushPayload {
    fn from_message(message: &OutboundMessage) -> Self {
        Self {
            title: message.content.subject.clone().unwrap_or_default(),
            body: message.content.body.clone(),
            notification_id: message.notification_id.clone(),
            trigger: message.trigger_type.clone(),
            priority: message.priority,
        }
    }

    fn into_bytes_capped(mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(&self)?;
        if bytes.len() <= max_bytes {
            return Ok(bytes);
        }
        self.title = truncate_chars(&self.title, 80);
        self.body = truncate_chars(&self.body, 200);
        Ok(serde_json::to_vec(&self)?)
    }
}

pub struct PushDispatcher {
    provider: Arc<dyn ProviderAdapter<Destination = PushSubscriptionDbModel>>,
    directory: Arc<dyn RecipientDirectory>,
    call_timeout: Duration,
}

impl PushDispatcher {
    pub fn new(
        provider: Arc<dyn ProviderAdapter<Destination = PushSubscriptionDbModel>>,
        directory: Arc<dyn RecipientDirectory>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            directory,
            call_timeout,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Send to every due subscription of the recipient.
    ///
    /// Delivered if any endpoint accepts. Endpoints the push service reports
    /// as gone are removed; rate-limited ones are throttled.
    pub(super) async fn deliver(
        &self,
        notification: &NotificationDbModel,
        message: &OutboundMessage,
        now_ms: i64,
    ) -> Result<DispatchOutcome> {
        let subscriptions = self
            .directory
            .push_subscriptions_for(&notification.recipient)
            .await?;
        if subscriptions.is_empty() {
            return Ok(DispatchOutcome::Failed(DeliveryError::invalid_destination(
                "recipient has no push subscription",
            )));
        }

        let (due, throttled): (Vec<_>, Vec<_>) = subscriptions
            .into_iter()
            .partition(|s| s.next_attempt_at.is_none_or(|at| at <= now_ms));
        if due.is_empty() {
            let resume_at = throttled
                .iter()
                .filter_map(|s| s.next_attempt_at)
                .min()
                .unwrap_or(now_ms);
            return Ok(DispatchOutcome::Failed(DeliveryError::Transient {
                reason: "all push subscriptions are throttled".to_string(),
                retry_after: Some(Duration::from_millis(
                    u64::try_from(resume_at.saturating_sub(now_ms)).unwrap_or(0),
                )),
            }));
        }

        let total = due.len();
        let results: Vec<(PushSubscriptionDbModel, DeliveryResult)> = stream::iter(due)
            .map(|sub| async move {
                let result =
                    send_with_timeout(self.provider.as_ref(), &sub, message, self.call_timeout)
                        .await;
                (sub, result)
            })
            .buffer_unordered(FANOUT_CONCURRENCY)
            .collect()
            .await;

        let mut delivered = 0usize;
        let mut invalid = 0usize;
        let mut transient: Option<DeliveryError> = None;
        let mut permanent: Option<DeliveryError> = None;

        for (sub, result) in results {
            match result {
                Ok(_) => delivered += 1,
                Err(DeliveryError::Permanent {
                    invalid_destination: true,
                    reason,
                }) => {
                    invalid += 1;
                    info!(
                        user = %sub.user_id,
                        endpoint = %sub.endpoint,
                        reason = %reason,
                        "Removing invalid push subscription"
                    );
                    if let Err(e) = self.directory.remove_push_subscription(&sub.endpoint).await {
                        warn!(endpoint = %sub.endpoint, error = %e, "Failed to remove push subscription");
                    }
                }
                Err(err @ DeliveryError::Permanent { .. }) => permanent = Some(err),
                Err(err @ DeliveryError::Transient { .. }) => {
                    if let Some(delay) = err.retry_after() {
                        let until = offset_ms(now_ms, delay.min(MAX_THROTTLE));
                        if let Err(e) = self
                            .directory
                            .throttle_push_subscription(&sub.endpoint, until)
                            .await
                        {
                            warn!(endpoint = %sub.endpoint, error = %e, "Failed to throttle push subscription");
                        }
                    }
                    transient = Some(match transient {
                        Some(prev) if prev.retry_after() <= err.retry_after() => prev,
                        _ => err,
                    });
                }
            }
        }

        if delivered > 0 {
            return Ok(DispatchOutcome::Delivered(DeliveryReceipt::new(format!(
                "delivered to {delivered}/{total} endpoints"
            ))));
        }
        if let Some(err) = transient {
            return Ok(DispatchOutcome::Failed(err));
        }
        if let Some(err) = permanent {
            return Ok(DispatchOutcome::Failed(err));
        }
        Ok(DispatchOutcome::Failed(DeliveryError::invalid_destination(format!(
            "all {invalid} push subscriptions were invalid"
        ))))
    }
}

fn push_service_audience(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint).map_err(|e| Error::validation(format!("invalid endpoint: {e}")))?;
    let host = match url.host() {
        Some(url::Host::Domain(d)) => d.to_string(),
        Some(url::Host::Ipv4(ip)) => ip.to_string(),
        Some(url::Host::Ipv6(ip)) => format!("[{ip}]"),
        None => return Err(Error::validation("endpoint has no host")),
    };
    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

fn decode_b64url(input: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input.trim_end_matches('=').as_bytes())
}

fn encode_b64url(input: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(input)
}

fn hkdf_sha256<const N: usize>(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; N]> {
    let mut okm = [0u8; N];
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, &mut okm)
        .map_err(|_| Error::Other("HKDF expand failed".to_string()))?;
    Ok(okm)
}

/// Encrypt a single-record aes128gcm body (RFC 8188 / RFC 8291).
fn encrypt_aes128gcm(
    plaintext: &[u8],
    remote_public_key: &[u8; PUBLIC_KEY_LEN],
    auth_secret: &[u8; AUTH_SECRET_LEN],
) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(Error::validation("push payload cannot be empty"));
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let remote_pub = p256::PublicKey::from_sec1_bytes(remote_public_key)
        .map_err(|_| Error::validation("invalid p256dh key"))?;
    let local_secret = EphemeralSecret::random(&mut OsRng);
    let local_point = p256::PublicKey::from(&local_secret).to_encoded_point(false);
    let local_pub: [u8; PUBLIC_KEY_LEN] = local_point
        .as_bytes()
        .try_into()
        .map_err(|_| Error::Other("unexpected local public key length".to_string()))?;
    let shared = local_secret.diffie_hellman(&remote_pub);

    let mut key_info = Vec::with_capacity(IKM_INFO_PREFIX.len() + PUBLIC_KEY_LEN * 2);
    key_info.extend_from_slice(IKM_INFO_PREFIX);
    key_info.extend_from_slice(remote_public_key);
    key_info.extend_from_slice(&local_pub);

    let ikm: [u8; 32] = hkdf_sha256(auth_secret, shared.raw_secret_bytes().as_slice(), &key_info)?;
    let cek: [u8; 16] = hkdf_sha256(&salt, &ikm, KEY_INFO)?;
    let nonce: [u8; 12] = hkdf_sha256(&salt, &ikm, NONCE_INFO)?;

    // Single record: the nonce is used as-is. 0x02 marks the last record.
    let mut padded = Vec::with_capacity(plaintext.len() + 1);
    padded.extend_from_slice(plaintext);
    padded.push(2);

    let ciphertext = Aes128Gcm::new_from_slice(&cek)
        .map_err(|_| Error::Other("invalid content encryption key".to_string()))?
        .encrypt((&nonce).into(), padded.as_slice())
        .map_err(|_| Error::Other("AES-GCM encryption failed".to_string()))?;

    let mut body = Vec::with_capacity(SALT_LEN + 4 + 1 + PUBLIC_KEY_LEN + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(PUBLIC_KEY_LEN as u8);
    body.extend_from_slice(&local_pub);
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

fn build_vapid_jwt(
    aud: &str,
    subject: &str,
    private_key_raw: &[u8; 32],
    exp_unix: i64,
) -> Result<(String, i64)> {
    #[derive(Serialize)]
    struct Claims<'a> {
        aud: &'a str,
        exp: i64,
        sub: &'a str,
    }

    let header = encode_b64url(br#"{"typ":"JWT","alg":"ES256"}"#);
    let claims = encode_b64url(&serde_json::to_vec(&Claims {
        aud,
        exp: exp_unix,
        sub: subject,
    })?);
    let signing_input = format!("{header}.{claims}");

    let signing_key = SigningKey::from_bytes(private_key_raw.into())
        .map_err(|_| Error::config("invalid VAPID private key"))?;
    let signature: p256::ecdsa::Signature = signing_key.sign(signing_input.as_bytes());
    Ok((
        format!("{}.{}", signing_input, encode_b64url(&signature.to_bytes())),
        exp_unix,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::SecretKey;

    fn keypair() -> ([u8; 32], String) {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false);
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&secret.to_bytes());
        (raw, encode_b64url(public.as_bytes()))
    }

    #[test]
    fn test_audience_keeps_scheme_host_and_port() {
        assert_eq!(
            push_service_audience("https://fcm.googleapis.com/fcm/send/abc").unwrap(),
            "https://fcm.googleapis.com"
        );
        assert_eq!(
            push_service_audience("http://127.0.0.1:8080/push/1").unwrap(),
            "http://127.0.0.1:8080"
        );
        assert!(push_service_audience("not a url").is_err());
    }

    #[test]
    fn test_config_rejects_short_keys() {
        assert!(WebPushConfig::new("AAAA", "AAAA", "mailto:a@b.c").is_err());
        let (private, public) = keypair();
        assert!(WebPushConfig::new(&public, &encode_b64url(&private), "mailto:a@b.c").is_ok());
    }

    #[test]
    fn test_vapid_jwt_verifies() {
        use p256::ecdsa::VerifyingKey;
        use p256::ecdsa::signature::Verifier;

        let (private, _) = keypair();
        let (jwt, exp) = build_vapid_jwt("https://push.example", "mailto:a@b.c", &private, 42).unwrap();
        assert_eq!(exp, 42);

        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        let claims: serde_json::Value =
            serde_json::from_slice(&decode_b64url(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["aud"], "https://push.example");

        let key = SigningKey::from_bytes((&private).into()).unwrap();
        let verifying = VerifyingKey::from(&key);
        let sig = p256::ecdsa::Signature::from_slice(&decode_b64url(parts[2]).unwrap()).unwrap();
        assert!(verifying
            .verify(format!("{}.{}", parts[0], parts[1]).as_bytes(), &sig)
            .is_ok());
    }

    #[test]
    fn test_encrypted_body_layout() {
        let (_, public) = keypair();
        let public: [u8; PUBLIC_KEY_LEN] = decode_b64url(&public).unwrap().try_into().unwrap();
        let body = encrypt_aes128gcm(b"hello", &public, &[7u8; AUTH_SECRET_LEN]).unwrap();

        assert_eq!(&body[SALT_LEN..SALT_LEN + 4], &RECORD_SIZE.to_be_bytes());
        assert_eq!(body[SALT_LEN + 4] as usize, PUBLIC_KEY_LEN);
        // header + plaintext + delimiter + 16-byte tag
        assert_eq!(body.len(), SALT_LEN + 4 + 1 + PUBLIC_KEY_LEN + 5 + 1 + 16);
    }

    #[test]
    fn test_oversized_payload_is_shrunk() {
        let payload = PushPayload {
            title: "t".repeat(500),
            body: "b".repeat(5000),
            notification_id: "n".into(),
            trigger: "new_message".into(),
            priority: Priority::High,
        };
        assert!(payload.into_bytes_capped(MAX_PAYLOAD_BYTES).unwrap().len() <= MAX_PAYLOAD_BYTES);
    }
}
