//! Shared fixtures for end-to-end gateway tests.
//!
//! Spins up three fake backends on ephemeral local ports (identity provider,
//! credential service, upstream LLM API) and a gateway wired to all of them,
//! then lets tests drive the gateway over real HTTP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::HeaderMap;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand_core::OsRng;
use serde_json::{Value, json};

use llm_gateway::auth::AuthGate;
use llm_gateway::auth::provision::CredentialProvisioner;
use llm_gateway::auth::resolver::ClaimsResolver;
use llm_gateway::auth::verifier::{JwksKeyCache, TokenVerifier};
use llm_gateway::config::{
    AuthConfig, CredentialServiceConfig, ProvisioningPolicy, UpstreamConfig,
};
use llm_gateway::gateway::proxy::LlmProxy;
use llm_gateway::gateway::router::{AppState, create_router};

pub const TENANT_ID: &str = "tid";
pub const APP_ID: &str = "aid";
pub const KEY_SALT: &str = "test-salt";

/// A fake identity provider: one Ed25519 keypair with a fixed `kid`.
///
/// The gateway accepts any asymmetric signing algorithm, so EdDSA tokens
/// exercise the same verification paths as production RS256 without any RSA
/// key material.
pub struct TestIdp {
    pkcs8_der: Vec<u8>,
    public_b64: String,
    kid: String,
}

impl TestIdp {
    pub fn new() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

        // Minimal PKCS#8 v1 DER wrapper around the raw 32-byte seed
        let mut pkcs8_der = vec![
            0x30, 0x2e, // SEQUENCE, 46 bytes
            0x02, 0x01, 0x00, // INTEGER version 0
            0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
            0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
            0x04, 0x22, // OCTET STRING, 34 bytes
            0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
        ];
        pkcs8_der.extend_from_slice(&signing_key.to_bytes());

        Self {
            pkcs8_der,
            public_b64,
            kid: "test-kid-1".to_string(),
        }
    }

    /// Sign arbitrary claims into a JWT carrying this IdP's `kid`.
    pub fn sign(&self, claims: Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        let key = EncodingKey::from_ed_der(&self.pkcs8_der);
        jsonwebtoken::encode(&header, &claims, &key).expect("encode test JWT")
    }

    /// The public key as a JWKS document.
    fn jwks_json(&self) -> Value {
        json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "use": "sig",
                "kid": self.kid,
                "x": self.public_b64,
            }]
        })
    }
}

/// Claims that verify but carry no identity.
pub fn bare_claims() -> Value {
    json!({
        "iss": format!("https://sts.windows.net/{TENANT_ID}/"),
        "aud": format!("api://{APP_ID}"),
        "exp": in_one_hour(),
    })
}

pub fn in_one_hour() -> i64 {
    chrono::Utc::now().timestamp() + 3600
}

pub fn an_hour_ago() -> i64 {
    chrono::Utc::now().timestamp() - 3600
}

/// Knobs for the fake backends.
pub struct StackOptions {
    /// Body the token endpoint answers on-behalf-of exchanges with.
    pub obo_response: Value,
    /// Body the Graph `/me` endpoint answers with.
    pub profile: Value,
    /// Whether the gateway gets a tenant configuration at all.
    pub configured: bool,
    /// Key value the credential service hands out on create, overriding the
    /// requested key id. Lets tests feed the gateway a hostile key.
    pub generated_key: Option<String>,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            obo_response: json!({}),
            profile: json!({}),
            configured: true,
            generated_key: None,
        }
    }
}

/// The assembled test environment.
pub struct TestStack {
    /// Base URL of the gateway under test.
    pub gateway_url: String,
    pub idp: TestIdp,
    /// Hits on the IdP's token (on-behalf-of) endpoint.
    pub exchange_hits: Arc<AtomicUsize>,
    /// Hits on the credential service's generate endpoint.
    pub create_hits: Arc<AtomicUsize>,
    /// `Authorization` values the upstream observed, in request order.
    pub upstream_auth: Arc<Mutex<Vec<String>>>,
    /// `spend` header values the upstream observed.
    pub upstream_spend: Arc<Mutex<Vec<Option<String>>>>,
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

pub async fn spawn_stack(options: StackOptions) -> TestStack {
    let idp = TestIdp::new();
    let exchange_hits = Arc::new(AtomicUsize::new(0));
    let create_hits = Arc::new(AtomicUsize::new(0));
    let upstream_auth = Arc::new(Mutex::new(Vec::new()));
    let upstream_spend = Arc::new(Mutex::new(Vec::new()));

    // Identity provider: JWKS discovery, token endpoint, Graph profile
    let idp_base = {
        let jwks = idp.jwks_json();
        let keys = move || {
            let jwks = jwks.clone();
            async move { Json(jwks) }
        };
        let obo = {
            let hits = Arc::clone(&exchange_hits);
            let body = options.obo_response.clone();
            move || {
                let hits = Arc::clone(&hits);
                let body = body.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(body)
                }
            }
        };
        let me = {
            let body = options.profile.clone();
            move || {
                let body = body.clone();
                async move { Json(body) }
            }
        };

        serve(
            Router::new()
                .route(&format!("/{TENANT_ID}/discovery/v2.0/keys"), get(keys))
                .route(&format!("/{TENANT_ID}/oauth2/v2.0/token"), post(obo))
                .route("/graph/me", get(me)),
        )
        .await
    };

    // Credential service: in-memory key store
    let credentials_base = {
        let store: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));

        let info = {
            let store = Arc::clone(&store);
            move |axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>| {
                let store = Arc::clone(&store);
                async move {
                    let found = params
                        .get("key")
                        .and_then(|k| store.lock().unwrap().get(k).cloned());
                    match found {
                        Some(record) => Ok(Json(json!({ "info": record }))),
                        None => Err((
                            axum::http::StatusCode::NOT_FOUND,
                            "key not found".to_string(),
                        )),
                    }
                }
            }
        };
        let generate = {
            let store = Arc::clone(&store);
            let hits = Arc::clone(&create_hits);
            let key_override = options.generated_key.clone();
            move |Json(body): Json<Value>| {
                let store = Arc::clone(&store);
                let hits = Arc::clone(&hits);
                let key_override = key_override.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let key_id = body["key"].as_str().unwrap_or_default().to_string();
                    let key = key_override.unwrap_or_else(|| key_id.clone());
                    let record = json!({
                        "key": key,
                        "spend": 0.0,
                        "max_budget": body["max_budget"],
                    });
                    store.lock().unwrap().insert(key_id, record.clone());
                    Json(record)
                }
            }
        };

        serve(
            Router::new()
                .route("/key/info", get(info))
                .route("/key/generate", post(generate)),
        )
        .await
    };

    // Upstream LLM API: records the headers it sees
    let upstream_base = {
        let auth_log = Arc::clone(&upstream_auth);
        let spend_log = Arc::clone(&upstream_spend);
        let handler = move |headers: HeaderMap| {
            let auth_log = Arc::clone(&auth_log);
            let spend_log = Arc::clone(&spend_log);
            async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                auth_log.lock().unwrap().push(auth);
                spend_log.lock().unwrap().push(
                    headers
                        .get("spend")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                );
                Json(json!({ "object": "chat.completion", "ok": true }))
            }
        };

        serve(Router::new().route("/v1/{*path}", any(handler))).await
    };

    // Gateway wired to the three fakes
    let auth_config = if options.configured {
        AuthConfig {
            tenant_id: Some(TENANT_ID.to_string()),
            backend_app_id: Some(APP_ID.to_string()),
            backend_app_secret: Some("secret".to_string()),
            key_salt: KEY_SALT.to_string(),
            authority: idp_base.clone(),
            graph_base_url: format!("{idp_base}/graph"),
            ..AuthConfig::default()
        }
    } else {
        AuthConfig::default()
    };

    let ad = auth_config.resolve();
    let key_source = Arc::new(JwksKeyCache::new(
        ad.as_ref().map(|ad| ad.jwks_uri()).unwrap_or_default(),
    ));
    let verifier = TokenVerifier::new(ad.clone(), key_source);
    let resolver = ClaimsResolver::new(verifier, ad);
    let provisioner = CredentialProvisioner::new(&CredentialServiceConfig {
        base_url: credentials_base,
        master_key: "master".to_string(),
        team_id: "chat-users".to_string(),
        policy: ProvisioningPolicy::default(),
    });
    let gate = Arc::new(AuthGate::new(
        resolver,
        provisioner,
        auth_config.clone(),
        auth_config.resolve_salt(),
    ));
    let proxy = Arc::new(
        LlmProxy::new(
            &UpstreamConfig {
                base_url: upstream_base,
                timeout: Duration::from_secs(5),
            },
            1024 * 1024,
        )
        .expect("build proxy"),
    );

    let gateway_url = serve(create_router(Arc::new(AppState { gate, proxy }))).await;

    TestStack {
        gateway_url,
        idp,
        exchange_hits,
        create_hits,
        upstream_auth,
        upstream_spend,
    }
}
