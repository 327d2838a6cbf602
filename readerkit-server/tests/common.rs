//! Shared fixtures: an in-process transport bridging a real client to a real
//! backend, a settable clock driving both sides, and a round-trip counter.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use readerkit_core::attestation::{SoftwareAttestationValidator, SoftwareDeviceAttester};
use readerkit_core::backend_client::{ReaderBackendClient, ReaderBackendClientConfig};
use readerkit_core::clock::Clock;
use readerkit_core::protocol::{
    CertifyKeysRequest, GetIssuerListRequest, RegisterRequest, METHOD_CERTIFY_KEYS,
    METHOD_GET_ISSUER_LIST, METHOD_GET_NONCE, METHOD_REGISTER,
};
use readerkit_core::secure_area::SoftwareSecureArea;
use readerkit_core::storage::{SqliteStorage, Storage};
use readerkit_core::transport::{Transport, TransportError, TransportResponse};
use readerkit_server::{BackendError, BackendSettings, ReaderBackend};
use serde_json::Value;

/// A fixed, realistic test epoch.
pub const T0: u64 = 1_750_000_000;

pub const DAY: u64 = 86_400;

/// A clock both the backend and the test advance explicitly.
pub struct TestClock(AtomicU64);

impl TestClock {
    pub fn new(at: u64) -> Self {
        Self(AtomicU64::new(at))
    }

    pub fn set(&self, at: u64) {
        self.0.store(at, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-process transport: dispatches straight into the backend handlers,
/// counting round trips and simulating connectivity loss.
pub struct LocalTransport {
    backend: Arc<ReaderBackend>,
    calls: AtomicUsize,
    offline: AtomicBool,
}

impl LocalTransport {
    pub fn new(backend: Arc<ReaderBackend>) -> Self {
        Self {
            backend,
            calls: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn post(&self, method: &str, body: Value) -> Result<TransportResponse, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Network {
                url: format!("local/{method}"),
                error: "transport disabled".to_string(),
            });
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(dispatch(&self.backend, method, body))
    }
}

fn dispatch(backend: &ReaderBackend, method: &str, body: Value) -> TransportResponse {
    match method {
        METHOD_GET_NONCE => to_response(backend.get_nonce()),
        METHOD_REGISTER => match serde_json::from_value::<RegisterRequest>(body) {
            Ok(request) => to_response(backend.register(&request)),
            Err(err) => bad_request(&err),
        },
        METHOD_CERTIFY_KEYS => match serde_json::from_value::<CertifyKeysRequest>(body) {
            Ok(request) => to_response(backend.certify_keys(&request)),
            Err(err) => bad_request(&err),
        },
        METHOD_GET_ISSUER_LIST => match serde_json::from_value::<GetIssuerListRequest>(body) {
            Ok(request) => to_response(backend.get_issuer_list(&request)),
            Err(err) => bad_request(&err),
        },
        other => TransportResponse {
            status: 404,
            body: Value::String(format!("no such method {other}")),
        },
    }
}

fn to_response<T: serde::Serialize>(result: Result<T, BackendError>) -> TransportResponse {
    match result {
        Ok(value) => TransportResponse {
            status: 200,
            body: serde_json::to_value(value).expect("response serializes"),
        },
        Err(err) => TransportResponse {
            status: err.status(),
            body: Value::String(err.to_string()),
        },
    }
}

fn bad_request(err: &serde_json::Error) -> TransportResponse {
    TransportResponse {
        status: 400,
        body: Value::String(format!("malformed request: {err}")),
    }
}

/// A full client/server pair over in-memory state.
pub struct Harness {
    pub clock: Arc<TestClock>,
    pub server_storage: Arc<SqliteStorage>,
    pub client_storage: Arc<SqliteStorage>,
    pub secure_area: Arc<SoftwareSecureArea>,
    pub transport: Arc<LocalTransport>,
    pub client: ReaderBackendClient,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(BackendSettings::default())
    }

    pub fn with_settings(settings: BackendSettings) -> Self {
        let clock = Arc::new(TestClock::new(T0));
        let server_storage = Arc::new(SqliteStorage::open_in_memory().expect("server storage"));
        let backend = Arc::new(
            ReaderBackend::new(
                server_storage.as_ref(),
                settings,
                Arc::new(SoftwareAttestationValidator),
                Arc::clone(&clock) as Arc<dyn Clock>,
            )
            .expect("build backend"),
        );
        let transport = Arc::new(LocalTransport::new(backend));
        let client_storage = Arc::new(SqliteStorage::open_in_memory().expect("client storage"));
        let secure_area = Arc::new(SoftwareSecureArea::new());
        let client = ReaderBackendClient::new(ReaderBackendClientConfig {
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            storage: Arc::clone(&client_storage) as Arc<dyn Storage>,
            secure_area: Arc::clone(&secure_area) as Arc<dyn readerkit_core::secure_area::SecureArea>,
            attester: Arc::new(SoftwareDeviceAttester::default()),
            num_keys: 10,
        })
        .expect("build client");
        Self {
            clock,
            server_storage,
            client_storage,
            secure_area,
            transport,
            client,
        }
    }

    /// Simulates a server redeploy with lost registration state: nonces and
    /// registrations vanish, root identities survive.
    pub fn wipe_server_registrations(&self) {
        for name in ["ReaderBackendNonces", "ReaderBackendClients"] {
            let table = self.server_storage.table(name).expect("table");
            for (key, _) in table.enumerate(0).expect("enumerate") {
                table.delete(&key).expect("delete");
            }
        }
    }

    /// How many key aliases the pool's secure area currently holds.
    pub fn live_key_count(&self) -> usize {
        use readerkit_core::secure_area::SecureArea;
        self.secure_area.aliases().expect("aliases").len()
    }
}

/// Leaf validity window of a returned chain, as unix seconds.
pub fn leaf_validity(chain: &readerkit_core::protocol::CertificateChain) -> (u64, u64) {
    use der::Decode;
    let leaf = x509_cert::Certificate::from_der(chain.leaf().expect("leaf present"))
        .expect("parse leaf");
    let validity = leaf.tbs_certificate.validity;
    (
        validity.not_before.to_unix_duration().as_secs(),
        validity.not_after.to_unix_duration().as_secs(),
    )
}
