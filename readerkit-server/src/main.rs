//! HTTP surface for the reader backend: four POST endpoints, JSON in/out.

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer};
use clap::Parser;
use readerkit_core::attestation::SoftwareAttestationValidator;
use readerkit_core::clock::SystemClock;
use readerkit_core::protocol::{CertifyKeysRequest, GetIssuerListRequest, RegisterRequest};
use readerkit_core::storage::SqliteStorage;
use readerkit_server::{BackendError, BackendSettings, ReaderBackend};

#[derive(clap::Parser, Debug)]
#[command(name = "readerkit-server", about = "Reader backend for mdoc identity readers")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8807")]
    bind: String,
    /// Path to a JSON settings file; defaults apply when omitted.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// SQLite database holding nonces, registrations, and root identities.
    #[arg(long, default_value = "reader-backend.sqlite")]
    database: PathBuf,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => BackendSettings::from_json_file(path).map_err(into_io_error)?,
        None => BackendSettings::default(),
    };
    let storage = SqliteStorage::open(&args.database).map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
    })?;
    let backend = web::Data::new(
        ReaderBackend::new(
            &storage,
            settings,
            Arc::new(SoftwareAttestationValidator),
            Arc::new(SystemClock),
        )
        .map_err(into_io_error)?,
    );

    log::info!("reader backend listening on {}", args.bind);
    HttpServer::new(move || {
        App::new()
            .app_data(backend.clone())
            .route("/getNonce", web::post().to(get_nonce))
            .route("/register", web::post().to(register))
            .route("/certifyKeys", web::post().to(certify_keys))
            .route("/getIssuerList", web::post().to(get_issuer_list))
    })
    .bind(&args.bind)?
    .run()
    .await
}

async fn get_nonce(backend: web::Data<ReaderBackend>) -> HttpResponse {
    respond(backend.get_nonce())
}

async fn register(
    backend: web::Data<ReaderBackend>,
    request: web::Json<RegisterRequest>,
) -> HttpResponse {
    respond(backend.register(&request))
}

async fn certify_keys(
    backend: web::Data<ReaderBackend>,
    request: web::Json<CertifyKeysRequest>,
) -> HttpResponse {
    respond(backend.certify_keys(&request))
}

async fn get_issuer_list(
    backend: web::Data<ReaderBackend>,
    request: web::Json<GetIssuerListRequest>,
) -> HttpResponse {
    respond(backend.get_issuer_list(&request))
}

fn respond<T: serde::Serialize>(result: Result<T, BackendError>) -> HttpResponse {
    match result {
        Ok(value) => HttpResponse::Ok().json(value),
        Err(err) => {
            let status = StatusCode::from_u16(err.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            log::warn!("request failed with {status}: {err}");
            HttpResponse::build(status).body(err.to_string())
        }
    }
}

fn into_io_error(err: BackendError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
}
