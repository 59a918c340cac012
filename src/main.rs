mod auth;
mod config;
mod database;
mod error;
mod gallery;
mod handlers;
mod model;
mod qr;

use actix_web::{cookie::Key, middleware::Logger, App, HttpServer};
use config::Config;
use handlers::*;
use log::{info, warn};
use secrecy::ExposeSecret;
use std::io;

fn invalid_input<E: std::fmt::Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

#[actix_rt::main]
async fn main() -> io::Result<()> {
    let config = Config::from_env().map_err(invalid_input)?;

    let default_filter = if config.debug {
        "qrgallery=debug,actix_web=debug"
    } else {
        "qrgallery=info,actix_web=info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    std::fs::create_dir_all(config.qr_dir())?;

    let key = match config.secret_key {
        Some(ref secret) => Key::derive_from(secret.expose_secret().as_bytes()),
        None => {
            warn!("SECRET_KEY is not set; sessions will not survive a restart");
            Key::generate()
        }
    };
    let tera = tera::Tera::new(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/**/*"))
        .map_err(invalid_input)?;
    let state = State::new(config.clone(), tera);

    let addr = config.socket_addr();
    info!("Listening on {}", addr);
    HttpServer::new(move || {
        let state = state.clone();
        App::new()
            .wrap(identity_middleware())
            .wrap(session_middleware(key.clone(), config.secure_cookies))
            .wrap(frame_headers(&config))
            .wrap(Logger::default())
            .configure(move |cfg| state.configure(cfg))
    })
    .bind(addr)?
    .run()
    .await
}
