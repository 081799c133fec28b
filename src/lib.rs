pub mod auth;
pub mod codec;
pub mod config;
pub mod history;
pub mod hub;
pub mod models;
pub mod presence;
pub mod rate_limit;
pub mod retention;
pub mod system;
pub mod ws_route;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use auth::{Authenticator, TrustedHeaderAuthenticator};
use config::Config;
use hub::Hub;

/// Current time in milliseconds since the epoch, the unit `Message.ts` and
/// the History Store's retention math are expressed in.
pub fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    build_rocket(Config::from_env(), Arc::new(TrustedHeaderAuthenticator))
}

pub fn rocket_with_config(config: Config, authenticator: Arc<dyn Authenticator>) -> rocket::Rocket<rocket::Build> {
    build_rocket(config, authenticator)
}

fn build_rocket(config: Config, authenticator: Arc<dyn Authenticator>) -> rocket::Rocket<rocket::Build> {
    let sweep_interval = config.sweep_interval;
    let hub = match Hub::new(config) {
        Ok(hub) => Arc::new(hub),
        Err(e) => {
            eprintln!("⚠️  failed to open history store: {}", e.0);
            std::process::exit(1);
        }
    };
    let sweeping = Arc::new(AtomicBool::new(false));

    rocket::build()
        .manage(hub.clone())
        .manage(authenticator)
        .mount("/", rocket::routes![ws_route::ws_connect, system::healthz])
        .attach(rocket::fairing::AdHoc::on_liftoff("Retention Sweeper", {
            let hub = hub.clone();
            move |_rocket| {
                Box::pin(async move {
                    retention::spawn_retention_task(hub, sweep_interval, sweeping);
                    println!("🧹 retention sweeper started");
                })
            }
        }))
}
