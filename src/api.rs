use actix_web::web;

pub mod admin;
pub mod assets;
pub mod ingest;

/// Mounts every route. The static origin is a catch-all and goes last.
pub fn configure(cfg: &mut web::ServiceConfig, admin_api: bool) {
    cfg.service(ingest::service());

    if admin_api {
        cfg.service(admin::service());
    }

    cfg.service(assets::service());
}
