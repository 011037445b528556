//! HTTP surface of the gateway
//!
//! The route table is registered through `configure` so the server binary
//! and the test harness build the identical service.

pub mod handlers;
pub mod types;

use actix_web::web;

/// Register every route of the HTTP surface
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(handlers::health)))
        .service(
            web::scope("/api")
                .service(
                    web::resource("/stores")
                        .route(web::post().to(handlers::create_store))
                        .route(web::get().to(handlers::list_stores)),
                )
                .service(
                    web::resource("/stores/{store_id}")
                        .route(web::get().to(handlers::get_store))
                        .route(web::delete().to(handlers::delete_store)),
                )
                .service(
                    web::resource("/stores/{store_id}/records")
                        .route(web::post().to(handlers::create_record))
                        .route(web::get().to(handlers::query_records)),
                )
                .service(
                    web::resource("/stores/{store_id}/records/{record_id}")
                        .route(web::get().to(handlers::get_record))
                        .route(web::put().to(handlers::update_record))
                        .route(web::delete().to(handlers::delete_record)),
                )
                .service(
                    web::resource("/stores/{store_id}/records/{record_id}/blobs")
                        .route(web::get().to(handlers::list_blobs)),
                )
                .service(
                    web::resource("/stores/{store_id}/records/{record_id}/blobs/{blob_name}")
                        .route(web::put().to(handlers::upload_blob))
                        .route(web::get().to(handlers::download_blob))
                        .route(web::delete().to(handlers::delete_blob)),
                )
                .service(
                    web::resource("/metadata/{metadata_type}/{metadata_id}")
                        .route(web::get().to(handlers::get_metadata))
                        .route(web::put().to(handlers::set_metadata))
                        .route(web::delete().to(handlers::delete_metadata)),
                ),
        );
}
