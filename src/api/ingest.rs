use actix_web::{post, web, Responder, Scope};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing_actix_web::RequestId;

use crate::service::Service;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message: String,
    pub request_id: String,
}

/// Accepts any body for a configured channel and answers once it is queued.
#[post("/{channel}")]
async fn send_message(
    service: web::Data<Service>,
    channel: web::Path<String>,
    request_id: RequestId,
    body: Bytes,
) -> actix_web::Result<impl Responder> {
    let request_id = request_id.to_string();

    service.enqueue(&channel, body, &request_id).await?;

    Ok(web::Json(SendMessageResponse {
        message: "Message sent to queue".to_owned(),
        request_id,
    }))
}

pub fn service() -> Scope {
    web::scope("/api").service(send_message)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{http::StatusCode, test, App};
    use tracing_actix_web::TracingLogger;

    use crate::service::tests::{memory_config, Unavailable};

    use super::*;

    async fn connect() -> web::Data<Service> {
        web::Data::new(Service::connect().config(memory_config()).call().await.unwrap())
    }

    #[actix_web::test]
    async fn test_send_message() {
        let service = connect().await;
        let app = test::init_service(
            App::new()
                .wrap(TracingLogger::default())
                .app_data(service.clone())
                .service(super::service()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/alpha")
            .insert_header(("content-type", "application/json"))
            .set_payload(r#"{"message":"Hello World"}"#)
            .to_request();
        let res: SendMessageResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(res.message, "Message sent to queue");
        assert!(!res.request_id.is_empty());

        let delivery = service.broker().receive("alpha", 10).await.unwrap().remove(0);
        assert_eq!(&delivery.body[..], br#"{"message":"Hello World"}"#);
        assert_eq!(delivery.attributes.request_id(), res.request_id);
    }

    #[actix_web::test]
    async fn test_unknown_channel() {
        let app = test::init_service(
            App::new()
                .wrap(TracingLogger::default())
                .app_data(connect().await)
                .service(super::service()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/gamma")
            .set_payload("{}")
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_oversized_body() {
        let app = test::init_service(
            App::new()
                .wrap(TracingLogger::default())
                .app_data(connect().await)
                .app_data(web::PayloadConfig::new(16))
                .service(super::service()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/alpha")
            .set_payload(r#"{"message":"this is more than sixteen bytes"}"#)
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[actix_web::test]
    async fn test_broker_failure() {
        let service = Service::connect()
            .config(memory_config())
            .broker(Arc::new(Unavailable))
            .call()
            .await
            .unwrap();

        let app = test::init_service(
            App::new()
                .wrap(TracingLogger::default())
                .app_data(web::Data::new(service))
                .service(super::service()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/alpha")
            .set_payload("{}")
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
